//! Global constants, string interning, symbol caching

use super::harness::*;

// ============================================================================
// Global promotion (scenario 5)
// ============================================================================

#[test]
fn test_top_level_assignment_promotes_to_global() {
    let asm = compile_asm("(assign NewConst 5)");
    assert_eq!(count_lines(&asm, ".comm\tNewConst, 4, 4"), 1);
    assert!(asm.contains("movl\t%eax, NewConst"));
}

#[test]
fn test_global_emitted_once_despite_reassignment() {
    let asm = compile_asm("(assign X 1) (assign X 2) (assign Y (add X X))");
    assert_eq!(count_lines(&asm, ".comm\tX, 4, 4"), 1);
    assert_eq!(count_lines(&asm, ".comm\tY, 4, 4"), 1);
}

#[test]
fn test_class_names_become_globals() {
    let asm = compile_asm("(class A Object)");
    assert_eq!(count_lines(&asm, ".comm\tA, 4, 4"), 1);
    assert_eq!(count_lines(&asm, ".comm\tObject, 4, 4"), 1);
}

// ============================================================================
// possible_callm read/write asymmetry
// ============================================================================

#[test]
fn test_free_identifier_read_is_implicit_self_send() {
    let asm = compile_asm(
        "(class C Object (defm foo () (return 1)))
         (assign R foo)",
    );
    assert!(asm.contains("call\t*__voff__foo+16(%eax)"));
    // The identifier never becomes a global.
    assert!(!asm.contains(".comm\tfoo"));
}

#[test]
fn test_free_identifier_write_does_not_emit_a_call() {
    let (asm, _) = compile_src("(assign counter 1)");
    assert!(asm.contains(".comm\tcounter, 4, 4"));
    assert!(!asm.contains("call\t*"));
    assert!(!asm.contains("__send__"));
}

// ============================================================================
// String interning
// ============================================================================

#[test]
fn test_identical_strings_share_a_label() {
    let asm = compile_asm(
        "(let (x) (assign x \"hello\") (assign x \"hello\") (assign x \"world\"))",
    );
    assert_eq!(count_lines(&asm, ".string\t\"hello\""), 1);
    assert_eq!(count_lines(&asm, ".string\t\"world\""), 1);
}

#[test]
fn test_distinct_strings_get_distinct_labels() {
    let asm = compile_asm("(let (x) (assign x \"a\") (assign x \"b\"))");
    let a = line_of(&asm, ".string\t\"a\"");
    let b = line_of(&asm, ".string\t\"b\"");
    assert_ne!(a, b);
}

// ============================================================================
// Symbol literals
// ============================================================================

#[test]
fn test_symbol_literal_initialised_once() {
    let asm = compile_asm("(let (s) (assign s :hello) (assign s :hello))");
    assert_eq!(count_lines(&asm, ".comm\t__sym_hello, 4, 4"), 1);
    // One runtime allocation; the second use loads the cached global.
    assert_eq!(count_lines(&asm, "call\t__get_symbol"), 1);
    assert_eq!(count_lines(&asm, ".string\t\"hello\""), 1);
}

#[test]
fn test_symbol_cleans_label_characters() {
    let asm = compile_asm("(let (s) (assign s :empty?))");
    assert!(asm.contains(".comm\t__sym_empty__Q, 4, 4"));
}
