//! VTable layout and method dispatch obligations

use super::harness::*;

// ============================================================================
// Offset assignment
// ============================================================================

#[test]
fn test_offsets_follow_first_encounter_order() {
    let asm = compile_asm(
        "(class A Object (defm c () 0) (defm a () 0))
         (class B Object (defm b () 0) (defm a () 0))",
    );
    assert!(asm.contains(".equ\t__voff__c, 0"));
    assert!(asm.contains(".equ\t__voff__a, 4"));
    assert!(asm.contains(".equ\t__voff__b, 8"));
    // A name re-encountered keeps its first offset.
    assert_eq!(count_lines(&asm, ".equ\t__voff__a,"), 1);
}

#[test]
fn test_identical_input_gives_identical_output() {
    let src = "(class A Object (defm x () (return 1)))
               (let (v) (assign v (callm self x ())))";
    let first = compile_asm(src);
    let second = compile_asm(src);
    assert_eq!(first, second);
}

// ============================================================================
// Method definition (scenario 1)
// ============================================================================

#[test]
fn test_method_definition_emits_label_and_vtable_store() {
    let asm = compile_asm("(class C Object (defm foo () (return 42)))");
    assert!(asm.contains("__method_C_foo:"));
    assert!(asm.contains("movl\t$__voff__foo, 4(%esp)"));
    assert!(asm.contains("movl\t$__method_C_foo, 8(%esp)"));
    assert!(asm.contains("call\t__set_vtable"));
    // The body returns 42 in the result register.
    assert_before(&asm, "__method_C_foo:", "movl\t$42, %eax");
}

// ============================================================================
// Inheritance (scenario 3)
// ============================================================================

#[test]
fn test_subclass_does_not_redefine_inherited_slot() {
    let asm = compile_asm(
        "(class A Object (defm x () (return 1)))
         (class B A (defm y () (return 2)))",
    );
    assert!(asm.contains(".equ\t__voff__x, 0"));
    assert!(asm.contains(".equ\t__voff__y, 4"));
    assert!(asm.contains("__method_A_x:"));
    assert!(asm.contains("__method_B_y:"));
    // Only A writes the x slot; B inherits it through the runtime copy.
    assert_eq!(count_lines(&asm, "movl\t$__voff__x, 4(%esp)"), 1);
}

// ============================================================================
// Missing-method thunks and the base vtable
// ============================================================================

#[test]
fn test_base_vtable_is_padded_with_thunks() {
    let asm = compile_asm("(class C Object (defm foo () 0))");
    assert!(asm.contains("__base_vtable:"));
    // Four header slots precede the method pointers.
    assert_eq!(count_lines(&asm, ".long\t0"), 4);
    assert!(asm.contains(".long\t__vtable_missing_thunk_foo"));
}

#[test]
fn test_thunk_prepends_symbol_and_jumps() {
    let asm = compile_asm("(class C Object (defm foo () 0))");
    let thunk = line_of(&asm, "__vtable_missing_thunk_foo:");
    let body: Vec<&str> = asm.lines().skip(thunk).take(10).collect();
    let body = body.join("\n");
    assert!(body.contains("call\t__get_string"));
    assert!(body.contains("call\t__get_symbol"));
    assert!(body.contains("addl\t$1, %ebx"));
    assert!(body.contains("jmp\t__method_missing"));
}

#[test]
fn test_cleaned_operator_labels() {
    let asm = compile_asm("(class A Object (defm == (o) 0) (defm []= (i v) 0))");
    assert!(asm.contains(".equ\t__voff____eq, 0"));
    assert!(asm.contains(".equ\t__voff____NDXassign, 4"));
    assert!(asm.contains("__method_A___eq:"));
    assert!(asm.contains("__method_A___NDXassign:"));
}
