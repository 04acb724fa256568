//! Control flow: truthiness, short circuits, loops, non-local return

use super::harness::*;

// ============================================================================
// Conditionals
// ============================================================================

#[test]
fn test_integer_condition_uses_generic_test() {
    let asm = compile_asm("(if 1 2 3)");
    assert!(asm.contains("testl\t%eax, %eax"));
    assert_before(&asm, "testl\t%eax, %eax", "movl\t$2, %eax");
}

#[test]
fn test_object_condition_checks_nil_and_false() {
    // `self` at top level is the nil object, so the condition is typed.
    let asm = compile_asm("(if self 1 2)");
    assert!(asm.contains("cmpl\tnil, %eax"));
    assert!(asm.contains("cmpl\tfalse, %eax"));
    assert_before(&asm, "cmpl\tnil, %eax", "cmpl\tfalse, %eax");
    // Both falsey comparisons sit before the then arm.
    assert_before(&asm, "cmpl\tfalse, %eax", "movl\t$1, %eax");
}

#[test]
fn test_ternif_rewrites_to_if() {
    let asm = compile_asm("(ternif 1 (ternalt 2 3))");
    assert_before(&asm, "testl\t%eax, %eax", "movl\t$2, %eax");
    assert_before(&asm, "movl\t$2, %eax", "movl\t$3, %eax");
}

// ============================================================================
// Short circuits
// ============================================================================

#[test]
fn test_and_evaluates_right_only_on_taken_path() {
    let asm = compile_asm("(and 1 2)");
    // The right operand is emitted strictly after the conditional jump.
    assert_before(&asm, "je\t", "movl\t$2, %eax");
}

#[test]
fn test_or_parks_left_in_temporary() {
    let asm = compile_asm("(or 1 2)");
    // __left lives in the first local slot.
    assert!(asm.contains("movl\t%eax, -4(%ebp)"));
    assert_before(&asm, "je\t", "movl\t$2, %eax");
}

// ============================================================================
// Loops
// ============================================================================

#[test]
fn test_while_branches_back_to_condition() {
    let asm = compile_asm("(while 1 2)");
    assert!(asm.contains(".L0:"));
    assert!(asm.contains("jmp\t.L0"));
    assert_before(&asm, ".L0:", "je\t.L1");
    assert_before(&asm, "jmp\t.L0", ".L1:");
}

// ============================================================================
// let scoping
// ============================================================================

#[test]
fn test_let_allocates_and_releases_slots() {
    let asm = compile_asm("(let (a b) (assign a 1) (assign b 2) a)");
    assert!(asm.contains("subl\t$8, %esp"));
    assert!(asm.contains("addl\t$8, %esp"));
    assert!(asm.contains("movl\t%eax, -4(%ebp)"));
    assert!(asm.contains("movl\t%eax, -8(%ebp)"));
}

#[test]
fn test_nested_let_slots_stack_downward() {
    let asm = compile_asm("(let (a) (assign a 1) (let (b) (assign b 2)))");
    assert!(asm.contains("movl\t%eax, -4(%ebp)"));
    assert!(asm.contains("movl\t%eax, -8(%ebp)"));
}

// ============================================================================
// Environment and non-local return
// ============================================================================

#[test]
fn test_block_creation_saves_frame_for_preturn() {
    // Full round trip: a method creates a block in an environment's
    // scope and passes it as the call's block argument; the block
    // non-locally returns through the method.
    let asm = compile_asm(
        "(class C Object
           (defm each () (yield 0))
           (defm run ()
             (let (__env__)
               (callm self each () (proc (__env__) (preturn 7))))))",
    );
    let run = line_of(&asm, "__method_C_run:");
    let block = line_of(&asm, "__lambda_0:");
    // Creation stores the current frame pointer into env slot 0.
    let grab = line_of(&asm, "movl\t%ebp, %eax");
    let save = line_of(&asm, "movl\t%eax, (%edx)");
    assert!(run < grab && grab < save && save < block, "\n{}", asm);
    // The block's address then becomes the closure argument.
    assert_before(&asm, "movl\t%eax, (%edx)", "movl\t$__lambda_0, %eax");
    // preturn restores the saved frame pointer inside the block.
    let restore = line_of(&asm, "movl\t(%eax), %ebp");
    assert!(block < restore, "\n{}", asm);
}

#[test]
fn test_lambda_without_environment_skips_frame_save() {
    // No __env__ in scope at the creation site: nothing to save into.
    let asm = compile_asm("(let (f) (assign f (lambda () 1)))");
    assert!(!asm.contains("movl\t%ebp, %eax"));
}

#[test]
fn test_preturn_restores_frame_from_env_slot_zero() {
    let asm = compile_asm("(proc (__env__) (preturn 7))");
    let label = line_of(&asm, "__lambda_0:");
    let body: Vec<&str> = asm.lines().skip(label).take(40).collect();
    let body = body.join("\n");
    assert!(body.contains("movl\t$7, %eax"));
    assert!(body.contains("pushl\t%eax"));
    assert!(body.contains("movl\t(%eax), %ebp"));
    assert!(body.contains("popl\t%eax"));
}

#[test]
fn test_env_slot_zero_is_not_an_object() {
    // Slot 0 holds the raw frame pointer: a generic truthiness test.
    let raw = compile_asm("(lambda (__env__) (if (index __env__ 0) 1 2))");
    assert!(!raw.contains("cmpl\tnil, %eax"));
    // Any other slot is an object: nil/false double test.
    let boxed = compile_asm("(lambda (__env__) (if (index __env__ 1) 1 2))");
    assert!(boxed.contains("cmpl\tnil, %eax"));
    assert!(boxed.contains("cmpl\tfalse, %eax"));
}

#[test]
fn test_stackframe_yields_frame_pointer() {
    let asm = compile_asm("(let (f) (assign f (stackframe)))");
    assert!(asm.contains("movl\t%ebp, %eax"));
}
