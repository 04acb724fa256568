//! Call shapes: callm, super, yield, splat

use super::harness::*;
use sable_compiler::Warning;

// ============================================================================
// Method call window (scenario 2)
// ============================================================================

#[test]
fn test_self_send_builds_closure_self_args_window() {
    let asm = compile_asm(
        "(class C Object
           (defm bar (a b) (return 0))
           (defm test () (callm self bar (1 2))))",
    );
    // Window of (closure, self, 1, 2).
    assert!(asm.contains("subl\t$16, %esp"));
    assert!(asm.contains("movl\t%eax, 4(%esp)"));
    assert!(asm.contains("movl\t%eax, 8(%esp)"));
    assert!(asm.contains("movl\t%eax, 12(%esp)"));
    assert!(asm.contains("movl\t$4, %ebx"));
    // Receiver into %esi, class pointer chase, vtable dispatch.
    assert_before(&asm, "movl\t4(%esp), %esi", "call\t*__voff__bar+16(%eax)");
    assert_before(&asm, "movl\t(%esi), %eax", "call\t*__voff__bar+16(%eax)");
}

#[test]
fn test_receiver_reloaded_after_non_self_call() {
    let asm = compile_asm(
        "(class C Object
           (defm bar () 0)
           (defm test (o) (callm o bar ())))",
    );
    let call = line_of(&asm, "call\t*__voff__bar+16(%eax)");
    // `self` comes back from its argument slot after the call.
    let tail: Vec<&str> = asm.lines().skip(call).take(4).collect();
    assert!(
        tail.iter().any(|l| l.contains("movl\t12(%ebp), %esi")),
        "missing self reload after call\n---\n{}",
        asm
    );
}

// ============================================================================
// Unknown method rewrite (scenario 6)
// ============================================================================

#[test]
fn test_unknown_method_rewrites_to_send_with_warning() {
    let (asm, warnings) = compile_src("(let (o) (callm o nonexistent ()))");
    assert!(warnings
        .iter()
        .any(|w| matches!(w, Warning::UnknownMethod { name, .. } if name == "nonexistent")));
    // The call dispatches through __send__ with the symbol prepended.
    assert!(asm.contains(".equ\t__voff____send__,"));
    assert!(asm.contains("call\t*__voff____send__+16(%eax)"));
    assert!(asm.contains(".comm\t__sym_nonexistent, 4, 4"));
}

#[test]
fn test_known_method_does_not_warn() {
    let (_, warnings) = compile_src(
        "(class C Object (defm bar () 0) (defm test () (callm self bar ())))",
    );
    assert!(warnings.is_empty(), "unexpected warnings: {:?}", warnings);
}

// ============================================================================
// super
// ============================================================================

#[test]
fn test_super_without_ancestor_definition_warns() {
    let (_, warnings) = compile_src(
        "(class A Object (defm other () 0))
         (class B A (defm m () (super)))",
    );
    assert!(warnings
        .iter()
        .any(|w| matches!(w, Warning::NoSuperMethod { class, name, .. }
            if class == "B" && name == "m")));
}

#[test]
fn test_super_with_inherited_definition_does_not_warn() {
    let (_, warnings) = compile_src(
        "(class A Object (defm m () (return 1)))
         (class B A (defm m () (super)))",
    );
    assert!(!warnings
        .iter()
        .any(|w| matches!(w, Warning::NoSuperMethod { .. })));
}

#[test]
fn test_super_chases_superclass_pointer() {
    let asm = compile_asm(
        "(class A Object (defm m () (return 1)))
         (class B A (defm m () (super)))",
    );
    let label = line_of(&asm, "__method_B_m:");
    let body: Vec<&str> = asm.lines().skip(label).take(40).collect();
    let body = body.join("\n");
    assert!(body.contains("movl\t12(%eax), %eax"));
    assert!(body.contains("call\t*__voff__m+16(%eax)"));
}

// ============================================================================
// yield
// ============================================================================

#[test]
fn test_yield_dispatches_call_on_closure() {
    let asm = compile_asm(
        "(class Proc Object (defm call (x) 0))
         (class C Object (defm each () (yield 1)))",
    );
    let label = line_of(&asm, "__method_C_each:");
    let body: Vec<&str> = asm.lines().skip(label).take(40).collect();
    let body = body.join("\n");
    // The closure argument (slot 0) becomes the receiver.
    assert!(body.contains("movl\t8(%ebp), %eax"));
    assert!(body.contains("call\t*__voff__call+16(%eax)"));
}

// ============================================================================
// Splat expansion
// ============================================================================

#[test]
fn test_splat_argument_expands_at_runtime() {
    let asm = compile_asm(
        "(class C Object
           (defm m (a) 0)
           (defm t (xs) (callm self m ((splat xs)))))",
    );
    // Saved %esp and length live in hidden locals.
    assert!(asm.contains("movl\t%esp, -4(%ebp)"));
    assert!(asm.contains("movl\t%ecx, -8(%ebp)"));
    // The copy loop pushes elements from the length-prefixed chunk.
    assert!(asm.contains("pushl\t(%edx,%ecx,4)"));
    assert!(asm.contains("decl\t%ecx"));
    // The argument count combines the fixed part and the runtime length.
    assert!(asm.contains("movl\t$2, %ebx"));
    assert!(asm.contains("addl\t-8(%ebp), %ebx"));
    // The stack is restored from the saved slot.
    assert!(asm.contains("movl\t-4(%ebp), %esp"));
}
