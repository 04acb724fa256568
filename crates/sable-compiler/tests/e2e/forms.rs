//! Rewritten forms: hash, case, incr, deref, rescue

use super::harness::*;
use sable_compiler::{CompileError, Warning};

#[test]
fn test_hash_literal_builds_and_fills_a_hash() {
    let asm = compile_asm(
        "(class Hash Object (defm new () 0) (defm []= (k v) 0))
         (hash (pair 1 2) (pair 3 4))",
    );
    assert!(asm.contains("call\t*__voff__new+16(%eax)"));
    // One []= send per pair.
    assert_eq!(count_lines(&asm, "call\t*__voff____NDXassign+16(%eax)"), 2);
    assert!(asm.contains(".comm\tHash, 4, 4"));
}

#[test]
fn test_hash_entry_must_be_a_pair() {
    let err = compile_err("(hash 5)");
    assert!(matches!(err, CompileError::MalformedHash { .. }));
}

#[test]
fn test_case_rewrites_whens_to_case_equality() {
    let asm = compile_asm(
        "(class A Object (defm === (o) 0))
         (case 1 (when 2 3) (else 4))",
    );
    // One === dispatch for the single when clause.
    assert_eq!(count_lines(&asm, "call\t*__voff____eqq+16(%eax)"), 1);
    assert!(asm.contains("movl\t$4, %eax"));
}

#[test]
fn test_incr_rewrites_to_add_assign() {
    let asm = compile_asm("(let (i) (assign i 0) (incr i))");
    assert!(asm.contains("addl\t"));
    // The slot is read and written back.
    assert!(asm.contains("movl\t%eax, -4(%ebp)"));
}

#[test]
fn test_deref_resolves_class_constant() {
    let asm = compile_asm(
        "(class A Object (assign Pi 3))
         (assign X (deref A Pi))",
    );
    assert!(asm.contains(".comm\tA__Pi, 4, 4"));
    assert!(asm.contains("movl\tA__Pi, %eax"));
}

#[test]
fn test_deref_through_non_class_is_fatal() {
    let err = compile_err("(deref NotAClass thing)");
    assert!(matches!(err, CompileError::UnresolvedDeref { .. }));
}

#[test]
fn test_assign_without_target_is_fatal() {
    let err = compile_err("(assign)");
    assert!(matches!(err, CompileError::MissingAssignTarget { .. }));
}

#[test]
fn test_rescue_lowers_body_with_warning() {
    let (asm, warnings) = compile_src("(rescue (assign X 1))");
    assert!(warnings
        .iter()
        .any(|w| matches!(w, Warning::RescueNotImplemented { .. })));
    // The protected body still runs.
    assert!(asm.contains("movl\t%eax, X"));
}

#[test]
fn test_operator_form_lowers_as_method_call() {
    let asm = compile_asm(
        "(class A Object (defm << (x) 0))
         (let (a) (<< a 1))",
    );
    assert!(asm.contains("call\t*__voff____shl+16(%eax)"));
}

#[test]
fn test_saveregs_spills_cached_state() {
    // saveregs alone must compile to no dispatch at all.
    let asm = compile_asm("(saveregs)");
    assert!(!asm.contains("call\t*"));
}

#[test]
fn test_errors_carry_position_and_scope() {
    let err = compile_err("(class A Object\n  (deref B thing))");
    let text = err.to_string();
    assert!(text.contains("test.sx:2:3"), "missing position: {}", text);
    assert!(text.contains("class A"), "missing scope: {}", text);
}
