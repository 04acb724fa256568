//! Runtime arity guards and default values

use super::harness::*;

#[test]
fn test_arity_guards_compare_both_bounds() {
    // closure + self + a + two defaults: between 3 and 5 arguments.
    let asm = compile_asm("(class C Object (defm foo (a (b 1) (c 2)) 0))");
    let label = line_of(&asm, "__method_C_foo:");
    let body: Vec<&str> = asm.lines().skip(label).take(30).collect();
    let body = body.join("\n");
    assert!(body.contains("cmpl\t$3, %ebx"));
    assert!(body.contains("jge\t"));
    assert!(body.contains("cmpl\t$5, %ebx"));
    assert!(body.contains("jle\t"));
}

#[test]
fn test_arity_failure_prints_and_divides_by_zero() {
    let asm = compile_asm("(class C Object (defm foo (a) 0))");
    assert!(asm.contains("call\tprintf"));
    assert!(asm.contains("xorl\t%eax, %eax"));
    assert!(asm.contains("divl\t%eax"));
    assert!(asm.contains("ArgumentError: In foo, expected at least 3 arguments, got %d"));
}

#[test]
fn test_rest_parameter_lifts_upper_bound() {
    let asm = compile_asm("(class C Object (defm foo (a *rest) 0))");
    let label = line_of(&asm, "__method_C_foo:");
    let body: Vec<&str> = asm.lines().skip(label).take(30).collect();
    let body = body.join("\n");
    assert!(body.contains("cmpl\t$3, %ebx"));
    assert!(body.contains("jge\t"));
    assert!(!body.contains("jle\t"), "rest must drop the max check\n{}", body);
}

#[test]
fn test_default_value_fills_missing_slot() {
    let asm = compile_asm("(class C Object (defm foo ((a 42)) 0))");
    let label = line_of(&asm, "__method_C_foo:");
    let body: Vec<&str> = asm.lines().skip(label).take(40).collect();
    let body = body.join("\n");
    // Slot 2 is tested against the runtime count and assigned on miss.
    assert!(body.contains("cmpl\t$2, %ebx"));
    assert!(body.contains("jg\t"));
    assert!(body.contains("movl\t$42, %eax"));
    assert!(body.contains("movl\t%eax, 16(%ebp)"));
}

#[test]
fn test_plain_function_guards_without_implicit_params() {
    let asm = compile_asm("(defun f (x y) (add x y))");
    let label = line_of(&asm, "f:");
    let body: Vec<&str> = asm.lines().skip(label).take(30).collect();
    let body = body.join("\n");
    assert!(body.contains("cmpl\t$2, %ebx"));
    assert!(body.contains("ArgumentError") || asm.contains("ArgumentError: In f,"));
}
