//! Class definition and instance variables

use super::harness::*;

#[test]
fn test_class_allocates_and_initialises_header() {
    let asm = compile_asm("(class A Object)");
    assert!(asm.contains("call\t__new_class_object"));
    assert!(asm.contains("movl\t%eax, A"));
    // Slot 1: instance size (one slot, the class pointer). Slot 2: raw name.
    assert!(asm.contains("movl\t$4, 4(%edx)"));
    assert!(asm.contains(", 8(%edx)"));
    assert!(asm.contains(".string\t\"A\""));
}

#[test]
fn test_class_size_covers_global_vtable() {
    // Two method names anywhere in the program widen every class object.
    let asm = compile_asm(
        "(class A Object (defm x () 0) (defm y () 0))
         (class B Object)",
    );
    // Header (4 slots) + 2 vtable slots = 24 bytes, for both classes.
    assert_eq!(count_lines(&asm, "movl\t$24, (%esp)"), 2);
}

#[test]
fn test_ivar_store_preserves_source_across_self_reload() {
    let asm = compile_asm(
        "(class C Object
           (defm set (v) (assign @x v))
           (defm get () (return @x)))",
    );
    let set = line_of(&asm, "__method_C_set:");
    let body: Vec<&str> = asm.lines().skip(set).take(40).collect();
    let body = body.join("\n");
    // Value pushed, self reloaded from its argument slot, value popped,
    // then stored into the first instance slot.
    assert!(body.contains("pushl\t%eax"));
    assert!(body.contains("movl\t12(%ebp), %esi"));
    assert!(body.contains("popl\t%eax"));
    assert!(body.contains("movl\t%eax, 4(%esi)"));
    // Reads come straight through %esi.
    assert!(asm.contains("movl\t4(%esi), %eax"));
}

#[test]
fn test_subclass_ivars_start_past_inherited_block() {
    let asm = compile_asm(
        "(class A Object (defm seta (v) (assign @x v)))
         (class B A (defm setb (v) (assign @y v)))",
    );
    // A's @x is slot 1; B's @y lands after it, in slot 2.
    assert!(asm.contains("movl\t%eax, 4(%esi)"));
    assert!(asm.contains("movl\t%eax, 8(%esi)"));
}

#[test]
fn test_instance_size_includes_scanned_ivars() {
    let asm = compile_asm("(class A Object (defm init () (assign @x 1)))");
    // Class pointer + @x: two slots, eight bytes, written before the body.
    assert!(asm.contains("movl\t$8, 4(%edx)"));
}

#[test]
fn test_module_is_an_alias_for_class() {
    let asm = compile_asm("(module M (defm m () 0))");
    assert!(asm.contains("call\t__new_class_object"));
    assert!(asm.contains("movl\t%eax, M"));
    assert!(asm.contains("__method_M_m:"));
}

#[test]
fn test_class_reopen_keeps_ivar_offsets() {
    let asm = compile_asm(
        "(class A Object (defm seta (v) (assign @x v)))
         (class A Object (defm setb (v) (assign @y v)))",
    );
    assert!(asm.contains("movl\t%eax, 4(%esi)"));
    assert!(asm.contains("movl\t%eax, 8(%esi)"));
}
