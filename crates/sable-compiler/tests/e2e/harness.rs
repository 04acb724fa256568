//! Test harness for end-to-end compilation
//!
//! Compiles tree notation through the full driver and hands back the
//! assembly text and the collected warnings.

use sable_compiler::{CompileError, Compiler, Warning};
use sable_sexpr::parse;

/// Compile a source tree, returning the assembly and warnings.
pub fn compile_src(src: &str) -> (String, Vec<Warning>) {
    let program = parse(src, "test.sx").expect("tree parses");
    Compiler::default()
        .compile_to_string(&program)
        .expect("program compiles")
}

/// Compile and return just the assembly.
pub fn compile_asm(src: &str) -> String {
    compile_src(src).0
}

/// Compile a program that must fail.
pub fn compile_err(src: &str) -> CompileError {
    let program = parse(src, "test.sx").expect("tree parses");
    Compiler::default()
        .compile_to_string(&program)
        .expect_err("compilation should fail")
}

/// Index of the first line containing `needle`.
pub fn line_of(asm: &str, needle: &str) -> usize {
    asm.lines()
        .position(|l| l.contains(needle))
        .unwrap_or_else(|| panic!("no line contains {:?}\n---\n{}", needle, asm))
}

/// Assert `a` is emitted before `b`.
pub fn assert_before(asm: &str, a: &str, b: &str) {
    assert!(
        line_of(asm, a) < line_of(asm, b),
        "{:?} should precede {:?}\n---\n{}",
        a,
        b,
        asm
    );
}

/// Count lines containing `needle`.
pub fn count_lines(asm: &str, needle: &str) -> usize {
    asm.lines().filter(|l| l.contains(needle)).count()
}
