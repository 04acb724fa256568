//! Sable Compiler - Tree to x86 Assembly Code Generation
//!
//! This crate implements the whole-program code generator that lowers a
//! fully-parsed, already-rewritten s-expression tree into 32-bit x86
//! assembly text, ready to assemble and link against the small C-level
//! runtime.
//!
//! # Architecture
//!
//! The compilation pipeline is:
//! 1. Pre-pass: assign every method name its global vtable offset
//! 2. Main pass: emit `main` while lowering the top-level expression
//! 3. Drain: emit queued functions, methods and blocks
//! 4. Flush: missing-method thunks, base vtable, string pool, BSS globals
//!
//! Lowering is a single recursive walk; every routine returns a
//! [`value::Value`] naming where its result lives.

pub mod codegen;
pub mod emitter;
pub mod error;
pub mod function;
pub mod scope;
pub mod value;
pub mod vtable;

pub use codegen::{Codegen, CompileOptions};
pub use error::{CompileError, CompileResult, Warning};

use sable_sexpr::Sexp;
use std::io::Write;

/// Main compiler entry point.
pub struct Compiler {
    options: CompileOptions,
}

impl Compiler {
    pub fn new(options: CompileOptions) -> Self {
        Self { options }
    }

    /// Compile a program (a sequence of top-level forms) into assembly
    /// written to `out`, returning the warnings gathered on the way.
    pub fn compile<W: Write>(&self, program: &[Sexp], out: W) -> CompileResult<Vec<Warning>> {
        let mut codegen = Codegen::new(out, &self.options);
        codegen.compile_program(&self.options.entry, program)?;
        Ok(codegen.take_warnings())
    }

    /// Compile into an in-memory string (tests, inspection).
    pub fn compile_to_string(&self, program: &[Sexp]) -> CompileResult<(String, Vec<Warning>)> {
        let mut buf = Vec::new();
        let warnings = self.compile(program, &mut buf)?;
        let asm = String::from_utf8(buf).expect("emitted assembly is ASCII");
        Ok((asm, warnings))
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new(CompileOptions::default())
    }
}
