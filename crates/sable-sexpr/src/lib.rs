//! Sable program trees
//!
//! This crate defines the s-expression tree the sable code generator
//! consumes: the output of the (external) parser and tree rewriter. Nodes
//! are atoms (integers, symbols, raw byte strings) or lists whose head is
//! usually a keyword symbol; list nodes may carry a source position.
//!
//! It also provides a small textual reader for the tree notation, used by
//! the CLI driver and the test suite. The reader is not the language
//! parser; it reads already-rewritten trees such as
//! `(defm foo (a b) (return 42))`.

pub mod reader;
pub mod sexp;

pub use reader::{parse, ReadError, Reader};
pub use sexp::{List, Pos, Sexp};
