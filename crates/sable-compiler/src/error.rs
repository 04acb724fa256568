//! Compilation errors and warnings

use sable_sexpr::Pos;
use std::fmt;
use thiserror::Error;

pub type CompileResult<T> = Result<T, CompileError>;

/// Position/scope/expression context attached to fatal errors.
///
/// Errors abort compilation, so the driver formats the last seen position,
/// the scope the generator was lowering in, and the offending expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    pub pos: Option<Pos>,
    pub scope: String,
    pub expr: String,
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.pos {
            Some(pos) => write!(f, "at {} in {}: {}", pos, self.scope, self.expr),
            None => write!(f, "in {}: {}", self.scope, self.expr),
        }
    }
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("unknown form '{head}' ({ctx})")]
    UnknownForm { head: String, ctx: ErrorContext },

    #[error("static dereference '{base}::{member}' where '{base}' is not a class ({ctx})")]
    UnresolvedDeref {
        base: String,
        member: String,
        ctx: ErrorContext,
    },

    #[error("hash literal entry is not a pair ({ctx})")]
    MalformedHash { ctx: ErrorContext },

    #[error("assignment without a target ({ctx})")]
    MissingAssignTarget { ctx: ErrorContext },

    #[error("cannot resolve argument {what} ({ctx})")]
    UnknownArgument { what: String, ctx: ErrorContext },

    #[error("malformed '{head}' form: {message} ({ctx})")]
    MalformedForm {
        head: String,
        message: String,
        ctx: ErrorContext,
    },

    #[error("'{what}' used outside of a method ({ctx})")]
    OutsideMethod { what: String, ctx: ErrorContext },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Non-fatal diagnostics. Compilation continues; the driver renders them
/// after the assembly has been written.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Warning {
    #[error("no method '{name}' is defined anywhere; call rewritten to __send__")]
    UnknownMethod { name: String, pos: Option<Pos> },

    #[error("empty expression in argument position treated as 0")]
    NilArgument { pos: Option<Pos> },

    #[error("rescue is not implemented; body runs without handlers")]
    RescueNotImplemented { pos: Option<Pos> },

    #[error("'required' reached the code generator; the front end should have expanded it")]
    UnexpandedRequire { pos: Option<Pos> },

    #[error("no superclass of {class} defines '{name}'; super will reach __method_missing")]
    NoSuperMethod {
        class: String,
        name: String,
        pos: Option<Pos>,
    },
}

impl Warning {
    /// The position the warning points at, if one was recorded.
    pub fn pos(&self) -> Option<&Pos> {
        match self {
            Warning::UnknownMethod { pos, .. }
            | Warning::NilArgument { pos }
            | Warning::RescueNotImplemented { pos }
            | Warning::UnexpandedRequire { pos }
            | Warning::NoSuperMethod { pos, .. } => pos.as_ref(),
        }
    }
}
