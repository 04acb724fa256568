//! Function records
//!
//! Definitions are recorded when their `defun`/`defm`/`lambda` form is
//! lowered and emitted later, when the top-level driver drains the queue.
//! Methods and blocks carry the implicit `__closure__` and `self`
//! parameters in stack-slot order (closure at slot 0, self at slot 1).

use crate::scope::ClassId;
use rustc_hash::FxHashMap;
use sable_sexpr::{Pos, Sexp};

/// Index of a function record in the program arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncId(pub u32);

impl FuncId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A formal parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    /// Default-value expression, applied when the runtime argument count
    /// does not cover this slot.
    pub default: Option<Sexp>,
    /// Trailing rest parameter (`*name`).
    pub rest: bool,
}

impl Param {
    fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
            rest: false,
        }
    }
}

/// A queued function definition.
#[derive(Debug, Clone)]
pub struct FunctionDef {
    /// Source-level name (`foo`, `[]=`, `__lambda_3`).
    pub name: String,
    /// Emitted label.
    pub label: String,
    /// Parameters in stack-slot order, implicit ones included.
    pub params: Vec<Param>,
    /// Body forms, lowered sequentially; the last one is the result.
    pub body: Vec<Sexp>,
    /// Owning class when this is a method (or a block defined in one).
    pub class_id: Option<ClassId>,
    /// True for `defm` bodies: `self` reloads resolve through the
    /// argument window.
    pub is_method: bool,
    /// Definition-site position.
    pub pos: Option<Pos>,
    /// Per-variable usage counts over the body; the register cache only
    /// caches variables read more than once.
    pub freq: FxHashMap<String, u32>,
}

impl FunctionDef {
    /// Build a record from the raw parameter list of a definition form.
    ///
    /// `implicit` parameters (for methods and blocks: `__closure__`,
    /// `self`) are prepended as plain slots. Raw entries are bare symbols,
    /// `(name default)` pairs, or `*rest` symbols.
    pub fn new(
        name: impl Into<String>,
        label: impl Into<String>,
        implicit: &[&str],
        raw_params: &[Sexp],
        body: Vec<Sexp>,
        class_id: Option<ClassId>,
        is_method: bool,
        pos: Option<Pos>,
    ) -> Result<Self, String> {
        let mut params: Vec<Param> = implicit.iter().map(|n| Param::plain(*n)).collect();
        for raw in raw_params {
            match raw {
                Sexp::Sym(s) if s.starts_with('*') => params.push(Param {
                    name: s[1..].to_string(),
                    default: None,
                    rest: true,
                }),
                Sexp::Sym(s) => params.push(Param::plain(s.clone())),
                Sexp::List(l) => match l.items.as_slice() {
                    [Sexp::Sym(s), default] => params.push(Param {
                        name: s.clone(),
                        default: Some(default.clone()),
                        rest: false,
                    }),
                    _ => return Err(format!("bad parameter '{}'", raw)),
                },
                other => return Err(format!("bad parameter '{}'", other)),
            }
        }
        let mut freq = FxHashMap::default();
        for exp in &body {
            count_vars(exp, &mut freq);
        }
        Ok(Self {
            name: name.into(),
            label: label.into(),
            params,
            body,
            class_id,
            is_method,
            pos,
            freq,
        })
    }

    /// Slot index of a named parameter.
    pub fn param_index(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p.name == name)
    }

    pub fn has_rest(&self) -> bool {
        self.params.iter().any(|p| p.rest)
    }

    /// Smallest accepted runtime argument count: every slot up to the last
    /// defaultless, non-rest parameter must be filled.
    pub fn minargs(&self) -> usize {
        self.params
            .iter()
            .rposition(|p| p.default.is_none() && !p.rest)
            .map(|i| i + 1)
            .unwrap_or(0)
    }

    /// Largest accepted runtime argument count, unless a rest parameter
    /// lifts the bound.
    pub fn maxargs(&self) -> Option<usize> {
        if self.has_rest() {
            None
        } else {
            Some(self.params.len())
        }
    }

    /// How often `name` is used in the body (0 if never).
    pub fn usage(&self, name: &str) -> u32 {
        self.freq.get(name).copied().unwrap_or(0)
    }
}

fn count_vars(exp: &Sexp, freq: &mut FxHashMap<String, u32>) {
    match exp {
        Sexp::Sym(s) => *freq.entry(s.clone()).or_insert(0) += 1,
        Sexp::List(l) => {
            for item in &l.items {
                count_vars(item, freq);
            }
        }
        _ => {}
    }
}
