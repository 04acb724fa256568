//! Control-flow lowering
//!
//! `if`/`while` branch on falsiness; operands typed `object` treat both
//! `nil` and `false` as false. `and`, `or`, `case` and `ternif` are
//! rewrites into `if`/`let` forms. Arm joins invalidate the register
//! cache wholesale, so no branch-local state leaks across a merge.

use super::Codegen;
use crate::emitter::{Cond, Opnd, RESULT_REG};
use crate::error::CompileResult;
use crate::scope::{LocalScope, Scope};
use crate::value::{Operand, TypeHint, Value};
use sable_sexpr::{List, Sexp};
use std::io::Write;

impl<W: Write> Codegen<W> {
    /// Branch to `label` when the lowered value is false.
    pub(super) fn jump_on_false(&mut self, v: &Value, label: &str) -> CompileResult<()> {
        self.load(v)?;
        // Spill before the compare so both branch targets see an empty
        // cache and the spill moves cannot disturb the flags.
        self.e.evict_all()?;
        if v.is_object() {
            self.register_global("nil");
            self.register_global("false");
            self.e.cmp(Opnd::mem_label("nil"), Opnd::Reg(RESULT_REG))?;
            self.e.jcc(Cond::E, label)?;
            self.e.cmp(Opnd::mem_label("false"), Opnd::Reg(RESULT_REG))?;
            self.e.jcc(Cond::E, label)?;
        } else {
            self.e.test(Opnd::Reg(RESULT_REG), Opnd::Reg(RESULT_REG))?;
            self.e.jcc(Cond::E, label)?;
        }
        Ok(())
    }

    pub(super) fn compile_if(&mut self, list: &List) -> CompileResult<Value> {
        let (cond, then_arm, else_arm) = match list.rest() {
            [c, t] => (c.clone(), t.clone(), None),
            [c, t, e] => (c.clone(), t.clone(), Some(e.clone())),
            _ => return Err(self.fail_malformed("if", "need a condition and one or two arms")),
        };
        let else_label = self.e.local();
        let end_label = self.e.local();

        let cv = self.eval(&cond)?;
        self.jump_on_false(&cv, &else_label)?;

        let tv = self.eval_to_eax(&then_arm)?;
        self.e.evict_all()?;
        self.e.jmp(&end_label)?;
        self.e.label(&else_label)?;
        let ev = match else_arm {
            Some(arm) => {
                let v = self.eval_to_eax(&arm)?;
                self.e.evict_all()?;
                Some(v)
            }
            None => None,
        };
        self.e.label(&end_label)?;

        // The result type is the common type of both arms, if they agree.
        let hint = match &ev {
            Some(ev) if ev.hint == tv.hint => tv.hint,
            _ => TypeHint::Unspecified,
        };
        Ok(Value {
            op: Operand::SubExpr,
            hint,
        })
    }

    pub(super) fn compile_while(&mut self, list: &List) -> CompileResult<Value> {
        let [cond, body @ ..] = list.rest() else {
            return Err(self.fail_malformed("while", "need a condition"));
        };
        let (cond, body) = (cond.clone(), body.to_vec());
        let start_label = self.e.local();
        let end_label = self.e.local();

        self.e.evict_all()?;
        self.e.label(&start_label)?;
        let cv = self.eval(&cond)?;
        self.jump_on_false(&cv, &end_label)?;
        for exp in &body {
            self.eval(exp)?;
        }
        self.e.evict_all()?;
        self.e.jmp(&start_label)?;
        self.e.label(&end_label)?;
        Ok(Value::int(0))
    }

    /// `(a && b)` is `if a then b`.
    pub(super) fn compile_and(&mut self, list: &List) -> CompileResult<Value> {
        let [a, b] = list.rest() else {
            return Err(self.fail_malformed("and", "need two operands"));
        };
        let rewritten = Sexp::list(vec![Sexp::sym("if"), a.clone(), b.clone()]);
        self.compile_exp(&rewritten)
    }

    /// `(a || b)` parks `a` in the reserved `__left` temporary and
    /// returns it when truthy, `b` otherwise.
    pub(super) fn compile_or(&mut self, list: &List) -> CompileResult<Value> {
        let [a, b] = list.rest() else {
            return Err(self.fail_malformed("or", "need two operands"));
        };
        let rewritten = Sexp::list(vec![
            Sexp::sym("let"),
            Sexp::list(vec![Sexp::sym("__left")]),
            Sexp::list(vec![Sexp::sym("assign"), Sexp::sym("__left"), a.clone()]),
            Sexp::list(vec![
                Sexp::sym("if"),
                Sexp::sym("__left"),
                Sexp::sym("__left"),
                b.clone(),
            ]),
        ]);
        self.compile_exp(&rewritten)
    }

    /// A flat block of let-bound locals with consecutive slots.
    pub(super) fn compile_let(&mut self, list: &List) -> CompileResult<Value> {
        let [vars, body @ ..] = list.rest() else {
            return Err(self.fail_malformed("let", "need a binding list"));
        };
        let Some(vars) = vars.as_list() else {
            return Err(self.fail_malformed("let", "bindings must be a list"));
        };
        let mut names = Vec::with_capacity(vars.items.len());
        for v in &vars.items {
            match v.as_sym() {
                Some(name) => names.push(name.to_string()),
                None => return Err(self.fail_malformed("let", "bindings must be names")),
            }
        }
        let body = body.to_vec();

        // Registers caching an outer variable of the same name must not
        // leak into (or out of) the shadowing block.
        for name in &names {
            self.e.evict_regs_for(name)?;
        }
        let base = self.local_base();
        self.scopes.push(Scope::Local(LocalScope {
            names: names.clone(),
            base,
        }));
        self.e.sub_esp(names.len() * 4)?;

        let mut last = Value::int(0);
        for (i, exp) in body.iter().enumerate() {
            if i + 1 == body.len() {
                // The result must leave the slots before they die.
                last = self.eval_to_eax(exp)?;
            } else {
                self.eval(exp)?;
            }
        }

        self.e.evict_all()?;
        self.e.add_esp(names.len() * 4)?;
        self.scopes.pop();
        for name in &names {
            self.e.evict_regs_for(name)?;
        }
        Ok(last)
    }

    /// `case` rewrites each `when v` into `if (__case === v)` chains.
    pub(super) fn compile_case(&mut self, list: &List) -> CompileResult<Value> {
        let [subject, clauses @ ..] = list.rest() else {
            return Err(self.fail_malformed("case", "need a subject"));
        };
        let (subject, clauses) = (subject.clone(), clauses.to_vec());

        let mut chain: Option<Sexp> = None;
        for clause in clauses.iter().rev() {
            let Some(cl) = clause.as_list() else {
                return Err(self.fail_malformed("case", "clauses must be lists"));
            };
            match cl.head() {
                Some("when") => {
                    let [value, body @ ..] = cl.rest() else {
                        return Err(self.fail_malformed("case", "when needs a value"));
                    };
                    let cond = Sexp::list(vec![
                        Sexp::sym("callm"),
                        Sexp::sym("__case"),
                        Sexp::sym("==="),
                        Sexp::list(vec![value.clone()]),
                    ]);
                    let mut arm = vec![Sexp::sym("do")];
                    arm.extend(body.iter().cloned());
                    let mut branch = vec![Sexp::sym("if"), cond, Sexp::list(arm)];
                    if let Some(tail) = chain.take() {
                        branch.push(tail);
                    }
                    chain = Some(Sexp::list(branch));
                }
                Some("else") => {
                    let mut arm = vec![Sexp::sym("do")];
                    arm.extend(cl.rest().iter().cloned());
                    chain = Some(Sexp::list(arm));
                }
                _ => return Err(self.fail_malformed("case", "expected when or else clause")),
            }
        }

        let mut rewritten = vec![
            Sexp::sym("let"),
            Sexp::list(vec![Sexp::sym("__case")]),
            Sexp::list(vec![
                Sexp::sym("assign"),
                Sexp::sym("__case"),
                subject,
            ]),
        ];
        rewritten.push(chain.unwrap_or(Sexp::Int(0)));
        self.compile_exp(&Sexp::list(rewritten))
    }

    /// `ternif` rewrites to `if`; an optional `ternalt` sibling carries
    /// the two arms.
    pub(super) fn compile_ternif(&mut self, list: &List) -> CompileResult<Value> {
        let [cond, arm] = list.rest() else {
            return Err(self.fail_malformed("ternif", "need condition and arm"));
        };
        let rewritten = match arm.as_list().filter(|l| l.head() == Some("ternalt")) {
            Some(alt) => {
                let [t, f] = alt.rest() else {
                    return Err(self.fail_malformed("ternif", "ternalt needs two arms"));
                };
                Sexp::list(vec![Sexp::sym("if"), cond.clone(), t.clone(), f.clone()])
            }
            None => Sexp::list(vec![Sexp::sym("if"), cond.clone(), arm.clone()]),
        };
        self.compile_exp(&rewritten)
    }
}
