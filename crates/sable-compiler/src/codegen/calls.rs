//! Call lowering
//!
//! The four call shapes (`call`, `callm`, `super`, `yield`) share the
//! argument window builder. Method calls push `(closure, self, args...)`
//! into a window, load the receiver's class pointer and dispatch through
//! the global vtable offset; `super` chases the superclass pointer first.
//! A trailing `(splat x)` argument switches to a push-based window whose
//! size is only known at runtime.

use super::Codegen;
use crate::emitter::{Opnd, Reg, NUMARGS_REG, RESULT_REG, SELF_REG};
use crate::error::{CompileError, CompileResult, Warning};
use crate::scope::{LocalScope, Resolution, Scope};
use crate::value::{Operand, Value};
use crate::vtable::{voff_label, CLASS_HEADER_BYTES};
use sable_sexpr::{List, Sexp};
use std::io::Write;

/// What a plain call dispatches through.
enum CallTarget {
    /// A known function label.
    Label(String),
    /// A computed callee, evaluated after the arguments.
    Expr(Sexp),
}

/// Normalise the argument node of a `call`/`callm` form: a list is the
/// argument vector, an atom a single argument, absence no arguments.
fn arg_vec(exp: Option<&Sexp>) -> Vec<Sexp> {
    match exp {
        None => Vec::new(),
        Some(Sexp::List(l)) => l.items.clone(),
        Some(atom) => vec![atom.clone()],
    }
}

fn is_splat(exp: &Sexp) -> bool {
    exp.is_form("splat")
}

impl<W: Write> Codegen<W> {
    pub(super) fn compile_call_form(&mut self, list: &List) -> CompileResult<Value> {
        let [callee, rest @ ..] = list.rest() else {
            return Err(self.fail_malformed("call", "missing callee"));
        };
        if rest.len() > 1 {
            return Err(self.fail_malformed("call", "unexpected extra operand"));
        }
        let callee = callee.clone();
        let args = arg_vec(rest.first());
        self.compile_call_parts(&callee, &args, None)
    }

    /// Shared by the `call` form and implicit calls, where the head is
    /// the callee and the tail the inline arguments.
    pub(super) fn compile_call_parts(
        &mut self,
        callee: &Sexp,
        args: &[Sexp],
        block: Option<&Sexp>,
    ) -> CompileResult<Value> {
        if let Some(name) = callee.as_sym() {
            match self.resolve_name(name) {
                Resolution::Function(label) => {
                    return self.emit_plain_call(CallTarget::Label(label), args);
                }
                Resolution::Unresolved => {
                    // A free callee is an implicit self-send.
                    let name = name.to_string();
                    return self.compile_callm(&Sexp::sym("self"), &name, args, block, false);
                }
                _ => {}
            }
        }
        self.emit_plain_call(CallTarget::Expr(callee.clone()), args)
    }

    fn emit_plain_call(&mut self, target: CallTarget, args: &[Sexp]) -> CompileResult<Value> {
        let args = args.to_vec();
        let splat = args.last().map_or(false, is_splat);
        self.caller_save(|c| {
            if splat {
                c.emit_plain_call_splat(&target, &args)
            } else {
                c.emit_plain_call_window(&target, &args)
            }
        })?;
        self.reload_self()?;
        Ok(Value::subexpr())
    }

    fn emit_plain_call_window(&mut self, target: &CallTarget, args: &[Sexp]) -> CompileResult<()> {
        let n = args.len();
        self.with_stack(n, |c| {
            for (i, a) in args.iter().enumerate() {
                c.eval_to_eax(a)?;
                c.e
                    .mov(Opnd::Reg(RESULT_REG), Opnd::Mem(4 * i as i32, Reg::Esp))?;
            }
            c.dispatch_plain(target, n, None)
        })
    }

    fn emit_plain_call_splat(&mut self, target: &CallTarget, args: &[Sexp]) -> CompileResult<()> {
        let (fixed, splat_exp) = split_splat(args);
        let (esp_home, len_home) = self.enter_splat_frame()?;

        self.expand_splat(&splat_exp, &len_home)?;
        for a in fixed.iter().rev() {
            self.eval_to_eax(a)?;
            self.e.push(Opnd::Reg(RESULT_REG))?;
        }
        self.dispatch_plain(target, fixed.len(), Some(&len_home))?;

        self.leave_splat_frame(esp_home)
    }

    /// Evaluate a computed callee, flush the cache, set the argument
    /// count and call. The count is loaded last: a nested call inside
    /// the callee expression would clobber `%ebx`.
    fn dispatch_plain(
        &mut self,
        target: &CallTarget,
        fixed: usize,
        splat_len: Option<&Opnd>,
    ) -> CompileResult<()> {
        if let CallTarget::Expr(exp) = target {
            let exp = exp.clone();
            self.eval_to_eax(&exp)?;
        }
        self.e.evict_all()?;
        self.e
            .mov(Opnd::Imm(fixed as i64), Opnd::Reg(NUMARGS_REG))?;
        if let Some(len) = splat_len {
            self.e.add(len.clone(), Opnd::Reg(NUMARGS_REG))?;
        }
        match target {
            CallTarget::Label(label) => self.e.call_label(label)?,
            CallTarget::Expr(_) => self.e.call_reg(RESULT_REG)?,
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Method dispatch
    // ------------------------------------------------------------------

    pub(super) fn compile_callm_form(&mut self, list: &List) -> CompileResult<Value> {
        let [receiver, method, rest @ ..] = list.rest() else {
            return Err(self.fail_malformed("callm", "need receiver and method"));
        };
        let Some(method) = method.as_sym() else {
            return Err(self.fail_malformed("callm", "method must be a name"));
        };
        let receiver = receiver.clone();
        let method = method.to_string();
        let args = arg_vec(rest.first());
        let block = rest.get(1).cloned();
        self.compile_callm(&receiver, &method, &args, block.as_ref(), false)
    }

    /// An implicit `self.name()` send, forced out of a `possible_callm`.
    pub(super) fn compile_send_to_self(&mut self, name: &str) -> CompileResult<Value> {
        self.compile_callm(&Sexp::sym("self"), name, &[], None, false)
    }

    /// `super` re-invokes the current method on `self`, dispatching
    /// through the superclass's vtable.
    pub(super) fn compile_super(&mut self, list: &List) -> CompileResult<Value> {
        let (method, class_id) = match self.current_function() {
            Some(f) if f.is_method => (f.name.clone(), f.class_id),
            _ => {
                return Err(CompileError::OutsideMethod {
                    what: "super".to_string(),
                    ctx: self.context("super"),
                })
            }
        };
        if let Some(cid) = class_id {
            if !self.classes.superclass_defines(cid, &method) {
                self.warn(Warning::NoSuperMethod {
                    class: self.classes.get(cid).name.clone(),
                    name: method.clone(),
                    pos: self.last_pos.clone(),
                });
            }
        }
        let args = list.rest().to_vec();
        self.compile_callm(&Sexp::sym("self"), &method, &args, None, true)
    }

    /// `yield` calls the implicit block: `__closure__.call(args)`.
    pub(super) fn compile_yield(&mut self, list: &List) -> CompileResult<Value> {
        let args = list.rest().to_vec();
        self.compile_callm(&Sexp::sym("__closure__"), "call", &args, None, false)
    }

    pub(super) fn compile_callm(
        &mut self,
        receiver: &Sexp,
        method: &str,
        args: &[Sexp],
        block: Option<&Sexp>,
        load_super: bool,
    ) -> CompileResult<Value> {
        let mut args = args.to_vec();
        let mut method = method.to_string();
        if self.vtable.get(&method).is_none() {
            // No definition anywhere: route through __send__ with the
            // method symbol prepended, and leave a diagnostic.
            self.warn(Warning::UnknownMethod {
                name: method.clone(),
                pos: self.last_pos.clone(),
            });
            args.insert(0, Sexp::sym(format!(":{}", method)));
            method = "__send__".to_string();
        }
        self.alloc_voff(&method)?;
        let voff = voff_label(&method);

        let recv_is_self = receiver.as_sym() == Some("self");
        let receiver = receiver.clone();
        let block = block.cloned();
        let splat = args.last().map_or(false, is_splat);

        self.caller_save(|c| {
            if splat {
                c.emit_callm_splat(&receiver, &voff, &args, block.as_ref(), load_super)
            } else {
                c.emit_callm_window(&receiver, &voff, &args, block.as_ref(), load_super)
            }
        })?;

        self.e.evict_regs_for("self")?;
        if !recv_is_self {
            self.reload_self()?;
        }
        Ok(Value::object(Operand::SubExpr))
    }

    /// Fixed-size window: `(closure, self, args...)`.
    fn emit_callm_window(
        &mut self,
        receiver: &Sexp,
        voff: &str,
        args: &[Sexp],
        block: Option<&Sexp>,
        load_super: bool,
    ) -> CompileResult<()> {
        let n = 2 + args.len();
        self.with_stack(n, |c| {
            c.eval_to_eax(receiver)?;
            c.e.mov(Opnd::Reg(RESULT_REG), Opnd::Mem(4, Reg::Esp))?;
            for (i, a) in args.iter().enumerate() {
                c.eval_to_eax(a)?;
                c.e
                    .mov(Opnd::Reg(RESULT_REG), Opnd::Mem(8 + 4 * i as i32, Reg::Esp))?;
            }
            match block {
                Some(b) => {
                    c.eval_to_eax(b)?;
                }
                None => c.e.mov(Opnd::Imm(0), Opnd::Reg(RESULT_REG))?,
            }
            c.e.mov(Opnd::Reg(RESULT_REG), Opnd::Mem(0, Reg::Esp))?;
            c.dispatch_method(voff, load_super, n, None)
        })
    }

    /// Push-based window for a trailing splat argument.
    fn emit_callm_splat(
        &mut self,
        receiver: &Sexp,
        voff: &str,
        args: &[Sexp],
        block: Option<&Sexp>,
        load_super: bool,
    ) -> CompileResult<()> {
        let (fixed, splat_exp) = split_splat(args);
        let (esp_home, len_home) = self.enter_splat_frame()?;

        self.expand_splat(&splat_exp, &len_home)?;
        for a in fixed.iter().rev() {
            self.eval_to_eax(a)?;
            self.e.push(Opnd::Reg(RESULT_REG))?;
        }
        self.eval_to_eax(receiver)?;
        self.e.push(Opnd::Reg(RESULT_REG))?;
        match block {
            Some(b) => {
                self.eval_to_eax(b)?;
            }
            None => self.e.mov(Opnd::Imm(0), Opnd::Reg(RESULT_REG))?,
        }
        self.e.push(Opnd::Reg(RESULT_REG))?;

        self.dispatch_method(voff, load_super, 2 + fixed.len(), Some(&len_home))?;

        self.leave_splat_frame(esp_home)
    }

    /// Flush the cache, set the argument count, load the receiver into
    /// `%esi`, chase its class (and optionally the superclass) and call
    /// through the vtable slot.
    fn dispatch_method(
        &mut self,
        voff: &str,
        load_super: bool,
        fixed: usize,
        splat_len: Option<&Opnd>,
    ) -> CompileResult<()> {
        self.e.evict_all()?;
        self.e
            .mov(Opnd::Imm(fixed as i64), Opnd::Reg(NUMARGS_REG))?;
        if let Some(len) = splat_len {
            self.e.add(len.clone(), Opnd::Reg(NUMARGS_REG))?;
        }
        self.e.mov(Opnd::Mem(4, Reg::Esp), Opnd::Reg(SELF_REG))?;
        self.e.mov(Opnd::Mem(0, SELF_REG), Opnd::Reg(RESULT_REG))?;
        if load_super {
            self.e.mov(Opnd::Mem(12, RESULT_REG), Opnd::Reg(RESULT_REG))?;
        }
        self.e.call_vtable(voff, CLASS_HEADER_BYTES, RESULT_REG)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Splat plumbing
    // ------------------------------------------------------------------

    /// Two hidden locals back a splat call: the pre-argument `%esp` and
    /// the runtime element count.
    fn enter_splat_frame(&mut self) -> CompileResult<(Opnd, Opnd)> {
        let base = self.local_base();
        self.scopes.push(Scope::Local(LocalScope {
            names: vec!["__splat_esp".to_string(), "__splat_len".to_string()],
            base,
        }));
        self.e.sub_esp(8)?;
        let esp_home = Self::lvar_home(base);
        let len_home = Self::lvar_home(base + 1);
        self.e.mov(Opnd::Reg(Reg::Esp), esp_home.clone())?;
        Ok((esp_home, len_home))
    }

    fn leave_splat_frame(&mut self, esp_home: Opnd) -> CompileResult<()> {
        self.e.mov(esp_home, Opnd::Reg(Reg::Esp))?;
        self.e.add_esp(8)?;
        self.scopes.pop();
        Ok(())
    }

    /// Push the elements of a length-prefixed chunk, last first, and
    /// record the count in `len_home`.
    fn expand_splat(&mut self, exp: &Sexp, len_home: &Opnd) -> CompileResult<()> {
        self.eval_to_eax(exp)?;
        self.e.claim_reg(Reg::Ecx)?;
        let r = self.e.claim_scratch()?;
        self.e.mov(Opnd::Reg(RESULT_REG), Opnd::Reg(r))?;
        self.e.mov(Opnd::Mem(0, r), Opnd::Reg(Reg::Ecx))?;
        self.e.mov(Opnd::Reg(Reg::Ecx), len_home.clone())?;

        let loop_label = self.e.local();
        let done_label = self.e.local();
        self.e.label(&loop_label)?;
        self.e
            .test(Opnd::Reg(Reg::Ecx), Opnd::Reg(Reg::Ecx))?;
        self.e.jcc(crate::emitter::Cond::E, &done_label)?;
        self.e.push_indexed(r, Reg::Ecx)?;
        self.e.dec(Opnd::Reg(Reg::Ecx))?;
        self.e.jmp(&loop_label)?;
        self.e.label(&done_label)?;

        self.e.release_reg(r);
        self.e.release_reg(Reg::Ecx);
        Ok(())
    }
}

/// Split a trailing `(splat x)` off the argument list.
fn split_splat(args: &[Sexp]) -> (Vec<Sexp>, Sexp) {
    let (last, fixed) = args.split_last().expect("splat caller checked");
    let exp = last
        .as_list()
        .and_then(|l| l.rest().first())
        .cloned()
        .unwrap_or(Sexp::Int(0));
    (fixed.to_vec(), exp)
}
