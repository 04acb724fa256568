//! Function and method definition
//!
//! Definitions queue a [`FunctionDef`] and emit nothing inline except,
//! for methods, the `__set_vtable` call that fills the class's slot.
//! The driver drains the queue after `main`; each body starts with the
//! runtime arity guards and default-value assignments keyed on the
//! argument count in `%ebx`.

use super::{Access, Codegen};
use crate::emitter::{Cond, Opnd, Reg, NUMARGS_REG, RESULT_REG};
use crate::error::{CompileError, CompileResult};
use crate::function::{FuncId, FunctionDef};
use crate::scope::{Resolution, Scope};
use crate::value::{Operand, Value};
use crate::vtable::{clean_label, method_label, voff_label};
use sable_sexpr::{List, Sexp};
use std::io::Write;

impl<W: Write> Codegen<W> {
    pub(super) fn compile_defun(&mut self, list: &List) -> CompileResult<Value> {
        let [name, params, body @ ..] = list.rest() else {
            return Err(self.fail_malformed("defun", "need name and parameter list"));
        };
        let Some(name) = name.as_sym() else {
            return Err(self.fail_malformed("defun", "name must be a symbol"));
        };
        let Some(params) = params.as_list() else {
            return Err(self.fail_malformed("defun", "parameters must be a list"));
        };
        let name = name.to_string();
        let label = clean_label(&name);

        let def = FunctionDef::new(
            &name,
            &label,
            &[],
            &params.items,
            body.to_vec(),
            None,
            false,
            self.last_pos.clone(),
        )
        .map_err(|msg| self.fail_malformed("defun", &msg))?;
        self.queue_function(def);
        self.register_global_function(&name, &label);
        Ok(Value::addr(label))
    }

    pub(super) fn compile_defm(&mut self, list: &List) -> CompileResult<Value> {
        let Some(cid) = self.current_class() else {
            return Err(CompileError::OutsideMethod {
                what: "defm".to_string(),
                ctx: self.context("defm"),
            });
        };
        let [name, params, body @ ..] = list.rest() else {
            return Err(self.fail_malformed("defm", "need name and parameter list"));
        };
        let Some(name) = name.as_sym() else {
            return Err(self.fail_malformed("defm", "name must be a symbol"));
        };
        let Some(params) = params.as_list() else {
            return Err(self.fail_malformed("defm", "parameters must be a list"));
        };
        let name = name.to_string();
        let class_name = self.classes.get(cid).name.clone();
        let label = method_label(&class_name, &name);
        self.alloc_voff(&name)?;

        let def = FunctionDef::new(
            &name,
            &label,
            &["__closure__", "self"],
            &params.items,
            body.to_vec(),
            Some(cid),
            true,
            self.last_pos.clone(),
        )
        .map_err(|msg| self.fail_malformed("defm", &msg))?;
        self.queue_function(def);
        self.classes.get_mut(cid).define_method(&name, &label);

        // Fill the class's vtable slot at definition time.
        let voff = voff_label(&name);
        self.caller_save(|c| {
            c.with_stack(3, |c| {
                c.e.mov(Opnd::mem_label(&class_name), Opnd::Reg(RESULT_REG))?;
                c.e.mov(Opnd::Reg(RESULT_REG), Opnd::Mem(0, Reg::Esp))?;
                c.e.mov(Opnd::imm_label(&voff), Opnd::Mem(4, Reg::Esp))?;
                c.e.mov(Opnd::imm_label(&label), Opnd::Mem(8, Reg::Esp))?;
                c.e.call_label("__set_vtable")?;
                Ok(())
            })
        })?;

        Ok(Value::addr(label))
    }

    /// `lambda` and `proc` are anonymous definitions with the implicit
    /// closure/self prefix; the body sits in an empty `let` so it has a
    /// scope of its own. Creation also saves the current frame pointer
    /// into the enclosing environment so `preturn` can restore it.
    pub(super) fn compile_lambda(&mut self, list: &List) -> CompileResult<Value> {
        let (params, body) = match list.rest() {
            [Sexp::List(params), body @ ..] => (params.items.clone(), body),
            body => (Vec::new(), body),
        };
        let label = self.fresh_lambda_label();

        let mut wrapped = vec![Sexp::sym("let"), Sexp::list(vec![])];
        wrapped.extend(body.iter().cloned());
        let def = FunctionDef::new(
            &label,
            &label,
            &["__closure__", "self"],
            &params,
            vec![Sexp::list(wrapped)],
            self.current_class(),
            false,
            self.last_pos.clone(),
        )
        .map_err(|msg| self.fail_malformed("lambda", &msg))?;
        self.queue_function(def);
        self.emit_frame_save()?;
        Ok(Value::addr(label))
    }

    /// Store the frame pointer of the method creating a block into slot
    /// 0 of its environment record. The record itself arrives through
    /// the rewritten tree (an `__env__` binding in the enclosing scope);
    /// when no environment is in scope the block captures nothing and
    /// there is nowhere to return to.
    fn emit_frame_save(&mut self) -> CompileResult<()> {
        if matches!(self.resolve_name("__env__"), Resolution::Unresolved) {
            return Ok(());
        }
        let save = Sexp::list(vec![
            Sexp::sym("assign"),
            Sexp::list(vec![Sexp::sym("index"), Sexp::sym("__env__"), Sexp::Int(0)]),
            Sexp::list(vec![Sexp::sym("stackframe")]),
        ]);
        self.compile_exp(&save)?;
        Ok(())
    }

    pub(super) fn queue_function(&mut self, def: FunctionDef) -> FuncId {
        let fid = FuncId::new(self.funcs.len() as u32);
        self.funcs.push(def);
        self.queue.push_back(fid);
        fid
    }

    /// Emit one queued function: prologue, arity guards, defaults, body.
    pub(super) fn emit_function(&mut self, fid: FuncId) -> CompileResult<()> {
        let f = self.funcs[fid.index()].clone();
        let saved_scopes = std::mem::replace(&mut self.scopes, vec![Scope::Global]);
        if let Some(cid) = f.class_id {
            self.scopes.push(Scope::Class(cid));
        }
        self.scopes.push(Scope::Function(fid));

        self.e.func_begin(&f.label, false)?;
        if let Some(pos) = &f.pos {
            self.e.lineno(pos)?;
        }
        self.emit_arity_checks(&f)?;
        self.emit_default_values(&f)?;

        if f.body.is_empty() {
            self.e.mov(Opnd::Imm(0), Opnd::Reg(RESULT_REG))?;
        } else {
            for (i, exp) in f.body.iter().enumerate() {
                if i + 1 == f.body.len() {
                    self.eval_to_eax(exp)?;
                } else {
                    self.eval(exp)?;
                }
            }
        }
        self.e.evict_all()?;
        self.e.func_end()?;

        self.scopes = saved_scopes;
        Ok(())
    }

    /// Compare `%ebx` against the declared bounds; a mismatch prints an
    /// ArgumentError and aborts through a deliberate divide by zero.
    fn emit_arity_checks(&mut self, f: &FunctionDef) -> CompileResult<()> {
        let min = f.minargs();
        if min > 0 {
            let ok = self.e.local();
            self.e.cmp(Opnd::Imm(min as i64), Opnd::Reg(NUMARGS_REG))?;
            self.e.jcc(Cond::Ge, &ok)?;
            self.emit_arity_failure(f, "at least", min)?;
            self.e.label(&ok)?;
        }
        if let Some(max) = f.maxargs() {
            let ok = self.e.local();
            self.e.cmp(Opnd::Imm(max as i64), Opnd::Reg(NUMARGS_REG))?;
            self.e.jcc(Cond::Le, &ok)?;
            self.emit_arity_failure(f, "at most", max)?;
            self.e.label(&ok)?;
        }
        Ok(())
    }

    fn emit_arity_failure(&mut self, f: &FunctionDef, bound: &str, n: usize) -> CompileResult<()> {
        let message = format!(
            "ArgumentError: In {}, expected {} {} arguments, got %d\n",
            f.name, bound, n
        );
        let fmt = self.intern_string(message.as_bytes());
        self.with_stack(2, |c| {
            c.e.mov(Opnd::Reg(NUMARGS_REG), Opnd::Mem(4, Reg::Esp))?;
            c.e.mov(Opnd::imm_label(&fmt), Opnd::Mem(0, Reg::Esp))?;
            c.e.call_label("printf")?;
            Ok(())
        })?;
        self.e.xor(Opnd::Reg(RESULT_REG), Opnd::Reg(RESULT_REG))?;
        self.e.op1("divl", &Opnd::Reg(RESULT_REG))?;
        Ok(())
    }

    /// A missing optional argument gets its default compiled into the
    /// argument slot, keyed on the runtime count.
    fn emit_default_values(&mut self, f: &FunctionDef) -> CompileResult<()> {
        for (i, p) in f.params.iter().enumerate() {
            let Some(default) = &p.default else { continue };
            let have = self.e.local();
            self.e.cmp(Opnd::Imm(i as i64), Opnd::Reg(NUMARGS_REG))?;
            self.e.jcc(Cond::G, &have)?;
            self.eval_to_eax(default)?;
            self.e.mov(Opnd::Reg(RESULT_REG), Self::arg_home(i))?;
            self.e.evict_all()?;
            self.e.label(&have)?;
        }
        Ok(())
    }

    /// Non-local return out of a block: restore the frame pointer saved
    /// in environment slot 0, then return from the enclosing method.
    pub(super) fn compile_preturn(&mut self, list: &List) -> CompileResult<Value> {
        match list.rest().first() {
            Some(value) => {
                self.eval_to_eax(value)?;
            }
            None => self.e.mov(Opnd::Imm(0), Opnd::Reg(RESULT_REG))?,
        }
        self.e.push(Opnd::Reg(RESULT_REG))?;
        let env = self.get_arg(&Sexp::sym("__env__"), Access::Read)?;
        if matches!(env.op, Operand::PossibleCallm(_)) {
            return Err(CompileError::OutsideMethod {
                what: "preturn".to_string(),
                ctx: self.context("preturn"),
            });
        }
        self.load(&env)?;
        self.e.mov(Opnd::Mem(0, RESULT_REG), Opnd::Reg(Reg::Ebp))?;
        self.e.pop(Opnd::Reg(RESULT_REG))?;
        self.e.func_end()?;
        Ok(Value::subexpr())
    }
}
