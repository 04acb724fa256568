//! Class definition
//!
//! A class form allocates the class object through the runtime, writes
//! its instance size and raw name into the header, and lowers the body
//! in the class's own scope. `module` currently lowers exactly like
//! `class`.

use super::Codegen;
use crate::emitter::{Opnd, Reg, RESULT_REG};
use crate::error::CompileResult;
use crate::scope::{ClassId, Scope};
use crate::value::{Operand, Value};
use crate::vtable::CLASS_HEADER_SLOTS;
use sable_sexpr::{List, Sexp};
use std::io::Write;

impl<W: Write> Codegen<W> {
    pub(super) fn compile_class(&mut self, list: &List) -> CompileResult<Value> {
        let [name, rest @ ..] = list.rest() else {
            return Err(self.fail_malformed("class", "missing name"));
        };
        let Some(name) = name.as_sym() else {
            return Err(self.fail_malformed("class", "name must be a symbol"));
        };
        let name = name.to_string();

        // A bare symbol in second position names the superclass; the
        // default is Object (except for Object itself).
        let (super_name, body) = match rest {
            [Sexp::Sym(s), tail @ ..] => (Some(s.clone()), tail),
            tail => {
                let implied = if name == "Object" {
                    None
                } else {
                    Some("Object".to_string())
                };
                (implied, tail)
            }
        };
        let body = body.to_vec();

        self.register_global(&name);
        let super_id = match &super_name {
            Some(s) if *s != name => {
                self.register_global(s);
                Some(self.classes.get_or_create(s, None))
            }
            _ => None,
        };
        let super_total = super_id
            .map(|sid| {
                let s = self.classes.get(sid);
                s.ivar_base + s.ivars.len()
            })
            .unwrap_or(0);
        let cid = self.classes.get_or_create(&name, super_id);
        {
            let info = self.classes.get_mut(cid);
            info.superclass = super_id;
            if info.ivars.is_empty() {
                info.ivar_base = super_total;
            }
        }

        // Instance slots must be final before the size write below, so
        // every `@name` in the body is assigned its offset up front, in
        // source order.
        for exp in &body {
            self.scan_ivars(cid, exp);
        }

        let own_size = (self.classes.get(cid).instance_slots() * 4) as i64;
        // Class and Kernel bootstrap before their superclasses exist.
        let inherited_size = if name == "Class" || name == "Kernel" {
            0
        } else {
            super_id.map(|_| ((1 + super_total) * 4) as i64).unwrap_or(0)
        };
        let klass_size = ((CLASS_HEADER_SLOTS + self.vtable.len()) * 4) as i64;

        // Name = __new_class_object(klass_size, Super, inherited_size)
        self.caller_save(|c| {
            c.with_stack(3, |c| {
                c.e.mov(Opnd::Imm(klass_size), Opnd::Mem(0, Reg::Esp))?;
                match &super_name {
                    Some(s) => {
                        c.e.mov(Opnd::mem_label(s), Opnd::Reg(RESULT_REG))?;
                        c.e.mov(Opnd::Reg(RESULT_REG), Opnd::Mem(4, Reg::Esp))?;
                    }
                    None => c.e.mov(Opnd::Imm(0), Opnd::Mem(4, Reg::Esp))?,
                }
                c.e.mov(Opnd::Imm(inherited_size), Opnd::Mem(8, Reg::Esp))?;
                c.e.call_label("__new_class_object")?;
                Ok(())
            })
        })?;
        self.e.mov(Opnd::Reg(RESULT_REG), Opnd::mem_label(&name))?;

        // Slot 1: instance size. Slot 2: raw name bytes, since String
        // may not be initialised this early.
        let name_label = self.intern_string(name.as_bytes());
        let r = self.e.claim_scratch()?;
        self.e.mov(Opnd::mem_label(&name), Opnd::Reg(r))?;
        self.e.mov(Opnd::Imm(own_size), Opnd::Mem(4, r))?;
        self.e.mov(Opnd::imm_label(&name_label), Opnd::Mem(8, r))?;
        self.e.release_reg(r);

        self.scopes.push(Scope::Class(cid));
        let mut result = Ok(());
        for exp in &body {
            if let Err(err) = self.eval(exp) {
                result = Err(err);
                break;
            }
        }
        self.scopes.pop();
        result?;

        Ok(Value::object(Operand::Global(name)))
    }

    /// Depth-first collection of `@name` uses.
    fn scan_ivars(&mut self, cid: ClassId, exp: &Sexp) {
        match exp {
            Sexp::Sym(s) if s.starts_with('@') => {
                self.classes.get_mut(cid).ivar_slot(s);
            }
            Sexp::List(l) => {
                for item in &l.items {
                    self.scan_ivars(cid, item);
                }
            }
            _ => {}
        }
    }
}
