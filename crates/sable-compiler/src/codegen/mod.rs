//! Code generation
//!
//! A single-pass recursive tree walker with a two-phase outer loop: a
//! pre-pass assigns every method name its global vtable offset, then the
//! main pass emits `main`, drains the queued function definitions, and
//! flushes the missing-method thunks, the string pool and the BSS
//! globals.
//!
//! `compile_exp` dispatches on the head keyword of each list node; bare
//! atoms resolve through [`Codegen::get_arg`]. Every routine returns a
//! [`Value`] describing where the result lives.

mod calls;
mod classes;
mod control;
mod functions;

use crate::emitter::{Cond, Emitter, Opnd, Reg, NUMARGS_REG, RESULT_REG, SELF_REG};
use crate::error::{CompileError, CompileResult, ErrorContext, Warning};
use crate::function::{FuncId, FunctionDef};
use crate::scope::{ClassId, ClassTable, Resolution, Scope};
use crate::value::{Operand, TypeHint, Value};
use crate::vtable::{clean_label, voff_label, VtableLayout, CLASS_HEADER_SLOTS};
use rustc_hash::{FxHashMap, FxHashSet};
use sable_sexpr::{List, Pos, Sexp};
use std::collections::VecDeque;
use std::io::Write;

/// Heads the expression dispatcher recognises.
const KEYWORDS: &[&str] = &[
    "do", "class", "module", "defun", "defm", "if", "lambda", "proc", "assign", "while", "index",
    "bindex", "let", "case", "ternif", "hash", "return", "sexp", "rescue", "incr", "block",
    "required", "add", "sub", "mul", "div", "eq", "ne", "lt", "le", "gt", "ge", "saveregs", "and",
    "or", "preturn", "stackframe", "deref", "call", "callm", "super", "yield",
];

/// Bare operators lowered as method calls.
const OPERATOR_METHODS: &[&str] = &["<<"];

/// Compiler configuration.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Emit source-position comments into the assembly.
    pub debug_info: bool,
    /// Label of the entry point.
    pub entry: String,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            debug_info: false,
            entry: "main".to_string(),
        }
    }
}

/// Read/write mode for argument resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Interned byte strings, emitted into read-only data at the end.
#[derive(Debug, Default)]
struct StringPool {
    labels: FxHashMap<Vec<u8>, String>,
    order: Vec<(String, Vec<u8>)>,
}

impl StringPool {
    fn intern(&mut self, bytes: &[u8]) -> String {
        if let Some(label) = self.labels.get(bytes) {
            return label.clone();
        }
        let label = format!(".Lstr{}", self.order.len());
        self.labels.insert(bytes.to_vec(), label.clone());
        self.order.push((label.clone(), bytes.to_vec()));
        label
    }
}

/// Global constants awaiting their BSS definition.
#[derive(Debug, Default)]
struct GlobalSet {
    set: FxHashSet<String>,
    order: Vec<String>,
}

impl GlobalSet {
    fn add(&mut self, name: &str) {
        if self.set.insert(name.to_string()) {
            self.order.push(name.to_string());
        }
    }

    fn contains(&self, name: &str) -> bool {
        self.set.contains(name)
    }
}

/// The tree-walking code generator.
pub struct Codegen<W: Write> {
    pub(crate) e: Emitter<W>,
    pub(crate) classes: ClassTable,
    pub(crate) funcs: Vec<FunctionDef>,
    pub(crate) queue: VecDeque<FuncId>,
    pub(crate) vtable: VtableLayout,
    strings: StringPool,
    globals: GlobalSet,
    /// Top-level functions: source name → label.
    global_funcs: FxHashMap<String, String>,
    /// `:sym` literal → its cache global.
    symbol_globals: FxHashMap<String, String>,
    pub(crate) scopes: Vec<Scope>,
    warnings: Vec<Warning>,
    pub(crate) last_pos: Option<Pos>,
    lambda_seq: u32,
}

impl<W: Write> Codegen<W> {
    pub fn new(out: W, options: &CompileOptions) -> Self {
        Self {
            e: Emitter::new(out, options.debug_info),
            classes: ClassTable::new(),
            funcs: Vec::new(),
            queue: VecDeque::new(),
            vtable: VtableLayout::new(),
            strings: StringPool::default(),
            globals: GlobalSet::default(),
            global_funcs: FxHashMap::default(),
            symbol_globals: FxHashMap::default(),
            scopes: vec![Scope::Global],
            warnings: Vec::new(),
            last_pos: None,
            lambda_seq: 0,
        }
    }

    /// Warnings accumulated so far, draining the internal list.
    pub fn take_warnings(&mut self) -> Vec<Warning> {
        std::mem::take(&mut self.warnings)
    }

    pub(crate) fn warn(&mut self, warning: Warning) {
        self.warnings.push(warning);
    }

    // ------------------------------------------------------------------
    // Driver
    // ------------------------------------------------------------------

    /// Compile a whole program: pre-pass, entry point, queued functions,
    /// thunks, constant tables.
    pub fn compile_program(&mut self, entry: &str, program: &[Sexp]) -> CompileResult<()> {
        for exp in program {
            self.prepass_vtable(exp)?;
        }

        self.e.func_begin(entry, true)?;
        for exp in program {
            self.eval(exp)?;
        }
        self.e.xor(Opnd::Reg(RESULT_REG), Opnd::Reg(RESULT_REG))?;
        self.e.func_end()?;

        // Definitions discovered while draining (lambdas inside method
        // bodies) re-enter the queue and are picked up here too.
        while let Some(fid) = self.queue.pop_front() {
            self.emit_function(fid)?;
        }

        self.emit_vtable_thunks()?;
        self.emit_string_pool()?;
        self.emit_globals()?;
        Ok(())
    }

    /// Depth-first offset assignment for every `defm` name.
    fn prepass_vtable(&mut self, exp: &Sexp) -> CompileResult<()> {
        if let Sexp::List(l) = exp {
            if l.head() == Some("defm") {
                if let Some(Sexp::Sym(name)) = l.items.get(1) {
                    let name = name.clone();
                    self.alloc_voff(&name)?;
                }
            }
            for item in &l.items {
                self.prepass_vtable(item)?;
            }
        }
        Ok(())
    }

    /// Offset of a method name, emitting its `.equ` on first allocation.
    pub(crate) fn alloc_voff(&mut self, name: &str) -> CompileResult<usize> {
        if let Some(off) = self.vtable.get(name) {
            return Ok(off);
        }
        let off = self.vtable.alloc(name);
        self.e.equ(&voff_label(name), (off * 4) as i64)?;
        Ok(off)
    }

    /// Missing-method thunks plus the padded base vtable.
    ///
    /// Each thunk turns the method name into a runtime Symbol, prepends
    /// it to the argument window and tail-calls `__method_missing`.
    fn emit_vtable_thunks(&mut self) -> CompileResult<()> {
        for i in 0..self.vtable.len() {
            let name = self.vtable.names()[i].clone();
            let strlabel = self.strings.intern(name.as_bytes());
            self.e.text()?;
            self.e.label(&crate::vtable::thunk_label(&name))?;
            self.e.push(Opnd::imm_label(&strlabel))?;
            self.e.call_label("__get_string")?;
            self.e.add_esp(4)?;
            self.e.push(Opnd::Reg(RESULT_REG))?;
            self.e.call_label("__get_symbol")?;
            self.e.add_esp(4)?;
            self.e.push(Opnd::Reg(RESULT_REG))?;
            self.e.add(Opnd::Imm(1), Opnd::Reg(NUMARGS_REG))?;
            self.e.jmp("__method_missing")?;
        }

        self.e.rodata()?;
        self.e.export("__base_vtable")?;
        self.e.label("__base_vtable")?;
        for _ in 0..CLASS_HEADER_SLOTS {
            self.e.long_imm(0)?;
        }
        for i in 0..self.vtable.len() {
            let name = self.vtable.names()[i].clone();
            self.e.long_label(&crate::vtable::thunk_label(&name))?;
        }
        Ok(())
    }

    fn emit_string_pool(&mut self) -> CompileResult<()> {
        if self.strings.order.is_empty() {
            return Ok(());
        }
        self.e.rodata()?;
        for i in 0..self.strings.order.len() {
            let (label, bytes) = self.strings.order[i].clone();
            self.e.label(&label)?;
            self.e.string(&bytes)?;
        }
        Ok(())
    }

    fn emit_globals(&mut self) -> CompileResult<()> {
        if self.globals.order.is_empty() {
            return Ok(());
        }
        self.e.bss()?;
        for i in 0..self.globals.order.len() {
            let name = self.globals.order[i].clone();
            self.e.comm(&name)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expression dispatch
    // ------------------------------------------------------------------

    /// Lower one expression. The returned [`Value`] names where the
    /// result lives; a bare unresolved identifier stays `PossibleCallm`
    /// until [`Codegen::eval`] forces it.
    pub fn compile_exp(&mut self, exp: &Sexp) -> CompileResult<Value> {
        let list = match exp {
            Sexp::List(l) if !l.items.is_empty() => l,
            _ => return self.get_arg(exp, Access::Read),
        };
        if let Some(pos) = &list.pos {
            self.last_pos = Some(pos.clone());
            self.e.lineno(pos)?;
        }

        let Some(head) = list.head() else {
            // A computed callee: ((lambda () ...) args...)
            let (callee, args) = list.items.split_first().unwrap();
            return self.compile_call_parts(callee, args, None);
        };
        let head = head.to_string();

        // The operator-method table is consulted before the keyword set.
        if OPERATOR_METHODS.contains(&head.as_str()) {
            return self.compile_operator_method(&head, list);
        }

        match head.as_str() {
            "do" | "block" => self.compile_do(list.rest()),
            "class" | "module" => self.compile_class(list),
            "defun" => self.compile_defun(list),
            "defm" => self.compile_defm(list),
            "if" => self.compile_if(list),
            "lambda" | "proc" => self.compile_lambda(list),
            "assign" => self.compile_assign(list),
            "while" => self.compile_while(list),
            "index" => self.compile_index(list, false),
            "bindex" => self.compile_index(list, true),
            "let" => self.compile_let(list),
            "case" => self.compile_case(list),
            "ternif" => self.compile_ternif(list),
            "hash" => self.compile_hash(list),
            "return" => self.compile_return(list),
            "sexp" => self.compile_sexp(list),
            "rescue" => self.compile_rescue(list),
            "incr" => self.compile_incr(list),
            "required" => self.compile_required(list),
            "add" | "sub" | "mul" | "div" => self.compile_arith(&head, list),
            "eq" | "ne" | "lt" | "le" | "gt" | "ge" => self.compile_comparison(&head, list),
            "saveregs" => {
                self.e.evict_all()?;
                Ok(Value::int(0))
            }
            "and" => self.compile_and(list),
            "or" => self.compile_or(list),
            "preturn" => self.compile_preturn(list),
            "stackframe" => {
                self.e.mov(Opnd::Reg(Reg::Ebp), Opnd::Reg(RESULT_REG))?;
                Ok(Value::subexpr())
            }
            "deref" => self.compile_deref(list),
            "call" => self.compile_call_form(list),
            "callm" => self.compile_callm_form(list),
            "super" => self.compile_super(list),
            "yield" => self.compile_yield(list),
            _ => {
                // Implicit call: the head is the callee.
                let (callee, args) = list.items.split_first().unwrap();
                self.compile_call_parts(callee, args, None)
            }
        }
    }

    /// Lower and force: a `PossibleCallm` result becomes the implicit
    /// self-send it stands for.
    pub(crate) fn eval(&mut self, exp: &Sexp) -> CompileResult<Value> {
        let v = self.compile_exp(exp)?;
        if let Operand::PossibleCallm(name) = &v.op {
            let name = name.clone();
            return self.compile_send_to_self(&name);
        }
        Ok(v)
    }

    /// Lower, force, and load the result into `%eax`.
    pub(crate) fn eval_to_eax(&mut self, exp: &Sexp) -> CompileResult<Value> {
        let v = self.eval(exp)?;
        self.load(&v)?;
        Ok(Value {
            op: Operand::SubExpr,
            hint: v.hint,
        })
    }

    fn compile_do(&mut self, body: &[Sexp]) -> CompileResult<Value> {
        let mut last = Value::int(0);
        for exp in body {
            last = self.eval(exp)?;
        }
        Ok(last)
    }

    fn compile_sexp(&mut self, list: &List) -> CompileResult<Value> {
        self.scopes.push(Scope::Sexp);
        let result = self.compile_do(list.rest());
        self.scopes.pop();
        result
    }

    fn compile_rescue(&mut self, list: &List) -> CompileResult<Value> {
        self.warn(Warning::RescueNotImplemented {
            pos: self.last_pos.clone(),
        });
        match list.rest().first() {
            Some(body) => self.eval(body),
            None => Ok(Value::int(0)),
        }
    }

    fn compile_required(&mut self, list: &List) -> CompileResult<Value> {
        if let Some(Sexp::Str(path)) = list.rest().first() {
            let path = String::from_utf8_lossy(path).into_owned();
            self.e.include(&path)?;
        }
        self.warn(Warning::UnexpandedRequire {
            pos: self.last_pos.clone(),
        });
        Ok(Value::int(0))
    }

    fn compile_incr(&mut self, list: &List) -> CompileResult<Value> {
        let [target, rest @ ..] = list.rest() else {
            return Err(self.fail_missing_target());
        };
        let step = match rest.first() {
            Some(step) => step.clone(),
            None => Sexp::Int(1),
        };
        let rewritten = Sexp::list(vec![
            Sexp::sym("assign"),
            target.clone(),
            Sexp::list(vec![Sexp::sym("add"), target.clone(), step]),
        ]);
        self.compile_exp(&rewritten)
    }

    fn compile_return(&mut self, list: &List) -> CompileResult<Value> {
        match list.rest().first() {
            Some(value) => {
                self.eval_to_eax(value)?;
            }
            None => {
                self.e.mov(Opnd::Imm(0), Opnd::Reg(RESULT_REG))?;
            }
        }
        self.e.func_end()?;
        Ok(Value::subexpr())
    }

    fn compile_operator_method(&mut self, op: &str, list: &List) -> CompileResult<Value> {
        let [receiver, args @ ..] = list.rest() else {
            return Err(self.fail_malformed(op, "missing receiver"));
        };
        let receiver = receiver.clone();
        let args = args.to_vec();
        self.compile_callm(&receiver, op, &args, None, false)
    }

    // ------------------------------------------------------------------
    // Argument resolution
    // ------------------------------------------------------------------

    /// Map a raw AST leaf to a [`Value`].
    ///
    /// Nested lists recurse through `compile_exp`. Unresolved symbols
    /// become `PossibleCallm` on a read and fresh globals on a write.
    pub(crate) fn get_arg(&mut self, exp: &Sexp, access: Access) -> CompileResult<Value> {
        match exp {
            Sexp::Int(n) => Ok(Value::int(*n)),
            Sexp::Str(bytes) => {
                let label = self.strings.intern(bytes);
                Ok(Value::addr(label))
            }
            Sexp::List(l) if l.items.is_empty() => {
                self.warn(Warning::NilArgument {
                    pos: self.last_pos.clone(),
                });
                Ok(Value::int(0))
            }
            Sexp::List(_) => self.compile_exp(exp),
            Sexp::Sym(name) => self.resolve_symbol(name, access),
        }
    }

    fn resolve_symbol(&mut self, name: &str, access: Access) -> CompileResult<Value> {
        if let Some(bare) = name.strip_prefix(':') {
            let bare = bare.to_string();
            return self.compile_symbol_literal(&bare);
        }
        if name == "true" || name == "false" || name == "nil" {
            self.globals.add(name);
            return Ok(Value::object(Operand::Global(name.to_string())));
        }
        if name.starts_with('@') {
            return self.resolve_ivar(name);
        }

        match self.resolve_name(name) {
            Resolution::SelfRef => Ok(Value::object(Operand::Reg(SELF_REG))),
            Resolution::Arg(k) => self.cached_or(name, Operand::Arg(k), access),
            Resolution::Local(k) => self.cached_or(name, Operand::LVar(k), access),
            Resolution::IVar(k) => Ok(Value::object(Operand::IVar(k))),
            Resolution::Global(g) => Ok(Value::new(Operand::Global(g))),
            Resolution::Class(id) => {
                let class_name = self.classes.get(id).name.clone();
                Ok(Value::object(Operand::Global(class_name)))
            }
            Resolution::Function(label) => Ok(Value::addr(label)),
            Resolution::Unresolved => {
                if name == "self" {
                    // Outside any method body `self` is the nil object.
                    self.globals.add("nil");
                    return Ok(Value::object(Operand::Global("nil".to_string())));
                }
                match access {
                    Access::Read => Ok(Value::new(Operand::PossibleCallm(name.to_string()))),
                    Access::Write => {
                        // Constants assigned directly in a class body
                        // belong to the class and are reachable through
                        // static dereference.
                        if let Some(cid) = self.in_class_body() {
                            let class_name = self.classes.get(cid).name.clone();
                            let label = format!("{}__{}", class_name, name);
                            self.classes
                                .get_mut(cid)
                                .consts
                                .insert(name.to_string(), label.clone());
                            self.globals.add(&label);
                            return Ok(Value::new(Operand::Global(label)));
                        }
                        self.globals.add(name);
                        Ok(Value::new(Operand::Global(name.to_string())))
                    }
                }
            }
        }
    }

    /// Ask the register cache for a local/argument slot. Only variables
    /// the current function reads more than once are worth a register.
    fn cached_or(&mut self, name: &str, op: Operand, access: Access) -> CompileResult<Value> {
        let home = match &op {
            Operand::Arg(k) => Self::arg_home(*k),
            Operand::LVar(k) => Self::lvar_home(*k),
            _ => return Ok(Value::new(op)),
        };
        let worth_caching = self.e.cached_reg(name).is_some()
            || self
                .current_function()
                .map(|f| f.usage(name) > 1)
                .unwrap_or(false);
        if !worth_caching {
            return Ok(Value::new(op));
        }
        match self.e.cache_var(name, home, access == Access::Write)? {
            Some(reg) => Ok(Value::new(Operand::Reg(reg))),
            None => Ok(Value::new(op)),
        }
    }

    fn resolve_ivar(&mut self, name: &str) -> CompileResult<Value> {
        let Some(cid) = self.current_class() else {
            return Err(CompileError::OutsideMethod {
                what: name.to_string(),
                ctx: self.context(name),
            });
        };
        let slot = self.classes.get_mut(cid).ivar_slot(name);
        Ok(Value::object(Operand::IVar(slot)))
    }

    /// `:sym` literals allocate a runtime Symbol once and cache it in a
    /// global; the first use site carries the initialisation.
    fn compile_symbol_literal(&mut self, bare: &str) -> CompileResult<Value> {
        if let Some(global) = self.symbol_globals.get(bare) {
            return Ok(Value::object(Operand::Global(global.clone())));
        }
        let global = format!("__sym_{}", clean_label(bare));
        self.symbol_globals.insert(bare.to_string(), global.clone());
        self.globals.add(&global);

        let strlabel = self.strings.intern(bare.as_bytes());
        self.caller_save(|c| {
            c.with_stack(1, |c| {
                c.e.mov(Opnd::imm_label(&strlabel), Opnd::Mem(0, Reg::Esp))?;
                c.e.call_label("__get_string")?;
                c.e.mov(Opnd::Reg(RESULT_REG), Opnd::Mem(0, Reg::Esp))?;
                c.e.call_label("__get_symbol")?;
                Ok(())
            })
        })?;
        self.e
            .mov(Opnd::Reg(RESULT_REG), Opnd::mem_label(&global))?;
        Ok(Value::object(Operand::Global(global)))
    }

    /// Walk the scope chain inward-to-outward.
    pub(crate) fn resolve_name(&self, name: &str) -> Resolution {
        for scope in self.scopes.iter().rev() {
            match scope {
                Scope::Sexp => continue,
                Scope::Local(ls) => {
                    if let Some(slot) = ls.slot(name) {
                        return Resolution::Local(slot);
                    }
                }
                Scope::Function(fid) => {
                    let f = &self.funcs[fid.index()];
                    if name == "self" && f.is_method {
                        return Resolution::SelfRef;
                    }
                    if let Some(idx) = f.param_index(name) {
                        return Resolution::Arg(idx);
                    }
                }
                Scope::Class(cid) => {
                    let class = self.classes.get(*cid);
                    if let Some(label) = class.consts.get(name) {
                        return Resolution::Global(label.clone());
                    }
                    if let Some(slot) = class.lookup_ivar(name) {
                        return Resolution::IVar(slot);
                    }
                }
                Scope::Global => {
                    if let Some(label) = self.global_funcs.get(name) {
                        return Resolution::Function(label.clone());
                    }
                    if let Some(id) = self.classes.lookup(name) {
                        return Resolution::Class(id);
                    }
                    if self.globals.contains(name) {
                        return Resolution::Global(name.to_string());
                    }
                }
            }
        }
        Resolution::Unresolved
    }

    // ------------------------------------------------------------------
    // Loads and stores
    // ------------------------------------------------------------------

    pub(crate) fn arg_home(k: usize) -> Opnd {
        Opnd::Mem(8 + 4 * k as i32, Reg::Ebp)
    }

    pub(crate) fn lvar_home(k: usize) -> Opnd {
        Opnd::Mem(-4 * (k as i32 + 1), Reg::Ebp)
    }

    /// Materialise a value in `%eax`.
    pub(crate) fn load(&mut self, v: &Value) -> CompileResult<()> {
        match &v.op {
            Operand::Int(n) => self.e.mov(Opnd::Imm(*n), Opnd::Reg(RESULT_REG))?,
            Operand::Addr(l) => self.e.mov(Opnd::imm_label(l), Opnd::Reg(RESULT_REG))?,
            Operand::Reg(r) => self.e.mov(Opnd::Reg(*r), Opnd::Reg(RESULT_REG))?,
            Operand::LVar(k) => self.e.mov(Self::lvar_home(*k), Opnd::Reg(RESULT_REG))?,
            Operand::Arg(k) => self.e.mov(Self::arg_home(*k), Opnd::Reg(RESULT_REG))?,
            Operand::IVar(k) => self
                .e
                .mov(Opnd::Mem(4 * *k as i32, SELF_REG), Opnd::Reg(RESULT_REG))?,
            Operand::Global(g) => self.e.mov(Opnd::mem_label(g), Opnd::Reg(RESULT_REG))?,
            Operand::Indirect(r) => self.e.mov(Opnd::Mem(0, *r), Opnd::Reg(RESULT_REG))?,
            Operand::Indirect8(r) => {
                let src = format!("({})", r);
                self.e.movzbl(&src, RESULT_REG)?;
            }
            Operand::SubExpr => {}
            Operand::PossibleCallm(name) => {
                let name = name.clone();
                self.compile_send_to_self(&name)?;
            }
        }
        Ok(())
    }

    /// Store `%eax` into an assignment target.
    pub(crate) fn store_from_eax(&mut self, target: &Value) -> CompileResult<()> {
        match &target.op {
            Operand::Reg(r) => self.e.mov(Opnd::Reg(RESULT_REG), Opnd::Reg(*r))?,
            Operand::LVar(k) => self.e.mov(Opnd::Reg(RESULT_REG), Self::lvar_home(*k))?,
            Operand::Arg(k) => self.e.mov(Opnd::Reg(RESULT_REG), Self::arg_home(*k))?,
            Operand::Global(g) => self.e.mov(Opnd::Reg(RESULT_REG), Opnd::mem_label(g))?,
            Operand::IVar(k) => {
                // The source survives the self reload on the stack.
                self.e.push(Opnd::Reg(RESULT_REG))?;
                self.reload_self()?;
                self.e.pop(Opnd::Reg(RESULT_REG))?;
                self.e
                    .mov(Opnd::Reg(RESULT_REG), Opnd::Mem(4 * *k as i32, SELF_REG))?;
            }
            Operand::Indirect(r) => self.e.mov(Opnd::Reg(RESULT_REG), Opnd::Mem(0, *r))?,
            Operand::Indirect8(r) => {
                let dst = Opnd::Mem(0, *r);
                self.e.movb("%al", dst)?;
            }
            _ => return Err(self.fail_missing_target()),
        }
        Ok(())
    }

    /// Reload `%esi` after a call: from the argument window inside a
    /// method, from the nil global elsewhere.
    pub(crate) fn reload_self(&mut self) -> CompileResult<()> {
        match self.resolve_name("self") {
            Resolution::SelfRef => {
                let f = self.current_function().expect("method scope");
                let slot = f.param_index("self").expect("self parameter");
                self.e.mov(Self::arg_home(slot), Opnd::Reg(SELF_REG))?;
            }
            _ => {
                self.globals.add("nil");
                self.e.mov(Opnd::mem_label("nil"), Opnd::Reg(SELF_REG))?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Assignment
    // ------------------------------------------------------------------

    fn compile_assign(&mut self, list: &List) -> CompileResult<Value> {
        let [target, value] = list.rest() else {
            return Err(self.fail_missing_target());
        };

        if let Sexp::List(tl) = target {
            match tl.head() {
                // foo.bar = v  ≡  foo.bar=(v)
                Some("callm") => {
                    let (Some(obj), Some(Sexp::Sym(m))) = (tl.items.get(1), tl.items.get(2))
                    else {
                        return Err(self.fail_missing_target());
                    };
                    let setter = format!("{}=", m);
                    let obj = obj.clone();
                    return self.compile_callm(&obj, &setter, &[value.clone()], None, false);
                }
                Some("index") => return self.compile_indexed_store(tl, value, false),
                Some("bindex") => return self.compile_indexed_store(tl, value, true),
                _ => return Err(self.fail_missing_target()),
            }
        }

        let Sexp::Sym(name) = target else {
            return Err(self.fail_missing_target());
        };

        let v = self.eval_to_eax(value)?;
        let dest = self.get_arg(target, Access::Write)?;
        if let Operand::PossibleCallm(_) = dest.op {
            // Write access never produces an implicit send.
            unreachable!("write access resolved to a send for {}", name);
        }
        self.store_from_eax(&dest)?;
        Ok(Value {
            op: Operand::SubExpr,
            hint: v.hint,
        })
    }

    /// `a[i] = v` through a computed address.
    fn compile_indexed_store(
        &mut self,
        target: &List,
        value: &Sexp,
        byte: bool,
    ) -> CompileResult<Value> {
        let [arr, idx] = target.rest() else {
            return Err(self.fail_missing_target());
        };
        let (arr, idx) = (arr.clone(), idx.clone());
        self.eval_to_eax(value)?;
        self.e.push(Opnd::Reg(RESULT_REG))?;
        let r = self.index_address(&arr, &idx, byte)?;
        self.e.pop(Opnd::Reg(RESULT_REG))?;
        let dest = if byte {
            Value::new(Operand::Indirect8(r))
        } else {
            Value::new(Operand::Indirect(r))
        };
        self.store_from_eax(&dest)?;
        self.e.release_reg(r);
        Ok(Value::subexpr())
    }

    // ------------------------------------------------------------------
    // Indexing
    // ------------------------------------------------------------------

    /// `index a i` is the 32-bit slot `[a + i*4]`; `bindex` the byte
    /// `[a + i]`. The result is valid as a read and as a store target.
    fn compile_index(&mut self, list: &List, byte: bool) -> CompileResult<Value> {
        let [arr, idx] = list.rest() else {
            return Err(self.fail_malformed(if byte { "bindex" } else { "index" }, "need array and index"));
        };
        let (arr, idx) = (arr.clone(), idx.clone());
        let hint = self.indexed_hint(&arr, &idx);
        let r = self.index_address(&arr, &idx, byte)?;
        // The address register stays valid until the next claim; users
        // must load or store before emitting another expression.
        self.e.release_reg(r);
        let op = if byte {
            Operand::Indirect8(r)
        } else {
            Operand::Indirect(r)
        };
        Ok(Value { op, hint })
    }

    /// Environment slot 0 is the saved frame pointer; every other slot
    /// of `__env__` is an object.
    fn indexed_hint(&self, arr: &Sexp, idx: &Sexp) -> TypeHint {
        if arr.as_sym() == Some("__env__") {
            if idx.as_int() == Some(0) {
                TypeHint::Unspecified
            } else {
                TypeHint::Object
            }
        } else {
            TypeHint::Unspecified
        }
    }

    /// Compute an element address into a claimed scratch register.
    fn index_address(&mut self, arr: &Sexp, idx: &Sexp, byte: bool) -> CompileResult<Reg> {
        self.eval_to_eax(arr)?;
        self.e.push(Opnd::Reg(RESULT_REG))?;
        self.eval_to_eax(idx)?;
        if !byte {
            self.e.sall(2, Opnd::Reg(RESULT_REG))?;
        }
        let r = self.e.claim_scratch()?;
        self.e.pop(Opnd::Reg(r))?;
        self.e.add(Opnd::Reg(RESULT_REG), Opnd::Reg(r))?;
        Ok(r)
    }

    // ------------------------------------------------------------------
    // Static dereference, hash literals
    // ------------------------------------------------------------------

    fn compile_deref(&mut self, list: &List) -> CompileResult<Value> {
        let [base, member] = list.rest() else {
            return Err(self.fail_malformed("deref", "need base and member"));
        };
        let (Some(base_name), Some(member_name)) = (base.as_sym(), member.as_sym()) else {
            return Err(self.fail_malformed("deref", "base and member must be names"));
        };
        let Some(cid) = self.classes.lookup(base_name) else {
            return Err(CompileError::UnresolvedDeref {
                base: base_name.to_string(),
                member: member_name.to_string(),
                ctx: self.context(&format!("(deref {} {})", base_name, member_name)),
            });
        };
        match self.classes.get(cid).consts.get(member_name) {
            Some(label) => Ok(Value::new(Operand::Global(label.clone()))),
            None => Err(CompileError::UnresolvedDeref {
                base: base_name.to_string(),
                member: member_name.to_string(),
                ctx: self.context(&format!("(deref {} {})", base_name, member_name)),
            }),
        }
    }

    /// Hash literals rewrite into a `Hash.new` plus one `[]=` per pair.
    fn compile_hash(&mut self, list: &List) -> CompileResult<Value> {
        let mut body = vec![
            Sexp::sym("let"),
            Sexp::list(vec![Sexp::sym("__hash")]),
            Sexp::list(vec![
                Sexp::sym("assign"),
                Sexp::sym("__hash"),
                Sexp::list(vec![
                    Sexp::sym("callm"),
                    Sexp::sym("Hash"),
                    Sexp::sym("new"),
                    Sexp::list(vec![]),
                ]),
            ]),
        ];
        for entry in list.rest() {
            let pair = entry.as_list().filter(|l| l.head() == Some("pair"));
            let Some(pair) = pair else {
                return Err(CompileError::MalformedHash {
                    ctx: self.context(&entry.to_string()),
                });
            };
            let [key, value] = pair.rest() else {
                return Err(CompileError::MalformedHash {
                    ctx: self.context(&entry.to_string()),
                });
            };
            body.push(Sexp::list(vec![
                Sexp::sym("callm"),
                Sexp::sym("__hash"),
                Sexp::sym("[]="),
                Sexp::list(vec![key.clone(), value.clone()]),
            ]));
        }
        body.push(Sexp::sym("__hash"));
        self.globals.add("Hash");
        let rewritten = Sexp::List(List::new(body));
        self.compile_exp(&rewritten)
    }

    // ------------------------------------------------------------------
    // Arithmetic and comparisons
    // ------------------------------------------------------------------

    /// Two-operand arithmetic. The left operand waits on the stack while
    /// the right is computed, so intervening calls cannot clobber it.
    fn compile_arith(&mut self, op: &str, list: &List) -> CompileResult<Value> {
        let [left, right] = list.rest() else {
            return Err(self.fail_malformed(op, "need two operands"));
        };
        let (left, right) = (left.clone(), right.clone());
        self.eval_to_eax(&left)?;
        self.e.push(Opnd::Reg(RESULT_REG))?;
        self.eval_to_eax(&right)?;

        match op {
            "add" => self.with_register(|c, r| {
                c.e.pop(Opnd::Reg(r))?;
                c.e.add(Opnd::Reg(r), Opnd::Reg(RESULT_REG))?;
                Ok(())
            })?,
            "sub" => self.with_register(|c, r| {
                c.e.pop(Opnd::Reg(r))?;
                c.e.sub(Opnd::Reg(RESULT_REG), Opnd::Reg(r))?;
                c.e.mov(Opnd::Reg(r), Opnd::Reg(RESULT_REG))?;
                Ok(())
            })?,
            "mul" => self.with_register(|c, r| {
                c.e.pop(Opnd::Reg(r))?;
                c.e.imul(Opnd::Reg(r), Opnd::Reg(RESULT_REG))?;
                Ok(())
            })?,
            "div" => {
                // idivl fixes the dividend in %edx:%eax.
                self.e.claim_reg(Reg::Ecx)?;
                self.e.claim_reg(Reg::Edx)?;
                self.e.mov(Opnd::Reg(RESULT_REG), Opnd::Reg(Reg::Ecx))?;
                self.e.pop(Opnd::Reg(RESULT_REG))?;
                self.e.cltd()?;
                self.e.idiv(Reg::Ecx)?;
                self.e.release_reg(Reg::Edx);
                self.e.release_reg(Reg::Ecx);
            }
            _ => unreachable!("arith op {}", op),
        }
        Ok(Value::subexpr())
    }

    fn compile_comparison(&mut self, op: &str, list: &List) -> CompileResult<Value> {
        let [left, right] = list.rest() else {
            return Err(self.fail_malformed(op, "need two operands"));
        };
        let (left, right) = (left.clone(), right.clone());
        let cond = match op {
            "eq" => Cond::E,
            "ne" => Cond::Ne,
            "lt" => Cond::L,
            "le" => Cond::Le,
            "gt" => Cond::G,
            "ge" => Cond::Ge,
            _ => unreachable!("comparison op {}", op),
        };
        self.eval_to_eax(&left)?;
        self.e.push(Opnd::Reg(RESULT_REG))?;
        self.eval_to_eax(&right)?;
        let r = self.e.claim_scratch()?;
        self.e.pop(Opnd::Reg(r))?;
        // left - right sets the flags for the comparison direction.
        self.e.cmp(Opnd::Reg(RESULT_REG), Opnd::Reg(r))?;
        self.e.setcc(cond)?;
        self.e.movzbl("%al", RESULT_REG)?;
        self.e.release_reg(r);
        Ok(Value::subexpr())
    }

    // ------------------------------------------------------------------
    // Scoped helpers
    // ------------------------------------------------------------------

    /// Spill every cached register before a call site.
    pub(crate) fn caller_save<R>(
        &mut self,
        f: impl FnOnce(&mut Self) -> CompileResult<R>,
    ) -> CompileResult<R> {
        self.e.evict_all()?;
        f(self)
    }

    /// A fixed argument window of `slots` 4-byte slots.
    pub(crate) fn with_stack<R>(
        &mut self,
        slots: usize,
        f: impl FnOnce(&mut Self) -> CompileResult<R>,
    ) -> CompileResult<R> {
        self.e.sub_esp(slots * 4)?;
        let result = f(self);
        self.e.add_esp(slots * 4)?;
        result
    }

    /// Claim a scratch register for the duration of `f`.
    pub(crate) fn with_register<R>(
        &mut self,
        f: impl FnOnce(&mut Self, Reg) -> CompileResult<R>,
    ) -> CompileResult<R> {
        let r = self.e.claim_scratch()?;
        let result = f(self, r);
        self.e.release_reg(r);
        result
    }

    /// Slot index where the next local block starts.
    pub(crate) fn local_base(&self) -> usize {
        for scope in self.scopes.iter().rev() {
            match scope {
                Scope::Local(ls) => return ls.next_base(),
                Scope::Function(_) => return 0,
                _ => continue,
            }
        }
        0
    }

    pub(crate) fn current_class(&self) -> Option<ClassId> {
        self.scopes.iter().rev().find_map(|s| match s {
            Scope::Class(id) => Some(*id),
            _ => None,
        })
    }

    /// The class whose body is being lowered, if the innermost defining
    /// scope is a class rather than a function.
    fn in_class_body(&self) -> Option<ClassId> {
        for scope in self.scopes.iter().rev() {
            match scope {
                Scope::Class(id) => return Some(*id),
                Scope::Function(_) => return None,
                _ => continue,
            }
        }
        None
    }

    pub(crate) fn current_function(&self) -> Option<&FunctionDef> {
        self.scopes.iter().rev().find_map(|s| match s {
            Scope::Function(fid) => Some(&self.funcs[fid.index()]),
            _ => None,
        })
    }

    pub(crate) fn fresh_lambda_label(&mut self) -> String {
        let label = format!("__lambda_{}", self.lambda_seq);
        self.lambda_seq += 1;
        label
    }

    pub(crate) fn intern_string(&mut self, bytes: &[u8]) -> String {
        self.strings.intern(bytes)
    }

    pub(crate) fn register_global(&mut self, name: &str) {
        self.globals.add(name);
    }

    pub(crate) fn register_global_function(&mut self, name: &str, label: &str) {
        self.global_funcs.insert(name.to_string(), label.to_string());
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    fn scope_description(&self) -> String {
        for scope in self.scopes.iter().rev() {
            match scope {
                Scope::Function(fid) => {
                    return format!("function {}", self.funcs[fid.index()].name)
                }
                Scope::Class(cid) => return format!("class {}", self.classes.get(*cid).name),
                _ => continue,
            }
        }
        "top level".to_string()
    }

    pub(crate) fn context(&self, expr: &str) -> ErrorContext {
        ErrorContext {
            pos: self.last_pos.clone(),
            scope: self.scope_description(),
            expr: expr.to_string(),
        }
    }

    pub(crate) fn fail_missing_target(&self) -> CompileError {
        CompileError::MissingAssignTarget {
            ctx: self.context("assign"),
        }
    }

    pub(crate) fn fail_malformed(&self, head: &str, message: &str) -> CompileError {
        CompileError::MalformedForm {
            head: head.to_string(),
            message: message.to_string(),
            ctx: self.context(head),
        }
    }
}

/// True when `name` is one of the fixed dispatch keywords.
pub fn is_keyword(name: &str) -> bool {
    KEYWORDS.contains(&name)
}
