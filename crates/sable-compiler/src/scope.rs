//! Scope chain and class registry
//!
//! Name resolution walks a stack of scope frames inward-to-outward; the
//! first frame that owns a name wins. Class scopes live in an arena
//! indexed by [`ClassId`] so that classes, superclasses and methods can
//! reference each other by id without ownership cycles.

use crate::function::FuncId;
use rustc_hash::FxHashMap;

/// Index of a class in the registry arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(pub u32);

impl ClassId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Per-class state: instance variables, vtable entries, constants.
#[derive(Debug)]
pub struct ClassInfo {
    pub name: String,
    pub superclass: Option<ClassId>,
    /// Instance variables introduced by this class, in source order.
    pub ivars: Vec<String>,
    /// `@name` → absolute instance slot (slot 0 is the class pointer).
    ivar_slots: FxHashMap<String, usize>,
    /// Instance-variable count inherited from the superclass chain.
    pub ivar_base: usize,
    /// Methods defined by this class: method name → emitted label.
    pub vtable: FxHashMap<String, String>,
    /// Class-level constants: name → global label.
    pub consts: FxHashMap<String, String>,
}

impl ClassInfo {
    fn new(name: impl Into<String>, superclass: Option<ClassId>, ivar_base: usize) -> Self {
        Self {
            name: name.into(),
            superclass,
            ivars: Vec::new(),
            ivar_slots: FxHashMap::default(),
            ivar_base,
            vtable: FxHashMap::default(),
            consts: FxHashMap::default(),
        }
    }

    /// Slot of `@name`, allocated past the inherited block on first use.
    pub fn ivar_slot(&mut self, name: &str) -> usize {
        if let Some(&slot) = self.ivar_slots.get(name) {
            return slot;
        }
        let slot = 1 + self.ivar_base + self.ivars.len();
        self.ivars.push(name.to_string());
        self.ivar_slots.insert(name.to_string(), slot);
        slot
    }

    pub fn lookup_ivar(&self, name: &str) -> Option<usize> {
        self.ivar_slots.get(name).copied()
    }

    /// Total instance slots including the class pointer.
    pub fn instance_slots(&self) -> usize {
        1 + self.ivar_base + self.ivars.len()
    }

    /// Record a method definition.
    pub fn define_method(&mut self, name: &str, label: &str) {
        self.vtable.insert(name.to_string(), label.to_string());
    }

    pub fn defines_method(&self, name: &str) -> bool {
        self.vtable.contains_key(name)
    }
}

/// Arena of class scopes, indexed by name and id.
#[derive(Debug, Default)]
pub struct ClassTable {
    classes: Vec<ClassInfo>,
    by_name: FxHashMap<String, ClassId>,
}

impl ClassTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, name: &str) -> Option<ClassId> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, id: ClassId) -> &ClassInfo {
        &self.classes[id.index()]
    }

    pub fn get_mut(&mut self, id: ClassId) -> &mut ClassInfo {
        &mut self.classes[id.index()]
    }

    /// Resolve or register a class. The inherited instance-variable base
    /// is captured from the superclass at creation time.
    pub fn get_or_create(&mut self, name: &str, superclass: Option<ClassId>) -> ClassId {
        if let Some(id) = self.lookup(name) {
            return id;
        }
        let ivar_base = superclass
            .map(|sid| {
                let s = self.get(sid);
                s.ivar_base + s.ivars.len()
            })
            .unwrap_or(0);
        let id = ClassId::new(self.classes.len() as u32);
        self.classes.push(ClassInfo::new(name, superclass, ivar_base));
        self.by_name.insert(name.to_string(), id);
        id
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// True when any ancestor of `id` defines `method`. A `super` send
    /// to a method no ancestor defines can only reach the missing-method
    /// thunk at runtime.
    pub fn superclass_defines(&self, id: ClassId, method: &str) -> bool {
        let mut cur = self.get(id).superclass;
        while let Some(sid) = cur {
            let info = self.get(sid);
            if info.defines_method(method) {
                return true;
            }
            cur = info.superclass;
        }
        false
    }
}

/// Block of let-bound locals with consecutive slot indices.
#[derive(Debug, Clone)]
pub struct LocalScope {
    pub names: Vec<String>,
    /// Slot index of the first name.
    pub base: usize,
}

impl LocalScope {
    pub fn slot(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name).map(|i| self.base + i)
    }

    /// Slot index one past this block.
    pub fn next_base(&self) -> usize {
        self.base + self.names.len()
    }
}

/// One frame of the scope chain.
#[derive(Debug, Clone)]
pub enum Scope {
    Global,
    Class(ClassId),
    Function(FuncId),
    Local(LocalScope),
    /// Transparent pass-through marking a raw s-expression region.
    Sexp,
}

/// Outcome of resolving a bare name through the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Arg(usize),
    Local(usize),
    IVar(usize),
    Global(String),
    Class(ClassId),
    /// A known global function; carries its label.
    Function(String),
    /// `self` inside a method body.
    SelfRef,
    Unresolved,
}
