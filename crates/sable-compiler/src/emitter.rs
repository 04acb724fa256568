//! Assembly sink and register cache
//!
//! Owns the output stream and everything that is purely about emitting
//! 32-bit x86 text: section switches, labels, instructions, read-only
//! data, BSS, and the register cache with its spill discipline. The code
//! generator drives this and never touches the stream directly.
//!
//! Calling convention recap: `%eax` result, `%esi` self, `%ebx` runtime
//! argument count; `%edx`, `%ecx` and `%edi` are available to the cache.

use std::fmt;
use std::io::{self, Write};

/// Machine registers used by the generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    Eax,
    Ebx,
    Ecx,
    Edx,
    Esi,
    Edi,
    Ebp,
    Esp,
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Reg::Eax => "%eax",
            Reg::Ebx => "%ebx",
            Reg::Ecx => "%ecx",
            Reg::Edx => "%edx",
            Reg::Esi => "%esi",
            Reg::Edi => "%edi",
            Reg::Ebp => "%ebp",
            Reg::Esp => "%esp",
        };
        f.write_str(name)
    }
}

/// Result register of every lowering.
pub const RESULT_REG: Reg = Reg::Eax;
/// Holds `self` across a method body.
pub const SELF_REG: Reg = Reg::Esi;
/// Holds the runtime argument count at function entry.
pub const NUMARGS_REG: Reg = Reg::Ebx;

/// Registers the cache may claim for locals and scratch values.
const NUM_CACHE_REGS: usize = 3;
const CACHE_REGS: [Reg; NUM_CACHE_REGS] = [Reg::Edx, Reg::Ecx, Reg::Edi];

/// An instruction operand in AT&T syntax.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Opnd {
    /// `$42`
    Imm(i64),
    /// `$label`: address of a label or value of an `.equ` constant.
    ImmLabel(String),
    /// `%reg`
    Reg(Reg),
    /// `off(%reg)`
    Mem(i32, Reg),
    /// `label`: direct memory reference to a global.
    MemLabel(String),
    /// `(%base,%index,scale)`
    MemIndex(Reg, Reg, u8),
}

impl Opnd {
    pub fn imm_label(l: impl Into<String>) -> Self {
        Opnd::ImmLabel(l.into())
    }

    pub fn mem_label(l: impl Into<String>) -> Self {
        Opnd::MemLabel(l.into())
    }
}

impl fmt::Display for Opnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opnd::Imm(n) => write!(f, "${}", n),
            Opnd::ImmLabel(l) => write!(f, "${}", l),
            Opnd::Reg(r) => write!(f, "{}", r),
            Opnd::Mem(0, r) => write!(f, "({})", r),
            Opnd::Mem(off, r) => write!(f, "{}({})", off, r),
            Opnd::MemLabel(l) => write!(f, "{}", l),
            Opnd::MemIndex(base, index, scale) => write!(f, "({},{},{})", base, index, scale),
        }
    }
}

/// Condition codes for jumps and set instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    E,
    Ne,
    L,
    Le,
    G,
    Ge,
    Z,
    Nz,
}

impl fmt::Display for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Cond::E => "e",
            Cond::Ne => "ne",
            Cond::L => "l",
            Cond::Le => "le",
            Cond::G => "g",
            Cond::Ge => "ge",
            Cond::Z => "z",
            Cond::Nz => "nz",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Text,
    Rodata,
    Bss,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    var: String,
    home: Opnd,
    dirty: bool,
}

/// Cache state for the registers in [`CACHE_REGS`].
///
/// At most one entry is dirty at a time; marking a second one dirty
/// spills the first back to its home slot.
#[derive(Debug, Default)]
struct RegisterCache {
    entries: [Option<CacheEntry>; NUM_CACHE_REGS],
    claimed: [bool; NUM_CACHE_REGS],
}

fn cache_index(reg: Reg) -> Option<usize> {
    CACHE_REGS.iter().position(|&r| r == reg)
}

/// The assembly output sink.
pub struct Emitter<W: Write> {
    out: W,
    section: Section,
    label_seq: u32,
    cache: RegisterCache,
    /// Emit source-position comments.
    debug_info: bool,
    last_pos: Option<(String, u32)>,
}

impl<W: Write> Emitter<W> {
    pub fn new(out: W, debug_info: bool) -> Self {
        Self {
            out,
            section: Section::None,
            label_seq: 0,
            cache: RegisterCache::default(),
            debug_info,
            last_pos: None,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    // ------------------------------------------------------------------
    // Sections, labels, data
    // ------------------------------------------------------------------

    pub fn text(&mut self) -> io::Result<()> {
        self.switch(Section::Text, "\t.text")
    }

    pub fn rodata(&mut self) -> io::Result<()> {
        self.switch(Section::Rodata, "\t.section\t.rodata")
    }

    pub fn bss(&mut self) -> io::Result<()> {
        self.switch(Section::Bss, "\t.section\t.bss")
    }

    fn switch(&mut self, section: Section, directive: &str) -> io::Result<()> {
        if self.section != section {
            writeln!(self.out, "{}", directive)?;
            self.section = section;
        }
        Ok(())
    }

    pub fn label(&mut self, name: &str) -> io::Result<()> {
        writeln!(self.out, "{}:", name)
    }

    /// Fresh local label.
    pub fn local(&mut self) -> String {
        let l = format!(".L{}", self.label_seq);
        self.label_seq += 1;
        l
    }

    pub fn export(&mut self, name: &str) -> io::Result<()> {
        writeln!(self.out, "\t.globl\t{}", name)
    }

    pub fn equ(&mut self, name: &str, value: i64) -> io::Result<()> {
        writeln!(self.out, "\t.equ\t{}, {}", name, value)
    }

    pub fn long_label(&mut self, label: &str) -> io::Result<()> {
        writeln!(self.out, "\t.long\t{}", label)
    }

    pub fn long_imm(&mut self, value: i64) -> io::Result<()> {
        writeln!(self.out, "\t.long\t{}", value)
    }

    /// NUL-terminated byte string in the current section.
    pub fn string(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut escaped = String::with_capacity(bytes.len());
        for &b in bytes {
            match b {
                b'"' => escaped.push_str("\\\""),
                b'\\' => escaped.push_str("\\\\"),
                b'\n' => escaped.push_str("\\n"),
                b'\t' => escaped.push_str("\\t"),
                b'\r' => escaped.push_str("\\r"),
                0x20..=0x7e => escaped.push(b as char),
                _ => escaped.push_str(&format!("\\{:03o}", b)),
            }
        }
        writeln!(self.out, "\t.string\t\"{}\"", escaped)
    }

    /// 4-byte zero-initialised global.
    pub fn comm(&mut self, name: &str) -> io::Result<()> {
        writeln!(self.out, "\t.comm\t{}, 4, 4", name)
    }

    pub fn comment(&mut self, text: &str) -> io::Result<()> {
        writeln!(self.out, "\t# {}", text)
    }

    /// Source-position comment, deduplicated per line.
    pub fn lineno(&mut self, pos: &sable_sexpr::Pos) -> io::Result<()> {
        if !self.debug_info {
            return Ok(());
        }
        let key = (pos.file.clone(), pos.line);
        if self.last_pos.as_ref() == Some(&key) {
            return Ok(());
        }
        writeln!(self.out, "\t# {}:{}", pos.file, pos.line)?;
        self.last_pos = Some(key);
        Ok(())
    }

    /// Marker for an included source file.
    pub fn include(&mut self, path: &str) -> io::Result<()> {
        if self.debug_info {
            writeln!(self.out, "\t# include: {}", path)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Instructions
    // ------------------------------------------------------------------

    pub fn op0(&mut self, mnemonic: &str) -> io::Result<()> {
        writeln!(self.out, "\t{}", mnemonic)
    }

    pub fn op1(&mut self, mnemonic: &str, a: &Opnd) -> io::Result<()> {
        writeln!(self.out, "\t{}\t{}", mnemonic, a)
    }

    pub fn op2(&mut self, mnemonic: &str, src: &Opnd, dst: &Opnd) -> io::Result<()> {
        writeln!(self.out, "\t{}\t{}, {}", mnemonic, src, dst)
    }

    pub fn mov(&mut self, src: Opnd, dst: Opnd) -> io::Result<()> {
        if src == dst {
            return Ok(());
        }
        self.op2("movl", &src, &dst)
    }

    pub fn movb(&mut self, src: &str, dst: Opnd) -> io::Result<()> {
        writeln!(self.out, "\tmovb\t{}, {}", src, dst)
    }

    pub fn movzbl(&mut self, src: &str, dst: Reg) -> io::Result<()> {
        writeln!(self.out, "\tmovzbl\t{}, {}", src, dst)
    }

    pub fn add(&mut self, src: Opnd, dst: Opnd) -> io::Result<()> {
        self.op2("addl", &src, &dst)
    }

    pub fn sub(&mut self, src: Opnd, dst: Opnd) -> io::Result<()> {
        self.op2("subl", &src, &dst)
    }

    pub fn imul(&mut self, src: Opnd, dst: Opnd) -> io::Result<()> {
        self.op2("imull", &src, &dst)
    }

    pub fn cmp(&mut self, src: Opnd, dst: Opnd) -> io::Result<()> {
        self.op2("cmpl", &src, &dst)
    }

    pub fn test(&mut self, a: Opnd, b: Opnd) -> io::Result<()> {
        self.op2("testl", &a, &b)
    }

    pub fn xor(&mut self, src: Opnd, dst: Opnd) -> io::Result<()> {
        self.op2("xorl", &src, &dst)
    }

    pub fn sall(&mut self, bits: u8, dst: Opnd) -> io::Result<()> {
        self.op2("sall", &Opnd::Imm(bits as i64), &dst)
    }

    pub fn push(&mut self, a: Opnd) -> io::Result<()> {
        self.op1("pushl", &a)
    }

    pub fn pop(&mut self, a: Opnd) -> io::Result<()> {
        self.op1("popl", &a)
    }

    pub fn dec(&mut self, dst: Opnd) -> io::Result<()> {
        self.op1("decl", &dst)
    }

    pub fn idiv(&mut self, divisor: Reg) -> io::Result<()> {
        self.op1("idivl", &Opnd::Reg(divisor))
    }

    /// Sign-extend `%eax` into `%edx:%eax`.
    pub fn cltd(&mut self) -> io::Result<()> {
        self.op0("cltd")
    }

    pub fn jmp(&mut self, label: &str) -> io::Result<()> {
        writeln!(self.out, "\tjmp\t{}", label)
    }

    pub fn jcc(&mut self, cond: Cond, label: &str) -> io::Result<()> {
        writeln!(self.out, "\tj{}\t{}", cond, label)
    }

    pub fn setcc(&mut self, cond: Cond) -> io::Result<()> {
        writeln!(self.out, "\tset{}\t%al", cond)
    }

    pub fn call_label(&mut self, name: &str) -> io::Result<()> {
        writeln!(self.out, "\tcall\t{}", name)
    }

    pub fn call_reg(&mut self, reg: Reg) -> io::Result<()> {
        writeln!(self.out, "\tcall\t*{}", reg)
    }

    /// Indirect call through a vtable slot: `call *<voff>+<header>(%reg)`.
    pub fn call_vtable(&mut self, voff: &str, header_bytes: usize, reg: Reg) -> io::Result<()> {
        writeln!(self.out, "\tcall\t*{}+{}({})", voff, header_bytes, reg)
    }

    /// Push an element of a length-prefixed chunk: `pushl (%base,%index,4)`.
    pub fn push_indexed(&mut self, base: Reg, index: Reg) -> io::Result<()> {
        self.op1("pushl", &Opnd::MemIndex(base, index, 4))
    }

    // ------------------------------------------------------------------
    // Function framing
    // ------------------------------------------------------------------

    pub fn func_begin(&mut self, name: &str, exported: bool) -> io::Result<()> {
        self.text()?;
        if exported {
            self.export(name)?;
        }
        self.label(name)?;
        self.push(Opnd::Reg(Reg::Ebp))?;
        self.mov(Opnd::Reg(Reg::Esp), Opnd::Reg(Reg::Ebp))
    }

    pub fn func_end(&mut self) -> io::Result<()> {
        self.op0("leave")?;
        self.op0("ret")
    }

    pub fn sub_esp(&mut self, bytes: usize) -> io::Result<()> {
        if bytes > 0 {
            self.sub(Opnd::Imm(bytes as i64), Opnd::Reg(Reg::Esp))?;
        }
        Ok(())
    }

    pub fn add_esp(&mut self, bytes: usize) -> io::Result<()> {
        if bytes > 0 {
            self.add(Opnd::Imm(bytes as i64), Opnd::Reg(Reg::Esp))?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Register cache
    // ------------------------------------------------------------------

    /// Cache a variable in a register, loading it from `home` on a read.
    ///
    /// Returns `None` when no register can be claimed; the caller then
    /// works against the home slot directly. A `write` request marks the
    /// entry dirty and spills any other dirty entry first.
    pub fn cache_var(&mut self, name: &str, home: Opnd, write: bool) -> io::Result<Option<Reg>> {
        if let Some(i) = self
            .cache
            .entries
            .iter()
            .position(|e| e.as_ref().is_some_and(|e| e.var == name))
        {
            if write {
                self.spill_dirty_except(Some(i))?;
                if let Some(e) = self.cache.entries[i].as_mut() {
                    e.dirty = true;
                }
            }
            return Ok(Some(CACHE_REGS[i]));
        }

        let Some(i) = self.free_cache_slot()? else {
            return Ok(None);
        };
        let reg = CACHE_REGS[i];
        if write {
            self.spill_dirty_except(Some(i))?;
        } else {
            self.mov(home.clone(), Opnd::Reg(reg))?;
        }
        self.cache.entries[i] = Some(CacheEntry {
            var: name.to_string(),
            home,
            dirty: write,
        });
        Ok(Some(reg))
    }

    /// True if `name` currently lives in a cache register.
    pub fn cached_reg(&self, name: &str) -> Option<Reg> {
        self.cache
            .entries
            .iter()
            .position(|e| e.as_ref().is_some_and(|e| e.var == name))
            .map(|i| CACHE_REGS[i])
    }

    fn free_cache_slot(&mut self) -> io::Result<Option<usize>> {
        if let Some(i) = (0..CACHE_REGS.len())
            .find(|&i| self.cache.entries[i].is_none() && !self.cache.claimed[i])
        {
            return Ok(Some(i));
        }
        // Prefer evicting a clean entry; spill a dirty one if we must.
        let candidate = (0..CACHE_REGS.len())
            .filter(|&i| !self.cache.claimed[i])
            .min_by_key(|&i| self.cache.entries[i].as_ref().map_or(0, |e| e.dirty as u8));
        match candidate {
            Some(i) => {
                self.evict_slot(i)?;
                Ok(Some(i))
            }
            None => Ok(None),
        }
    }

    fn evict_slot(&mut self, i: usize) -> io::Result<()> {
        if let Some(entry) = self.cache.entries[i].take() {
            if entry.dirty {
                self.mov(Opnd::Reg(CACHE_REGS[i]), entry.home)?;
            }
        }
        Ok(())
    }

    fn spill_dirty_except(&mut self, keep: Option<usize>) -> io::Result<()> {
        for i in 0..CACHE_REGS.len() {
            if Some(i) == keep {
                continue;
            }
            let needs_spill = self.cache.entries[i].as_ref().is_some_and(|e| e.dirty);
            if needs_spill {
                let entry = self.cache.entries[i].as_mut().unwrap();
                entry.dirty = false;
                let home = entry.home.clone();
                self.mov(Opnd::Reg(CACHE_REGS[i]), home)?;
            }
        }
        Ok(())
    }

    /// Spill every dirty entry and forget all cached variables.
    pub fn evict_all(&mut self) -> io::Result<()> {
        for i in 0..CACHE_REGS.len() {
            self.evict_slot(i)?;
        }
        Ok(())
    }

    /// Drop (spilling if dirty) any entry caching `name`.
    pub fn evict_regs_for(&mut self, name: &str) -> io::Result<()> {
        for i in 0..CACHE_REGS.len() {
            let matches = self.cache.entries[i]
                .as_ref()
                .is_some_and(|e| e.var == name);
            if matches {
                self.evict_slot(i)?;
            }
        }
        Ok(())
    }

    /// Claim any cache register as a scratch, evicting its tenant.
    pub fn claim_scratch(&mut self) -> io::Result<Reg> {
        let i = (0..CACHE_REGS.len())
            .find(|&i| !self.cache.claimed[i] && self.cache.entries[i].is_none())
            .or_else(|| (0..CACHE_REGS.len()).find(|&i| !self.cache.claimed[i]))
            .expect("all scratch registers claimed");
        self.evict_slot(i)?;
        self.cache.claimed[i] = true;
        Ok(CACHE_REGS[i])
    }

    /// Claim one specific register (e.g. `%ecx`/`%edx` around `idivl`).
    pub fn claim_reg(&mut self, reg: Reg) -> io::Result<()> {
        let i = cache_index(reg).expect("not a cacheable register");
        assert!(!self.cache.claimed[i], "register claimed twice");
        self.evict_slot(i)?;
        self.cache.claimed[i] = true;
        Ok(())
    }

    pub fn release_reg(&mut self, reg: Reg) {
        if let Some(i) = cache_index(reg) {
            self.cache.claimed[i] = false;
        }
    }
}
