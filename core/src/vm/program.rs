//! Compiled program representation: instruction words, constant table,
//! function table, global declarations.
//!
//! A `Program` is immutable once built and may be shared across VM instances
//! on different threads (`Arc<Program>`). Constants are descriptors, not
//! runtime values; each instance materializes them into its own heap on
//! first `LOAD`. The [`ProgramBuilder`] is the emission interface the
//! compiler (out of tree) and the test suite use.

use anyhow::{Result, bail, ensure};
use serde::{Deserialize, Serialize};

use crate::util::fast_map::{FastHashMap, fast_hash_map_new};
use super::fault::Fault;
use super::opcode::{EncForm, Opcode};
use super::word;

/// Fixed frame-slot layout. Slots 0-3 are reserved; parameters and locals
/// start at [`FIRST_ARG`].
pub const SLOT_FUNC: usize = 0;
pub const SLOT_RET: usize = 1;
pub const SLOT_PC: usize = 2;
pub const SLOT_BASE: usize = 3;
pub const FIRST_ARG: usize = 4;

/// Smallest legal frame: the four reserved slots.
pub const MIN_STACK_SIZE: u16 = FIRST_ARG as u16;

/// Constant descriptor. Deduplicated by content; addressed by 16-bit index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Const {
    Nil,
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    /// Index into the program's function table.
    Func(u16),
    /// Name of a registered native function.
    Native(String),
}

/// Content key for dedup; floats compare by bit pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstKey {
    Nil,
    Int(i64),
    Bits(u64),
    Bool(bool),
    Str(String),
    Func(u16),
    Native(String),
}

impl Const {
    fn key(&self) -> ConstKey {
        match self {
            Const::Nil => ConstKey::Nil,
            Const::Int(i) => ConstKey::Int(*i),
            Const::Float(f) => ConstKey::Bits(f.to_bits()),
            Const::Bool(b) => ConstKey::Bool(*b),
            Const::Str(s) => ConstKey::Str(s.clone()),
            Const::Func(p) => ConstKey::Func(*p),
            Const::Native(n) => ConstKey::Native(n.clone()),
        }
    }
}

/// One catch region of a function: pc range `[start, end)`, jump target, and
/// the register the thrown value is bound to. Regions are consulted
/// innermost-first during unwinding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CatchRegion {
    pub start: u32,
    pub end: u32,
    pub target: u32,
    pub reg: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuncProto {
    pub name: String,
    /// Absolute address of the first instruction.
    pub entry: u32,
    /// Frame size in register slots, reserved slots included.
    pub stack_size: u16,
    pub nparams: u8,
    #[serde(default)]
    pub catches: Vec<CatchRegion>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Program {
    pub code: Vec<u32>,
    pub consts: Vec<Const>,
    pub protos: Vec<FuncProto>,
    pub entry_proto: u16,
    pub global_names: Vec<String>,
}

impl Program {
    pub fn globals_len(&self) -> usize {
        self.global_names.len()
    }

    #[inline]
    pub fn proto(&self, index: u16) -> Result<&FuncProto, Fault> {
        self.protos.get(index as usize).ok_or(Fault::BadProto { index })
    }

    #[inline]
    pub fn konst(&self, index: u16) -> Result<&Const, Fault> {
        self.consts.get(index as usize).ok_or(Fault::BadConst { index })
    }

    /// Structural checks applied after deserialization, before execution.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.protos.is_empty(), "program has no functions");
        ensure!(
            (self.entry_proto as usize) < self.protos.len(),
            "entry function {} out of range",
            self.entry_proto
        );
        for (i, p) in self.protos.iter().enumerate() {
            ensure!(
                p.stack_size >= MIN_STACK_SIZE,
                "function '{}' frame smaller than the reserved slots",
                p.name
            );
            ensure!(
                (p.entry as usize) <= self.code.len(),
                "function '{}' entry {} outside code",
                p.name,
                p.entry
            );
            ensure!(
                (FIRST_ARG + p.nparams as usize) <= p.stack_size as usize,
                "function '{}' declares more parameters than frame slots",
                p.name
            );
            for c in &p.catches {
                ensure!(
                    c.start <= c.end && (c.end as usize) <= self.code.len() && (c.target as usize) < self.code.len(),
                    "function '{}' (index {}) has a catch region outside code",
                    p.name,
                    i
                );
                ensure!(
                    (c.reg as u16) < p.stack_size,
                    "function '{}' catch binds register outside its frame",
                    p.name
                );
            }
        }
        for c in &self.consts {
            if let Const::Func(p) = c {
                ensure!(
                    (*p as usize) < self.protos.len(),
                    "function constant {} out of range",
                    p
                );
            }
        }
        Ok(())
    }

    /// Textual listing, one word per line.
    pub fn disassemble(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::new();
        for (pc, &w) in self.code.iter().enumerate() {
            for proto in &self.protos {
                if proto.entry as usize == pc {
                    let _ = writeln!(out, "{}: ; stack_size={} nparams={}", proto.name, proto.stack_size, proto.nparams);
                }
            }
            let line = match Opcode::from_u8(word::op_of(w)) {
                None => format!(".word {w:#010x}"),
                Some(op) => match op.form() {
                    EncForm::I0 => op.mnemonic().to_string(),
                    EncForm::I1 => format!("{} {}", op.mnemonic(), word::pe(w)),
                    EncForm::I1Reg => format!("{} r{}", op.mnemonic(), word::pa(w)),
                    EncForm::I2 => format!("{} r{}, {}", op.mnemonic(), word::pa(w), word::pd(w)),
                    EncForm::I3 => format!(
                        "{} r{}, r{}, r{}",
                        op.mnemonic(),
                        word::pa(w),
                        word::pb(w),
                        word::pc(w)
                    ),
                },
            };
            let _ = writeln!(out, "{pc:6}  {line}");
        }
        out
    }
}

/// Incremental program assembly. Constants and globals deduplicate; code is
/// append-only with patchable words for forward jumps.
pub struct ProgramBuilder {
    code: Vec<u32>,
    consts: Vec<Const>,
    const_index: FastHashMap<ConstKey, u16>,
    protos: Vec<FuncProto>,
    globals: FastHashMap<String, u16>,
    global_names: Vec<String>,
    entry_proto: u16,
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self {
            code: Vec::new(),
            consts: Vec::new(),
            const_index: fast_hash_map_new(),
            protos: Vec::new(),
            globals: fast_hash_map_new(),
            global_names: Vec::new(),
            entry_proto: 0,
        }
    }

    #[inline]
    pub fn pc(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn emit(&mut self, w: u32) -> u32 {
        let at = self.pc();
        self.code.push(w);
        at
    }

    pub fn op0(&mut self, op: Opcode) -> u32 {
        self.emit(word::enc0(op))
    }

    pub fn op_a(&mut self, op: Opcode, a: u8) -> u32 {
        self.emit(word::enc_a(op, a))
    }

    pub fn op_ad(&mut self, op: Opcode, a: u8, d: u16) -> u32 {
        self.emit(word::enc_ad(op, a, d))
    }

    pub fn op_abc(&mut self, op: Opcode, a: u8, b: u8, c: u8) -> u32 {
        self.emit(word::enc_abc(op, a, b, c))
    }

    pub fn op_e(&mut self, op: Opcode, e: u32) -> u32 {
        self.emit(word::enc_e(op, e))
    }

    pub fn patch(&mut self, at: u32, w: u32) {
        self.code[at as usize] = w;
    }

    /// Intern a constant; identical content returns the same 16-bit index.
    pub fn konst(&mut self, c: Const) -> Result<u16> {
        let key = c.key();
        if let Some(&idx) = self.const_index.get(&key) {
            return Ok(idx);
        }
        ensure!(self.consts.len() < u16::MAX as usize + 1, "constant table full");
        let idx = self.consts.len() as u16;
        self.consts.push(c);
        self.const_index.insert(key, idx);
        Ok(idx)
    }

    /// Declare (or look up) a global slot by name.
    pub fn global(&mut self, name: &str) -> Result<u16> {
        if let Some(&idx) = self.globals.get(name) {
            return Ok(idx);
        }
        ensure!(self.global_names.len() < u16::MAX as usize + 1, "global table full");
        let idx = self.global_names.len() as u16;
        self.global_names.push(name.to_string());
        self.globals.insert(name.to_string(), idx);
        Ok(idx)
    }

    /// Open a function whose entry is the current pc.
    pub fn begin_func(&mut self, name: &str, stack_size: u16, nparams: u8) -> Result<u16> {
        ensure!(stack_size >= MIN_STACK_SIZE, "frame must include the reserved slots");
        ensure!(self.protos.len() < u16::MAX as usize + 1, "function table full");
        let idx = self.protos.len() as u16;
        self.protos.push(FuncProto {
            name: name.to_string(),
            entry: self.pc(),
            stack_size,
            nparams,
            catches: Vec::new(),
        });
        Ok(idx)
    }

    pub fn add_catch(&mut self, proto: u16, region: CatchRegion) -> Result<()> {
        match self.protos.get_mut(proto as usize) {
            Some(p) => {
                p.catches.push(region);
                Ok(())
            }
            None => bail!("no function at index {proto}"),
        }
    }

    pub fn set_entry(&mut self, proto: u16) {
        self.entry_proto = proto;
    }

    pub fn finish(self) -> Result<Program> {
        let program = Program {
            code: self.code,
            consts: self.consts,
            protos: self.protos,
            entry_proto: self.entry_proto,
            global_names: self.global_names,
        };
        program.validate()?;
        Ok(program)
    }
}
