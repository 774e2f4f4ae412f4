//! Bytecode modules: instructions, constant pools, import tables and the
//! prototype tree.
//!
//! A `Prototype` is read-only once built. Nested prototypes are shared via
//! `Arc` so closures can hold on to their code after the module that
//! declared them has been superseded.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A single bytecode instruction.
///
/// Jump displacements are relative to the position of the jump itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    // === Stack ===
    Nop,
    /// Breakpoint: reported to observers, otherwise a no-op.
    Brk,
    /// Discard n values.
    Pop(u32),
    /// Push constants[idx].
    Ldk(u32),
    Nil,
    Ldb(bool),
    /// Push a small integer immediate.
    Lsi(i32),

    // === Locals ===
    /// Push local idx (arguments, then upvalues, then local vars).
    Llv(u32),
    /// Pop the top into local idx.
    Slv(u32),

    // === Linkage ===
    /// Push the resolved value of imports[idx].
    Imp(u32),
    /// Instantiate nesteds[idx], capturing its upvalues from the stack top.
    Cls(u32),

    // === Control flow ===
    Jmp(i32),
    /// Pop a value; jump if it is falsy.
    Jin(i32),
    /// Call the callable sitting below nargs arguments.
    Ivk(u32),
    Ret,

    // === Messaging ===
    /// Pop [destination, message] and deliver the message.
    Snd,
    /// Selective receive with the timeout on the stack top; jump on timeout.
    Rcv(i32),
    /// Remove the message bound by the last receive.
    Rmv,
    /// Reset the receive cursor to the mailbox head.
    Rwd,
}

impl Instruction {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Instruction::Nop => "nop",
            Instruction::Brk => "brk",
            Instruction::Pop(_) => "pop",
            Instruction::Ldk(_) => "ldk",
            Instruction::Nil => "nil",
            Instruction::Ldb(_) => "ldb",
            Instruction::Lsi(_) => "lsi",
            Instruction::Llv(_) => "llv",
            Instruction::Slv(_) => "slv",
            Instruction::Imp(_) => "imp",
            Instruction::Cls(_) => "cls",
            Instruction::Jmp(_) => "jmp",
            Instruction::Jin(_) => "jin",
            Instruction::Ivk(_) => "ivk",
            Instruction::Ret => "ret",
            Instruction::Snd => "snd",
            Instruction::Rcv(_) => "rcv",
            Instruction::Rmv => "rmv",
            Instruction::Rwd => "rwd",
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.mnemonic();
        match self {
            Instruction::Pop(n) => write!(f, "{m} {n}"),
            Instruction::Ldk(i)
            | Instruction::Llv(i)
            | Instruction::Slv(i)
            | Instruction::Imp(i)
            | Instruction::Cls(i)
            | Instruction::Ivk(i) => write!(f, "{m} {i}"),
            Instruction::Ldb(b) => write!(f, "{m} {b}"),
            Instruction::Lsi(v) | Instruction::Jmp(v) | Instruction::Jin(v) | Instruction::Rcv(v) => {
                write!(f, "{m} {v}")
            }
            _ => f.write_str(m),
        }
    }
}

/// Constant pool entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Integer(i64),
    Real(f64),
    String(String),
}

/// Import table entry: a symbol exported by another module or library.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Import {
    pub module: String,
    pub name: String,
}

impl Import {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }
}

/// A resolved function or module body.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Prototype {
    /// Exported name; root prototypes use it as the module name.
    pub symbol: Option<String>,
    pub source: Option<String>,
    pub num_upvalues: u8,
    pub num_arguments: u8,
    pub num_local_vars: u8,
    pub instructions: Vec<Instruction>,
    pub constants: Vec<Constant>,
    pub imports: Vec<Import>,
    pub nesteds: Vec<Arc<Prototype>>,
}

impl Prototype {
    /// Number of locals addressable by `LLV`/`SLV`.
    pub fn frame_size(&self) -> usize {
        self.num_arguments as usize + self.num_upvalues as usize + self.num_local_vars as usize
    }

    /// Nested prototype exported as `name`, searched depth-first.
    pub fn find_nested(self: &Arc<Self>, name: &str) -> Option<Arc<Prototype>> {
        self.nesteds.iter().find_map(|p| {
            if p.symbol.as_deref() == Some(name) {
                Some(Arc::clone(p))
            } else {
                p.find_nested(name)
            }
        })
    }

    /// Visit this prototype and all nested ones.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Prototype)) {
        f(self);
        for nested in &self.nesteds {
            nested.walk(f);
        }
    }

    /// True if `other` is this prototype or one nested inside it.
    pub fn contains(&self, other: &Prototype) -> bool {
        std::ptr::eq(self, other) || self.nesteds.iter().any(|p| p.contains(other))
    }
}

/// Loader-assigned identity of a module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(pub u64);

/// A module registered with the loader.
#[derive(Debug)]
pub struct Chunk {
    pub id: ChunkId,
    pub module: Arc<Prototype>,
}

impl Chunk {
    /// Module name, taken from the root prototype's symbol.
    pub fn name(&self) -> &str {
        self.module.symbol.as_deref().unwrap_or("")
    }
}
