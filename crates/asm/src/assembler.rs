//! Prototype tree builder.
//!
//! The assembler keeps a cursor into the prototype tree. `push` creates a
//! nested prototype under the current one and moves into it, `pop` moves
//! back to the parent, `open` moves into an existing nested prototype.
//! Everything else (`emit`, `add_constant`, `add_import`, setters) edits
//! the prototype under the cursor.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strand_vm::{Constant, Import, Instruction, Prototype};
use thiserror::Error;

use crate::string_table::{StringRef, StringTable};

/// Deepest nesting the cursor may reach below the root.
pub const MAX_NESTED_LEVEL: usize = 8;

#[derive(Error, Debug)]
pub enum AsmError {
    #[error("nesting deeper than {max} levels")]
    NestingTooDeep { max: usize },

    #[error("cannot pop the root prototype")]
    AtRoot,

    #[error("no nested prototype {0}")]
    NoSuchPrototype(usize),

    #[error("dangling string reference {0}")]
    BadStringRef(u32),

    #[error("not a strand chunk")]
    BadMagic,

    #[error("unsupported chunk version {0}")]
    UnsupportedVersion(u16),

    #[error("chunk codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Constant as stored by the assembler; strings are interned.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum AsmConstant {
    Integer(i64),
    String(StringRef),
    Real(f64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsmImport {
    pub module: StringRef,
    pub name: StringRef,
}

/// Editable prototype; strings are refs into the assembler's table.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AsmPrototype {
    pub source: StringRef,
    pub symbol: StringRef,
    pub num_upvalues: u8,
    pub num_arguments: u8,
    pub num_local_vars: u8,
    pub instructions: Vec<Instruction>,
    pub constants: Vec<AsmConstant>,
    pub imports: Vec<AsmImport>,
    pub nesteds: Vec<AsmPrototype>,
}

#[derive(Clone, Debug, Default)]
pub struct Assembler {
    pub(crate) strings: StringTable,
    pub(crate) root: AsmPrototype,
    /// Nested indices from the root to the current prototype.
    cursor: Vec<usize>,
}

impl Assembler {
    /// An empty module with the cursor on its root prototype.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_parts(strings: StringTable, root: AsmPrototype) -> Self {
        Self {
            strings,
            root,
            cursor: Vec::new(),
        }
    }

    pub fn strings(&self) -> &StringTable {
        &self.strings
    }

    /// Nesting depth of the cursor; `0` is the root.
    pub fn depth(&self) -> usize {
        self.cursor.len()
    }

    /// The prototype under the cursor.
    pub fn prototype(&self) -> &AsmPrototype {
        let mut p = &self.root;
        for &i in &self.cursor {
            p = &p.nesteds[i];
        }
        p
    }

    fn prototype_mut(&mut self) -> &mut AsmPrototype {
        let mut p = &mut self.root;
        for &i in &self.cursor {
            p = &mut p.nesteds[i];
        }
        p
    }

    /// Create a nested prototype and move into it. Returns its index in
    /// the parent.
    pub fn push(&mut self) -> Result<usize, AsmError> {
        if self.cursor.len() >= MAX_NESTED_LEVEL {
            return Err(AsmError::NestingTooDeep {
                max: MAX_NESTED_LEVEL,
            });
        }
        let parent = self.prototype_mut();
        parent.nesteds.push(AsmPrototype::default());
        let idx = parent.nesteds.len() - 1;
        self.cursor.push(idx);
        Ok(idx)
    }

    /// `push` followed by naming the new prototype.
    pub fn module_push(&mut self, symbol: &str) -> Result<usize, AsmError> {
        let idx = self.push()?;
        self.set_symbol(symbol);
        Ok(idx)
    }

    /// Move back to the parent. Returns the index of the prototype left.
    pub fn pop(&mut self) -> Result<usize, AsmError> {
        self.cursor.pop().ok_or(AsmError::AtRoot)
    }

    /// Move into an existing nested prototype.
    pub fn open(&mut self, idx: usize) -> Result<(), AsmError> {
        if self.cursor.len() >= MAX_NESTED_LEVEL {
            return Err(AsmError::NestingTooDeep {
                max: MAX_NESTED_LEVEL,
            });
        }
        if idx >= self.prototype().nesteds.len() {
            return Err(AsmError::NoSuchPrototype(idx));
        }
        self.cursor.push(idx);
        Ok(())
    }

    /// Append an instruction. Returns its index.
    pub fn emit(&mut self, instruction: Instruction) -> usize {
        let p = self.prototype_mut();
        p.instructions.push(instruction);
        p.instructions.len() - 1
    }

    pub fn add_constant(&mut self, constant: AsmConstant) -> usize {
        let p = self.prototype_mut();
        p.constants.push(constant);
        p.constants.len() - 1
    }

    pub fn add_import(&mut self, module: &str, name: &str) -> usize {
        let import = AsmImport {
            module: self.strings.intern(module),
            name: self.strings.intern(name),
        };
        let p = self.prototype_mut();
        p.imports.push(import);
        p.imports.len() - 1
    }

    pub fn string_to_ref(&mut self, s: &str) -> StringRef {
        self.strings.intern(s)
    }

    pub fn set_symbol(&mut self, symbol: &str) {
        let r = self.strings.intern(symbol);
        self.prototype_mut().symbol = r;
    }

    pub fn set_source(&mut self, source: &str) {
        let r = self.strings.intern(source);
        self.prototype_mut().source = r;
    }

    pub fn set_num_upvalues(&mut self, n: u8) {
        self.prototype_mut().num_upvalues = n;
    }

    pub fn set_num_arguments(&mut self, n: u8) {
        self.prototype_mut().num_arguments = n;
    }

    pub fn set_num_local_vars(&mut self, n: u8) {
        self.prototype_mut().num_local_vars = n;
    }

    /// Read-only prototype tree rooted at the cursor.
    pub fn resolve(&self) -> Result<Prototype, AsmError> {
        self.resolve_prototype(self.prototype())
    }

    /// Read-only prototype tree of the whole module.
    pub fn resolve_module(&self) -> Result<Prototype, AsmError> {
        self.resolve_prototype(&self.root)
    }

    fn string(&self, r: StringRef) -> Result<&str, AsmError> {
        self.strings.get(r).ok_or(AsmError::BadStringRef(r.0))
    }

    fn optional_string(&self, r: StringRef) -> Result<Option<String>, AsmError> {
        if r.is_empty() {
            return Ok(None);
        }
        self.string(r).map(|s| Some(s.to_string()))
    }

    fn resolve_prototype(&self, p: &AsmPrototype) -> Result<Prototype, AsmError> {
        let constants = p
            .constants
            .iter()
            .map(|c| {
                Ok(match *c {
                    AsmConstant::Integer(i) => Constant::Integer(i),
                    AsmConstant::Real(r) => Constant::Real(r),
                    AsmConstant::String(r) => Constant::String(self.string(r)?.to_string()),
                })
            })
            .collect::<Result<Vec<_>, AsmError>>()?;
        let imports = p
            .imports
            .iter()
            .map(|i| Ok(Import::new(self.string(i.module)?, self.string(i.name)?)))
            .collect::<Result<Vec<_>, AsmError>>()?;
        let nesteds = p
            .nesteds
            .iter()
            .map(|n| self.resolve_prototype(n).map(Arc::new))
            .collect::<Result<Vec<_>, AsmError>>()?;

        Ok(Prototype {
            symbol: self.optional_string(p.symbol)?,
            source: self.optional_string(p.source)?,
            num_upvalues: p.num_upvalues,
            num_arguments: p.num_arguments,
            num_local_vars: p.num_local_vars,
            instructions: p.instructions.clone(),
            constants,
            imports,
            nesteds,
        })
    }
}
