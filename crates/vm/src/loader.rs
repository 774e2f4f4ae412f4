//! Module loader and native library registry.
//!
//! Modules move through three sets: `pending` (added, not yet linked),
//! `running` (linked, visible to imports) and `garbage` (superseded by a
//! newer module of the same name). Garbage modules stay readable until no
//! process holds any of their prototypes.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::RuntimeError;
use crate::module::{Chunk, ChunkId, Import, Prototype};
use crate::process::Process;
use crate::value::{NativeId, Value};

/// Signature of a native function.
pub type NativeFn = fn(&mut Process, &[Value]) -> Result<Value, RuntimeError>;

#[derive(Clone, Copy, Debug)]
pub enum NativeKind {
    Function(NativeFn),
    /// Protected call: the interpreter invokes the first argument and turns
    /// any error it raises into a `(false, description)` result.
    ProtectedCall,
}

#[derive(Clone, Debug)]
pub struct NativeFunction {
    pub library: String,
    pub name: String,
    /// `None` for variadic natives.
    pub arity: Option<usize>,
    pub kind: NativeKind,
}

/// A named set of natives. Entry names carry an optional `/N` arity suffix.
#[derive(Clone, Debug)]
pub struct Library {
    pub name: String,
    pub functions: Vec<(String, NativeKind)>,
}

impl Library {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
        }
    }

    pub fn function(mut self, name: &str, f: NativeFn) -> Self {
        self.functions.push((name.to_string(), NativeKind::Function(f)));
        self
    }

    pub fn protected_call(mut self, name: &str) -> Self {
        self.functions.push((name.to_string(), NativeKind::ProtectedCall));
        self
    }
}

/// What an import resolves to.
#[derive(Clone, Debug)]
pub enum Symbol {
    Native(NativeId),
    Function(Arc<Prototype>),
}

/// Result of a successful `link`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkReport {
    pub linked: Vec<ChunkId>,
    pub superseded: Vec<ChunkId>,
}

type LinkHook = Box<dyn Fn(&LinkReport) + Send + Sync>;

#[derive(Default)]
pub struct Loader {
    natives: Vec<NativeFunction>,
    libraries: HashMap<String, HashMap<String, NativeId>>,
    pending: Vec<Arc<Chunk>>,
    running: Vec<Arc<Chunk>>,
    garbages: Vec<Arc<Chunk>>,
    next_chunk: u64,
    link_hooks: Vec<LinkHook>,
}

fn parse_native_name(entry: &str) -> Result<(&str, Option<usize>), RuntimeError> {
    match entry.rsplit_once('/') {
        None => Ok((entry, None)),
        Some((name, arity)) => {
            let arity = arity
                .parse()
                .map_err(|_| RuntimeError::runtime(format!("bad native arity in `{entry}`")))?;
            Ok((name, Some(arity)))
        }
    }
}

impl Loader {
    pub fn new() -> Self {
        Self::default()
    }

    /// A loader with the standard libraries registered.
    pub fn with_std() -> Result<Self, RuntimeError> {
        let mut loader = Self::new();
        for library in crate::stdlib::libraries() {
            loader.add_library(library)?;
        }
        Ok(loader)
    }

    pub fn add_library(&mut self, library: Library) -> Result<(), RuntimeError> {
        if self.libraries.contains_key(&library.name) {
            return Err(RuntimeError::runtime(format!(
                "library `{}` already registered",
                library.name
            )));
        }
        let mut table = HashMap::new();
        for (entry, kind) in &library.functions {
            let (name, arity) = parse_native_name(entry)?;
            let id = NativeId(self.natives.len() as u32);
            self.natives.push(NativeFunction {
                library: library.name.clone(),
                name: name.to_string(),
                arity,
                kind: *kind,
            });
            table.insert(name.to_string(), id);
        }
        debug!(library = %library.name, natives = table.len(), "library registered");
        self.libraries.insert(library.name, table);
        Ok(())
    }

    pub fn native(&self, id: NativeId) -> Option<&NativeFunction> {
        self.natives.get(id.0 as usize)
    }

    /// Queue a module for the next `link`. The root prototype's symbol is
    /// the module name.
    pub fn add_chunk(&mut self, module: Prototype) -> Result<ChunkId, RuntimeError> {
        if module.symbol.is_none() {
            return Err(RuntimeError::runtime("module has no name"));
        }
        let id = ChunkId(self.next_chunk);
        self.next_chunk += 1;
        self.pending.push(Arc::new(Chunk {
            id,
            module: Arc::new(module),
        }));
        Ok(id)
    }

    /// Register a hook called after every successful link.
    pub fn on_linked(&mut self, hook: impl Fn(&LinkReport) + Send + Sync + 'static) {
        self.link_hooks.push(Box::new(hook));
    }

    /// Resolve every pending import and promote pending modules to running.
    ///
    /// On failure nothing moves: pending modules stay pending.
    pub fn link(&mut self) -> Result<LinkReport, RuntimeError> {
        for chunk in &self.pending {
            let mut unresolved = None;
            chunk.module.walk(&mut |p| {
                if unresolved.is_none() {
                    unresolved = p.imports.iter().find(|i| !self.is_resolvable(i)).cloned();
                }
            });
            if let Some(import) = unresolved {
                return Err(RuntimeError::UnresolvedImport {
                    module: import.module,
                    name: import.name,
                });
            }
        }

        let mut report = LinkReport::default();
        for chunk in std::mem::take(&mut self.pending) {
            if let Some(pos) = self.running.iter().position(|c| c.name() == chunk.name()) {
                let old = self.running.remove(pos);
                info!(module = %old.name(), chunk = old.id.0, "module superseded");
                report.superseded.push(old.id);
                self.garbages.push(old);
            }
            report.linked.push(chunk.id);
            self.running.push(chunk);
        }

        debug!(linked = report.linked.len(), "link complete");
        for hook in &self.link_hooks {
            hook(&report);
        }
        Ok(report)
    }

    fn is_resolvable(&self, import: &Import) -> bool {
        if let Some(table) = self.libraries.get(&import.module) {
            return table.contains_key(&import.name);
        }
        self.running
            .iter()
            .chain(self.pending.iter())
            .filter(|c| c.name() == import.module)
            .any(|c| c.module.find_nested(&import.name).is_some())
    }

    /// Look up `name` exported by `module`.
    pub fn resolve(&self, module: &str, name: &str) -> Result<Symbol, RuntimeError> {
        let unresolved = || RuntimeError::UnresolvedImport {
            module: module.to_string(),
            name: name.to_string(),
        };
        if let Some(table) = self.libraries.get(module) {
            return table.get(name).map(|id| Symbol::Native(*id)).ok_or_else(unresolved);
        }
        self.running
            .iter()
            .rev()
            .find(|c| c.name() == module)
            .and_then(|c| c.module.find_nested(name))
            .map(Symbol::Function)
            .ok_or_else(unresolved)
    }

    pub fn pending(&self) -> &[Arc<Chunk>] {
        &self.pending
    }

    pub fn running(&self) -> &[Arc<Chunk>] {
        &self.running
    }

    pub fn garbages(&self) -> &[Arc<Chunk>] {
        &self.garbages
    }

    /// Drop garbage modules no process references any more.
    /// Returns the number reclaimed.
    pub fn collect_garbage(&mut self) -> usize {
        let before = self.garbages.len();
        self.garbages.retain(|chunk| {
            let keep = in_use(&chunk.module);
            if !keep {
                info!(module = %chunk.name(), chunk = chunk.id.0, "garbage module reclaimed");
            }
            keep
        });
        before - self.garbages.len()
    }
}

/// True if any prototype in the tree is shared beyond its parent.
fn in_use(prototype: &Arc<Prototype>) -> bool {
    Arc::strong_count(prototype) > 1 || prototype.nesteds.iter().any(in_use)
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("natives", &self.natives.len())
            .field("pending", &self.pending.len())
            .field("running", &self.running.len())
            .field("garbages", &self.garbages.len())
            .finish()
    }
}
