//! Runtime values for the strand VM.
//!
//! A `Value` is a small `Copy` tagged union. Scalars live inline; heap
//! objects are reached through a `HeapRef`, which carries the object kind
//! and a generation-checked handle into the owning process's heap. Values
//! never hold raw addresses, so heap objects can be relocated by copy
//! without touching the stack.

use std::fmt;

use crate::gc::Handle;

/// Process identifier, unique within one scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub u64);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.0)
    }
}

/// Identifier of a scheduler. A process keeps the id of its owner for its
/// whole lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SchedulerId(pub u64);

/// Index of a native function in the loader's native table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NativeId(pub u32);

/// Kind tag of a heap object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Raw, fixed-size byte region.
    FixedBuffer,
    /// Growable buffer: size, capacity and a backing `FixedBuffer`.
    Buffer,
    /// Prototype plus captured upvalues.
    Closure,
    /// Immutable UTF-8 string.
    String,
}

impl ObjectKind {
    pub fn name(self) -> &'static str {
        match self {
            ObjectKind::FixedBuffer => "fixed-buffer",
            ObjectKind::Buffer => "buffer",
            ObjectKind::Closure => "closure",
            ObjectKind::String => "string",
        }
    }
}

/// A typed reference to a heap object.
///
/// The kind must match the kind stored in the slot the handle points at;
/// the heap checks both the kind and the slot generation on every access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HeapRef {
    pub kind: ObjectKind,
    pub handle: Handle,
}

impl HeapRef {
    pub fn new(kind: ObjectKind, handle: Handle) -> Self {
        Self { kind, handle }
    }
}

/// A runtime value.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Real(f64),
    Pid(Pid),
    Native(NativeId),
    Heap(HeapRef),
}

impl Value {
    /// Name of the value's tag, used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "integer",
            Value::Real(_) => "real",
            Value::Pid(_) => "pid",
            Value::Native(_) => "native",
            Value::Heap(r) => r.kind.name(),
        }
    }

    /// `nil` and `false` are falsy, everything else is truthy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    /// Heap reference carried by this value, if any.
    pub fn heap_ref(&self) -> Option<HeapRef> {
        match self {
            Value::Heap(r) => Some(*r),
            _ => None,
        }
    }

    /// True if the value does not reference the heap.
    pub fn is_immediate(&self) -> bool {
        !matches!(self, Value::Heap(_))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(r: f64) -> Self {
        Value::Real(r)
    }
}

impl From<Pid> for Value {
    fn from(pid: Pid) -> Self {
        Value::Pid(pid)
    }
}
