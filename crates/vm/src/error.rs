//! Runtime errors.
//!
//! Every interpreter fault is a `RuntimeError`. Errors raised while a
//! process runs unwind its call frames until a protected frame (`pcall`)
//! catches them; uncaught errors terminate only the faulting process.

use thiserror::Error;

/// Coarse classification of runtime errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Heap or stack growth failed.
    OutOfMemory,
    /// Bad index, underflow, type mismatch, bad argument and friends.
    Runtime,
    /// Reserved for collaborators outside the core.
    IoFailure,
}

/// Runtime errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("stack overflow (limit {limit})")]
    StackOverflow { limit: usize },

    #[error("stack underflow: cannot pop {requested} of {size}")]
    StackUnderflow { requested: usize, size: usize },

    #[error("bad index {0}")]
    BadIndex(i64),

    #[error("type mismatch: expected {expected}, got {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("arity mismatch: expected {expected}, got {found}")]
    ArityMismatch { expected: usize, found: usize },

    #[error("value of type {0} is not callable")]
    NotCallable(&'static str),

    #[error("bad {what} index {index}")]
    BadOperand { what: &'static str, index: usize },

    #[error("jump target {target} out of range")]
    BadJump { target: i64 },

    #[error("unresolved import {module}.{name}")]
    UnresolvedImport { module: String, name: String },

    #[error("no message bound by a previous receive")]
    NoBoundMessage,

    #[error("stale heap reference")]
    StaleHandle,

    #[error("thrown error code {0}")]
    Thrown(i32),

    #[error("{0}")]
    Runtime(String),

    #[error("I/O failure: {0}")]
    Io(String),
}

impl RuntimeError {
    /// Build a runtime error from a formatted message.
    pub fn runtime(message: impl Into<String>) -> Self {
        RuntimeError::Runtime(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::OutOfMemory { .. } | RuntimeError::StackOverflow { .. } => {
                ErrorKind::OutOfMemory
            }
            RuntimeError::Io(_) => ErrorKind::IoFailure,
            _ => ErrorKind::Runtime,
        }
    }
}
