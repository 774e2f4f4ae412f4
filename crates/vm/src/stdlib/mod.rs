//! Native libraries available to bytecode through imports.
//!
//! - `std-buffer`: growable byte buffers
//! - `std-process`: self, yield, sleep, spawn and protected calls
//! - `std-value`: type predicates, comparison and integer arithmetic

pub mod buffer;
pub mod process;
pub mod value;

use crate::error::RuntimeError;
use crate::loader::Library;
use crate::value::{HeapRef, ObjectKind, Value};

/// Every standard library.
pub fn libraries() -> Vec<Library> {
    vec![buffer::library(), process::library(), value::library()]
}

pub(crate) fn integer_arg(args: &[Value], i: usize) -> Result<i64, RuntimeError> {
    match args.get(i) {
        Some(Value::Int(v)) => Ok(*v),
        Some(other) => Err(RuntimeError::TypeMismatch {
            expected: "integer",
            found: other.type_name(),
        }),
        None => Err(RuntimeError::ArityMismatch {
            expected: i + 1,
            found: args.len(),
        }),
    }
}

pub(crate) fn object_arg(args: &[Value], i: usize, kind: ObjectKind) -> Result<HeapRef, RuntimeError> {
    match args.get(i) {
        Some(Value::Heap(r)) if r.kind == kind => Ok(*r),
        Some(other) => Err(RuntimeError::TypeMismatch {
            expected: kind.name(),
            found: other.type_name(),
        }),
        None => Err(RuntimeError::ArityMismatch {
            expected: i + 1,
            found: args.len(),
        }),
    }
}
