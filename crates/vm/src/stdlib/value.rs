//! `std-value`: predicates and arithmetic for receive patterns and loops.

use crate::error::RuntimeError;
use crate::loader::Library;
use crate::process::Process;
use crate::value::Value;

use super::integer_arg;

pub fn library() -> Library {
    Library::new("std-value")
        .function("is_nil/1", |_, args| Ok(Value::Bool(matches!(args[0], Value::Nil))))
        .function("is_bool/1", |_, args| Ok(Value::Bool(matches!(args[0], Value::Bool(_)))))
        .function("is_integer/1", |_, args| Ok(Value::Bool(matches!(args[0], Value::Int(_)))))
        .function("is_real/1", |_, args| Ok(Value::Bool(matches!(args[0], Value::Real(_)))))
        .function("is_pid/1", |_, args| Ok(Value::Bool(matches!(args[0], Value::Pid(_)))))
        .function("eq/2", eq)
        .function("lt/2", lt)
        .function("add/2", add)
        .function("sub/2", sub)
}

/// Scalars compare by value; heap objects by identity, strings by content.
fn eq(process: &mut Process, args: &[Value]) -> Result<Value, RuntimeError> {
    let equal = match (args[0], args[1]) {
        (Value::Int(a), Value::Real(b)) | (Value::Real(b), Value::Int(a)) => a as f64 == b,
        (Value::Heap(a), Value::Heap(b)) if a != b => {
            match (process.heap.string(a), process.heap.string(b)) {
                (Ok(a), Ok(b)) => a == b,
                _ => false,
            }
        }
        (a, b) => a == b,
    };
    Ok(Value::Bool(equal))
}

fn lt(_: &mut Process, args: &[Value]) -> Result<Value, RuntimeError> {
    let less = match (args[0], args[1]) {
        (Value::Int(a), Value::Int(b)) => a < b,
        (Value::Real(a), Value::Real(b)) => a < b,
        (Value::Int(a), Value::Real(b)) => (a as f64) < b,
        (Value::Real(a), Value::Int(b)) => a < b as f64,
        (a, b) => {
            return Err(RuntimeError::runtime(format!(
                "cannot compare {} with {}",
                a.type_name(),
                b.type_name()
            )))
        }
    };
    Ok(Value::Bool(less))
}

fn add(_: &mut Process, args: &[Value]) -> Result<Value, RuntimeError> {
    let (a, b) = (integer_arg(args, 0)?, integer_arg(args, 1)?);
    a.checked_add(b)
        .map(Value::Int)
        .ok_or_else(|| RuntimeError::runtime("integer overflow"))
}

fn sub(_: &mut Process, args: &[Value]) -> Result<Value, RuntimeError> {
    let (a, b) = (integer_arg(args, 0)?, integer_arg(args, 1)?);
    a.checked_sub(b)
        .map(Value::Int)
        .ok_or_else(|| RuntimeError::runtime("integer overflow"))
}
