//! `std-buffer`: growable byte buffers.
//!
//! Every function takes the buffer as its first argument. Indices are
//! 0-based and bounds-checked against the logical size.

use crate::error::RuntimeError;
use crate::gc::GcBuffer;
use crate::loader::Library;
use crate::process::Process;
use crate::value::{HeapRef, ObjectKind, Value};

use super::{integer_arg, object_arg};

pub fn library() -> Library {
    Library::new("std-buffer")
        .function("new/1", new)
        .function("reserve/2", reserve)
        .function("shrink_to_fit/1", shrink_to_fit)
        .function("resize/2", resize)
        .function("get/2", get)
        .function("set/3", set)
        .function("size/1", size)
        .function("capacity/1", capacity)
}

fn buffer(args: &[Value]) -> Result<HeapRef, RuntimeError> {
    object_arg(args, 0, ObjectKind::Buffer)
}

fn non_negative(value: i64, what: &str) -> Result<usize, RuntimeError> {
    usize::try_from(value).map_err(|_| RuntimeError::runtime(format!("bad {what} {value}")))
}

fn check_index(process: &Process, r: HeapRef, idx: i64) -> Result<usize, RuntimeError> {
    let size = process.heap.buffer(r)?.size;
    match usize::try_from(idx) {
        Ok(i) if i < size => Ok(i),
        _ => Err(RuntimeError::BadIndex(idx)),
    }
}

fn new(process: &mut Process, args: &[Value]) -> Result<Value, RuntimeError> {
    let capacity = non_negative(integer_arg(args, 0)?, "capacity")?;
    process.prepare_heap(capacity + std::mem::size_of::<GcBuffer>())?;
    Ok(Value::Heap(process.heap.alloc_buffer(capacity)?))
}

fn reserve(process: &mut Process, args: &[Value]) -> Result<Value, RuntimeError> {
    let r = buffer(args)?;
    let capacity = non_negative(integer_arg(args, 1)?, "capacity")?;
    if capacity > process.heap.buffer(r)?.capacity {
        process.prepare_heap(capacity)?;
    }
    process.heap.buffer_reserve(r, capacity)?;
    Ok(Value::Nil)
}

fn shrink_to_fit(process: &mut Process, args: &[Value]) -> Result<Value, RuntimeError> {
    let r = buffer(args)?;
    let size = process.heap.buffer(r)?.size;
    process.prepare_heap(size)?;
    process.heap.buffer_shrink_to_fit(r)?;
    Ok(Value::Nil)
}

fn resize(process: &mut Process, args: &[Value]) -> Result<Value, RuntimeError> {
    let r = buffer(args)?;
    let size = non_negative(integer_arg(args, 1)?, "size")?;
    if size > process.heap.buffer(r)?.capacity {
        process.prepare_heap(size)?;
    }
    process.heap.buffer_resize(r, size)?;
    Ok(Value::Nil)
}

fn get(process: &mut Process, args: &[Value]) -> Result<Value, RuntimeError> {
    let r = buffer(args)?;
    let idx = check_index(process, r, integer_arg(args, 1)?)?;
    Ok(Value::Int(process.heap.buffer_bytes(r)?[idx] as i64))
}

fn set(process: &mut Process, args: &[Value]) -> Result<Value, RuntimeError> {
    let r = buffer(args)?;
    let idx = check_index(process, r, integer_arg(args, 1)?)?;
    let byte = integer_arg(args, 2)?;
    process.heap.buffer_bytes_mut(r)?[idx] = byte as u8;
    Ok(Value::Nil)
}

fn size(process: &mut Process, args: &[Value]) -> Result<Value, RuntimeError> {
    let r = buffer(args)?;
    Ok(Value::Int(process.heap.buffer(r)?.size as i64))
}

fn capacity(process: &mut Process, args: &[Value]) -> Result<Value, RuntimeError> {
    let r = buffer(args)?;
    Ok(Value::Int(process.heap.buffer(r)?.capacity as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::MIN_BUFFER_GROW;
    use crate::process::ProcessConfig;
    use crate::value::{Pid, SchedulerId};

    fn process() -> Process {
        Process::init(Pid(1), SchedulerId(0), ProcessConfig::default())
    }

    /// Allocate a buffer and keep it rooted on the stack.
    fn new_buffer(p: &mut Process, capacity: i64) -> Value {
        let b = new(p, &[Value::Int(capacity)]).unwrap();
        p.push(b).unwrap();
        b
    }

    #[test]
    fn test_new_reports_size_and_capacity() {
        let mut p = process();
        let b = new_buffer(&mut p, 10);
        assert_eq!(size(&mut p, &[b]).unwrap(), Value::Int(0));
        assert_eq!(capacity(&mut p, &[b]).unwrap(), Value::Int(10));
    }

    #[test]
    fn test_negative_arguments_fail() {
        let mut p = process();
        assert_eq!(
            new(&mut p, &[Value::Int(-3)]),
            Err(RuntimeError::runtime("bad capacity -3"))
        );
        let b = new_buffer(&mut p, 0);
        assert_eq!(
            resize(&mut p, &[b, Value::Int(-1)]),
            Err(RuntimeError::runtime("bad size -1"))
        );
    }

    #[test]
    fn test_resize_uses_growth_policy() {
        let mut p = process();
        let b = new_buffer(&mut p, 0);
        resize(&mut p, &[b, Value::Int(3)]).unwrap();
        assert_eq!(capacity(&mut p, &[b]).unwrap(), Value::Int(MIN_BUFFER_GROW as i64));
        resize(&mut p, &[b, Value::Int(200)]).unwrap();
        assert_eq!(capacity(&mut p, &[b]).unwrap(), Value::Int(256));
        assert_eq!(size(&mut p, &[b]).unwrap(), Value::Int(200));
    }

    #[test]
    fn test_get_set_bounds() {
        let mut p = process();
        let b = new_buffer(&mut p, 4);
        resize(&mut p, &[b, Value::Int(2)]).unwrap();
        set(&mut p, &[b, Value::Int(1), Value::Int(0x1ff)]).unwrap();
        assert_eq!(get(&mut p, &[b, Value::Int(1)]).unwrap(), Value::Int(0xff));
        assert_eq!(get(&mut p, &[b, Value::Int(0)]).unwrap(), Value::Int(0));
        assert_eq!(get(&mut p, &[b, Value::Int(2)]), Err(RuntimeError::BadIndex(2)));
        assert_eq!(
            set(&mut p, &[b, Value::Int(-1), Value::Int(0)]),
            Err(RuntimeError::BadIndex(-1))
        );
    }

    #[test]
    fn test_reserve_and_shrink() {
        let mut p = process();
        let b = new_buffer(&mut p, 4);
        reserve(&mut p, &[b, Value::Int(100)]).unwrap();
        assert_eq!(capacity(&mut p, &[b]).unwrap(), Value::Int(100));
        resize(&mut p, &[b, Value::Int(7)]).unwrap();
        shrink_to_fit(&mut p, &[b]).unwrap();
        assert_eq!(capacity(&mut p, &[b]).unwrap(), Value::Int(7));
    }

    #[test]
    fn test_wrong_object_kind() {
        let mut p = process();
        assert_eq!(
            size(&mut p, &[Value::Int(1)]),
            Err(RuntimeError::TypeMismatch {
                expected: "buffer",
                found: "integer"
            })
        );
    }
}
