//! Cross-process values.
//!
//! Heaps are private to their process, so anything that crosses a process
//! boundary (messages, spawn arguments, exit values) is first captured into
//! a heap-independent `Payload` and then materialized in the receiving heap.

use std::sync::Arc;

use crate::error::RuntimeError;
use crate::gc::{closure_size, GcBuffer, Heap, HeapData};
use crate::module::Prototype;
use crate::value::{NativeId, ObjectKind, Pid, Value};

/// A deep copy of a value that owns all of its data.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Nil,
    Bool(bool),
    Int(i64),
    Real(f64),
    Pid(Pid),
    Native(NativeId),
    String(String),
    FixedBuffer(Vec<u8>),
    /// Live bytes of a growable buffer; capacity is not preserved.
    Buffer(Vec<u8>),
    Closure {
        prototype: Arc<Prototype>,
        upvalues: Vec<Payload>,
    },
}

impl Payload {
    /// Copy `value` and everything it references out of `heap`.
    pub fn capture(value: Value, heap: &Heap) -> Result<Self, RuntimeError> {
        Ok(match value {
            Value::Nil => Payload::Nil,
            Value::Bool(b) => Payload::Bool(b),
            Value::Int(i) => Payload::Int(i),
            Value::Real(r) => Payload::Real(r),
            Value::Pid(p) => Payload::Pid(p),
            Value::Native(n) => Payload::Native(n),
            Value::Heap(r) => match heap.get(r)? {
                HeapData::String(s) => Payload::String(s.clone()),
                HeapData::FixedBuffer(bytes) => Payload::FixedBuffer(bytes.clone()),
                HeapData::Buffer(_) => Payload::Buffer(heap.buffer_bytes(r)?.to_vec()),
                HeapData::Closure(c) => Payload::Closure {
                    prototype: Arc::clone(&c.prototype),
                    upvalues: c
                        .upvalues
                        .iter()
                        .map(|v| Payload::capture(*v, heap))
                        .collect::<Result<_, _>>()?,
                },
            },
        })
    }

    /// Rebuild the value inside `heap`.
    pub fn materialize(&self, heap: &mut Heap) -> Result<Value, RuntimeError> {
        Ok(match self {
            Payload::Nil => Value::Nil,
            Payload::Bool(b) => Value::Bool(*b),
            Payload::Int(i) => Value::Int(*i),
            Payload::Real(r) => Value::Real(*r),
            Payload::Pid(p) => Value::Pid(*p),
            Payload::Native(n) => Value::Native(*n),
            Payload::String(s) => Value::Heap(heap.alloc_string(s.as_str())?),
            Payload::FixedBuffer(bytes) => {
                let r = heap.allocate(ObjectKind::FixedBuffer, bytes.len())?;
                heap.fixed_buffer_mut(r)?.copy_from_slice(bytes);
                Value::Heap(r)
            }
            Payload::Buffer(bytes) => {
                let r = heap.alloc_buffer(bytes.len())?;
                heap.buffer_resize(r, bytes.len())?;
                heap.buffer_bytes_mut(r)?.copy_from_slice(bytes);
                Value::Heap(r)
            }
            Payload::Closure { prototype, upvalues } => {
                let values = upvalues
                    .iter()
                    .map(|p| p.materialize(heap))
                    .collect::<Result<Vec<_>, _>>()?;
                Value::Heap(heap.alloc_closure(Arc::clone(prototype), &values)?)
            }
        })
    }

    /// Bytes `materialize` will charge against the destination heap.
    pub fn heap_bytes(&self) -> usize {
        match self {
            Payload::String(s) => s.len(),
            Payload::FixedBuffer(bytes) => bytes.len(),
            Payload::Buffer(bytes) => bytes.len() + std::mem::size_of::<GcBuffer>(),
            Payload::Closure { upvalues, .. } => {
                closure_size(upvalues.len()) + upvalues.iter().map(Payload::heap_bytes).sum::<usize>()
            }
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::GcConfig;

    #[test]
    fn test_scalars_copy_without_heap() {
        let heap = Heap::new();
        assert_eq!(Payload::capture(Value::Int(42), &heap).unwrap(), Payload::Int(42));
        assert_eq!(Payload::Int(42).heap_bytes(), 0);
    }

    #[test]
    fn test_string_moves_between_heaps() {
        let mut src = Heap::new();
        let mut dst = Heap::new();
        let r = src.alloc_string("ping").unwrap();
        let payload = Payload::capture(Value::Heap(r), &src).unwrap();

        let v = payload.materialize(&mut dst).unwrap();
        let copied = v.heap_ref().unwrap();
        assert_eq!(dst.string(copied).unwrap(), "ping");
        assert_eq!(dst.used_bytes(), payload.heap_bytes());
    }

    #[test]
    fn test_buffer_copy_is_independent() {
        let mut src = Heap::new();
        let mut dst = Heap::new();
        let r = src.alloc_buffer(8).unwrap();
        src.buffer_resize(r, 3).unwrap();
        src.buffer_bytes_mut(r).unwrap().copy_from_slice(b"abc");

        let payload = Payload::capture(Value::Heap(r), &src).unwrap();
        let copy = payload.materialize(&mut dst).unwrap().heap_ref().unwrap();
        src.buffer_bytes_mut(r).unwrap()[0] = b'z';

        assert_eq!(dst.buffer_bytes(copy).unwrap(), b"abc");
        assert_eq!(dst.used_bytes(), payload.heap_bytes());
    }

    #[test]
    fn test_closure_upvalues_are_deep_copied() {
        let mut src = Heap::new();
        let mut dst = Heap::new();
        let s = src.alloc_string("up").unwrap();
        let proto = Arc::new(Prototype::default());
        let c = src
            .alloc_closure(Arc::clone(&proto), &[Value::Heap(s), Value::Int(1)])
            .unwrap();

        let payload = Payload::capture(Value::Heap(c), &src).unwrap();
        let copy = payload.materialize(&mut dst).unwrap().heap_ref().unwrap();
        let closure = dst.closure(copy).unwrap();
        assert!(Arc::ptr_eq(&closure.prototype, &proto));
        assert_eq!(closure.upvalues[1], Value::Int(1));
        let up = closure.upvalues[0].heap_ref().unwrap();
        assert_eq!(dst.string(up).unwrap(), "up");
        assert_eq!(dst.used_bytes(), payload.heap_bytes());
    }

    #[test]
    fn test_materialize_reports_out_of_memory() {
        let mut dst = Heap::with_config(GcConfig {
            heap_limit: 4,
            gc_threshold: 4,
        });
        let payload = Payload::String("too long".into());
        assert!(matches!(
            payload.materialize(&mut dst),
            Err(RuntimeError::OutOfMemory { .. })
        ));
        assert_eq!(dst.live_objects(), 0);
    }
}
