//! Per-process operand stack.
//!
//! Indices are 1-based from the bottom (`1` is the first pushed value) or
//! negative from the top (`-1` is the top). Index `0` is never valid.
//! Growth doubles the capacity up to the configured limit; hitting the
//! limit or failing to allocate is reported as an error, never a panic.

use crate::error::RuntimeError;
use crate::value::Value;

/// Smallest capacity the stack grows to.
pub const MIN_STACK_CAPACITY: usize = 16;

/// A growable operand stack.
#[derive(Debug, Clone)]
pub struct Stack {
    values: Vec<Value>,
    limit: usize,
}

impl Stack {
    /// Create an empty stack that may grow up to `limit` values.
    pub fn new(limit: usize) -> Self {
        Self {
            values: Vec::new(),
            limit,
        }
    }

    /// Create a stack with `capacity` slots reserved up front.
    pub fn with_capacity(capacity: usize, limit: usize) -> Result<Self, RuntimeError> {
        let mut stack = Self::new(limit);
        stack.reserve(capacity)?;
        Ok(stack)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.values.capacity()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Ensure room for `more` additional values.
    pub fn reserve(&mut self, more: usize) -> Result<(), RuntimeError> {
        let needed = self.values.len().saturating_add(more);
        if needed > self.limit {
            return Err(RuntimeError::StackOverflow { limit: self.limit });
        }
        if needed <= self.values.capacity() {
            return Ok(());
        }
        let mut cap = self.values.capacity().max(MIN_STACK_CAPACITY);
        while cap < needed {
            cap = cap.saturating_mul(2);
        }
        let cap = cap.min(self.limit);
        self.values
            .try_reserve_exact(cap - self.values.len())
            .map_err(|_| RuntimeError::OutOfMemory {
                requested: cap * std::mem::size_of::<Value>(),
                available: 0,
            })
    }

    /// Push a value, doubling the capacity when full.
    #[inline]
    pub fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.values.len() == self.values.capacity() {
            self.reserve(1)?;
        }
        self.values.push(value);
        Ok(())
    }

    /// Remove `n` values from the top.
    pub fn pop(&mut self, n: usize) -> Result<(), RuntimeError> {
        if n > self.values.len() {
            return Err(RuntimeError::StackUnderflow {
                requested: n,
                size: self.values.len(),
            });
        }
        self.values.truncate(self.values.len() - n);
        Ok(())
    }

    /// Remove and return the top value.
    pub fn pop_value(&mut self) -> Result<Value, RuntimeError> {
        self.values.pop().ok_or(RuntimeError::StackUnderflow {
            requested: 1,
            size: 0,
        })
    }

    /// Normalize a signed 1-based index into a 0-based slot position.
    pub fn absolute_index(&self, idx: i64) -> Result<usize, RuntimeError> {
        let size = self.values.len() as i64;
        let i = if idx < 0 { size + idx } else { idx - 1 };
        if i < 0 || i >= size {
            return Err(RuntimeError::BadIndex(idx));
        }
        Ok(i as usize)
    }

    /// Read the value at a signed index.
    pub fn at(&self, idx: i64) -> Result<Value, RuntimeError> {
        Ok(self.values[self.absolute_index(idx)?])
    }

    /// Overwrite the value at a signed index.
    pub fn set(&mut self, idx: i64, value: Value) -> Result<(), RuntimeError> {
        let i = self.absolute_index(idx)?;
        self.values[i] = value;
        Ok(())
    }

    /// The top value, if any.
    pub fn top(&self) -> Option<Value> {
        self.values.last().copied()
    }

    pub fn to_bool(&self, idx: i64) -> Result<bool, RuntimeError> {
        match self.at(idx)? {
            Value::Bool(b) => Ok(b),
            other => Err(mismatch("bool", &other)),
        }
    }

    pub fn to_integer(&self, idx: i64) -> Result<i64, RuntimeError> {
        match self.at(idx)? {
            Value::Int(i) => Ok(i),
            other => Err(mismatch("integer", &other)),
        }
    }

    pub fn to_real(&self, idx: i64) -> Result<f64, RuntimeError> {
        match self.at(idx)? {
            Value::Real(r) => Ok(r),
            other => Err(mismatch("real", &other)),
        }
    }

    // Slot-based access for the interpreter, which tracks 0-based frame
    // bases rather than signed indices.

    pub(crate) fn slot(&self, pos: usize) -> Result<Value, RuntimeError> {
        self.values
            .get(pos)
            .copied()
            .ok_or(RuntimeError::BadIndex(pos as i64 + 1))
    }

    pub(crate) fn set_slot(&mut self, pos: usize, value: Value) -> Result<(), RuntimeError> {
        match self.values.get_mut(pos) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(RuntimeError::BadIndex(pos as i64 + 1)),
        }
    }

    pub(crate) fn remove_slot(&mut self, pos: usize) -> Result<Value, RuntimeError> {
        if pos >= self.values.len() {
            return Err(RuntimeError::BadIndex(pos as i64 + 1));
        }
        Ok(self.values.remove(pos))
    }

    /// Drop everything above `len`.
    pub fn truncate(&mut self, len: usize) {
        self.values.truncate(len);
    }

    pub fn as_slice(&self) -> &[Value] {
        &self.values
    }

    /// Release the backing storage.
    pub fn release(&mut self) {
        self.values = Vec::new();
    }
}

fn mismatch(expected: &'static str, found: &Value) -> RuntimeError {
    RuntimeError::TypeMismatch {
        expected,
        found: found.type_name(),
    }
}
