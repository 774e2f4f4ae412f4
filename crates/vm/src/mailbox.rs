//! Process mailbox with a scan cursor for selective receive.
//!
//! Messages are delivered to the tail in send order. `receive` walks forward
//! from the cursor, binding one message at a time; the code following `RCV`
//! decides whether the bound message matches and either removes it (`RMV`)
//! or moves on to the next one. `rewind` resets the scan to the head.

use std::collections::VecDeque;

use crate::error::RuntimeError;
use crate::value::Value;

#[derive(Debug, Default)]
pub struct Mailbox {
    messages: VecDeque<Value>,
    cursor: usize,
    bound: Option<usize>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Append a delivered message.
    pub fn push(&mut self, message: Value) {
        self.messages.push_back(message);
    }

    /// True if a message exists at or after the cursor.
    pub fn has_pending(&self) -> bool {
        self.cursor < self.messages.len()
    }

    /// Bind the message at the cursor and advance past it.
    pub fn receive(&mut self) -> Option<Value> {
        let message = *self.messages.get(self.cursor)?;
        self.bound = Some(self.cursor);
        self.cursor += 1;
        Some(message)
    }

    /// Remove the bound message. The cursor lands on the slot it occupied,
    /// which now holds the message that followed it.
    pub fn remove(&mut self) -> Result<Value, RuntimeError> {
        let index = self.bound.take().ok_or(RuntimeError::NoBoundMessage)?;
        let message = self
            .messages
            .remove(index)
            .ok_or(RuntimeError::NoBoundMessage)?;
        self.cursor = index;
        Ok(message)
    }

    /// Restart scanning from the head.
    pub fn rewind(&mut self) {
        self.cursor = 0;
        self.bound = None;
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.messages.iter()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.rewind();
    }
}
