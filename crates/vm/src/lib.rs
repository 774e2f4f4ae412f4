//! Strand Virtual Machine
//!
//! A stack-based bytecode VM built around isolated processes:
//! - Tagged values on a per-process operand stack
//! - Per-process garbage-collected heaps with generation-checked handles
//! - Actor-style messaging with selective receive
//! - Structured error recovery through protected calls
//! - A cooperative, single-threaded scheduler with lifecycle observers
#![allow(clippy::new_without_default)]

pub mod error;
pub mod gc;
pub mod interpreter;
pub mod loader;
pub mod mailbox;
pub mod message;
pub mod module;
pub mod process;
pub mod scheduler;
pub mod stack;
pub mod stdlib;
pub mod value;

pub use error::{ErrorKind, RuntimeError};
pub use gc::{GcConfig, GcStats, Handle, Heap, HeapData};
pub use interpreter::Outcome;
pub use loader::{Library, LinkReport, Loader, NativeFn, NativeKind, Symbol};
pub use mailbox::Mailbox;
pub use message::Payload;
pub use module::{Chunk, ChunkId, Constant, Import, Instruction, Prototype};
pub use process::{ExitReason, Frame, Process, ProcessConfig, ProcessState, Request};
pub use scheduler::{Observer, ObserverId, RunOutcome, Scheduler, SchedulerConfig, StepOutcome};
pub use stack::Stack;
pub use value::{HeapRef, NativeId, ObjectKind, Pid, SchedulerId, Value};
