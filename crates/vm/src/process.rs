//! Lightweight processes.
//!
//! Each process is isolated with its own operand stack, heap and mailbox.
//! Communication happens only through message passing (deep copy), so a
//! process's state is only ever touched while that process runs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::trace;

use crate::error::RuntimeError;
use crate::gc::{GcConfig, Heap};
use crate::mailbox::Mailbox;
use crate::message::Payload;
use crate::module::Prototype;
use crate::stack::Stack;
use crate::value::{ObjectKind, Pid, SchedulerId, Value};

/// Process configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Stack slots reserved by `start`.
    pub initial_stack: usize,
    /// Maximum number of values on the stack.
    pub max_stack: usize,
    /// Maximum call depth.
    pub max_frames: usize,
    pub gc: GcConfig,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            initial_stack: 64,
            max_stack: 1 << 20,
            max_frames: 1 << 12,
            gc: GcConfig::default(),
        }
    }
}

/// Process execution state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    /// In the ready queue.
    Ready,
    /// Currently executing.
    Running,
    /// Waiting for a message, a timer or a yield to complete.
    Blocked,
    /// Finished; see the scheduler's exit reason.
    Exited,
}

/// What a blocked process is waiting for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    /// Blocked in `RCV`; `None` waits forever.
    Receive(Option<Instant>),
    Sleep(Instant),
}

impl Wait {
    pub fn deadline(&self) -> Option<Instant> {
        match self {
            Wait::Receive(deadline) => *deadline,
            Wait::Sleep(until) => Some(*until),
        }
    }
}

/// Reason for process exit.
#[derive(Clone, Debug, PartialEq)]
pub enum ExitReason {
    /// Returned from the root frame.
    Normal(Payload),
    /// Uncaught error.
    Error(RuntimeError),
    /// Killed through the scheduler.
    Killed,
}

/// Work a native function asks the scheduler to do once it returns.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    Yield,
    Sleep(Duration),
    /// Start a new process; the native's result slot receives its pid.
    Spawn { callee: Payload, args: Vec<Payload> },
}

/// Call frame.
#[derive(Clone, Debug)]
pub struct Frame {
    pub prototype: Arc<Prototype>,
    /// Next instruction to execute.
    pub ip: usize,
    /// Stack position of local 0.
    pub base: usize,
    /// Stack position of the callee; the result lands here on return.
    pub callee_slot: usize,
    /// Set for frames entered through `pcall`.
    pub protected: bool,
}

/// A lightweight process (like Erlang processes).
pub struct Process {
    pid: Pid,
    owner: SchedulerId,
    state: ProcessState,
    config: ProcessConfig,

    /// Operand stack.
    pub stack: Stack,

    /// Process-local garbage-collected heap.
    pub heap: Heap,

    pub mailbox: Mailbox,

    pub frames: Vec<Frame>,

    /// What the process waits for while `Blocked`.
    pub wait: Option<Wait>,

    /// Deadline fixed by the first attempt of a timed `RCV`.
    pub receive_deadline: Option<Instant>,

    request: Option<Request>,

    /// When this process was created.
    pub started_at: Instant,
}

impl Process {
    /// Create a process owned by `owner`. It has no frames until `start`.
    pub fn init(pid: Pid, owner: SchedulerId, config: ProcessConfig) -> Self {
        Self {
            pid,
            owner,
            state: ProcessState::Ready,
            stack: Stack::new(config.max_stack),
            heap: Heap::with_config(config.gc.clone()),
            mailbox: Mailbox::new(),
            frames: Vec::new(),
            wait: None,
            receive_deadline: None,
            request: None,
            started_at: Instant::now(),
            config,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn owner(&self) -> SchedulerId {
        self.owner
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn set_state(&mut self, state: ProcessState) {
        trace!(pid = %self.pid, from = ?self.state, to = ?state, "process state");
        self.state = state;
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Materialize `callee` and `args` and enter the callee's root frame.
    pub fn start(&mut self, callee: &Payload, args: &[Payload]) -> Result<(), RuntimeError> {
        self.stack = Stack::with_capacity(self.config.initial_stack, self.config.max_stack)?;
        self.frames.clear();

        let bytes = callee.heap_bytes() + args.iter().map(Payload::heap_bytes).sum::<usize>();
        self.prepare_heap(bytes)?;
        let value = callee.materialize(&mut self.heap)?;
        self.stack.push(value)?;
        for arg in args {
            let value = arg.materialize(&mut self.heap)?;
            self.stack.push(value)?;
        }
        self.enter(0, args.len(), false)
    }

    /// Push a frame for the closure at `callee_slot` with `nargs` arguments
    /// above it. Upvalues are copied in after the arguments and local vars
    /// are initialized to nil.
    pub fn enter(&mut self, callee_slot: usize, nargs: usize, protected: bool) -> Result<(), RuntimeError> {
        let callee = self.stack.slot(callee_slot)?;
        let r = match callee {
            Value::Heap(r) if r.kind == ObjectKind::Closure => r,
            other => return Err(RuntimeError::NotCallable(other.type_name())),
        };
        let closure = self.heap.closure(r)?;
        let prototype = Arc::clone(&closure.prototype);
        if nargs != prototype.num_arguments as usize {
            return Err(RuntimeError::ArityMismatch {
                expected: prototype.num_arguments as usize,
                found: nargs,
            });
        }
        if self.frames.len() >= self.config.max_frames {
            return Err(RuntimeError::StackOverflow {
                limit: self.config.max_frames,
            });
        }

        let upvalues: smallvec::SmallVec<[Value; 4]> = closure.upvalues.clone();
        let num_upvalues = prototype.num_upvalues as usize;
        self.stack.reserve(num_upvalues + prototype.num_local_vars as usize)?;
        for i in 0..num_upvalues {
            self.stack.push(upvalues.get(i).copied().unwrap_or_default())?;
        }
        for _ in 0..prototype.num_local_vars {
            self.stack.push(Value::Nil)?;
        }

        self.frames.push(Frame {
            prototype,
            ip: 0,
            base: callee_slot + 1,
            callee_slot,
            protected,
        });
        Ok(())
    }

    pub fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        self.stack.push(value)
    }

    pub fn push_bool(&mut self, b: bool) -> Result<(), RuntimeError> {
        self.stack.push(Value::Bool(b))
    }

    pub fn push_integer(&mut self, i: i64) -> Result<(), RuntimeError> {
        self.stack.push(Value::Int(i))
    }

    pub fn push_real(&mut self, r: f64) -> Result<(), RuntimeError> {
        self.stack.push(Value::Real(r))
    }

    /// Allocate a string and push a reference to it.
    pub fn push_string(&mut self, s: &str) -> Result<(), RuntimeError> {
        self.prepare_heap(s.len())?;
        let r = self.heap.alloc_string(s)?;
        self.stack.push(Value::Heap(r))
    }

    /// Make room for `bytes` of allocation, collecting first if the heap is
    /// due or too full. Values not on the stack or in the mailbox are not
    /// roots, so callers must hold nothing else across this call.
    pub fn prepare_heap(&mut self, bytes: usize) -> Result<(), RuntimeError> {
        if self.heap.should_collect() || self.heap.available() < bytes {
            self.collect_garbage();
        }
        self.heap.reserve(bytes)
    }

    pub fn collect_garbage(&mut self) -> usize {
        self.heap
            .collect(self.stack.as_slice().iter().chain(self.mailbox.iter()))
    }

    /// Run `f` with the stack and frames checkpointed.
    ///
    /// If `f` fails, the stack is cut back to its depth at entry, the frames
    /// are restored and a string describing the error is pushed before the
    /// error is returned to the caller.
    pub fn protect<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, RuntimeError>,
    ) -> Result<T, RuntimeError> {
        let depth = self.stack.len();
        let frames = self.frames.len();
        match f(self) {
            Ok(value) => Ok(value),
            Err(err) => {
                self.stack.truncate(depth);
                self.frames.truncate(frames);
                self.push_error(&err);
                Err(err)
            }
        }
    }

    /// Raise an error carrying `code`.
    pub fn throw<T>(&self, code: i32) -> Result<T, RuntimeError> {
        Err(RuntimeError::Thrown(code))
    }

    /// Push the error description, or nil if it cannot be allocated.
    pub fn push_error(&mut self, err: &RuntimeError) {
        let description = err.to_string();
        if self.push_string(&description).is_err() {
            // The stack was cut back, so there is room for one value.
            let _ = self.stack.push(Value::Nil);
        }
    }

    /// Unwind to the nearest protected frame and leave `false, description`
    /// in its result slots. Returns the error if no frame catches it.
    pub fn unwind(&mut self, err: RuntimeError) -> Result<(), RuntimeError> {
        let Some(index) = self.frames.iter().rposition(|f| f.protected) else {
            return Err(err);
        };
        let callee_slot = self.frames[index].callee_slot;
        trace!(pid = %self.pid, depth = self.frames.len() - index, error = %err, "unwinding");
        self.stack.truncate(callee_slot);
        self.frames.truncate(index);
        self.receive_deadline = None;
        self.stack.push(Value::Bool(false))?;
        self.push_error(&err);
        Ok(())
    }

    /// Replace the `true, result` pair left by a protected native call
    /// with `false, description`.
    pub fn fail_protected_call(&mut self, err: &RuntimeError) -> Result<(), RuntimeError> {
        self.stack.pop(2)?;
        self.push_bool(false)?;
        self.push_error(err);
        Ok(())
    }

    /// Ask the scheduler for `request` once the current native returns.
    pub fn request(&mut self, request: Request) {
        self.request = Some(request);
    }

    pub fn take_request(&mut self) -> Option<Request> {
        self.request.take()
    }

    /// Copy a message into this process's heap and append it to the
    /// mailbox.
    pub fn deliver(&mut self, payload: &Payload) -> Result<(), RuntimeError> {
        self.prepare_heap(payload.heap_bytes())?;
        let message = payload.materialize(&mut self.heap)?;
        self.mailbox.push(message);
        Ok(())
    }

    /// True if blocked in `RCV` and a new message would wake it.
    pub fn awaits_message(&self) -> bool {
        self.state == ProcessState::Blocked && matches!(self.wait, Some(Wait::Receive(_)))
    }

    /// Release the stack, heap and mailbox.
    pub fn cleanup(&mut self) {
        self.frames.clear();
        self.stack.release();
        self.mailbox.clear();
        self.heap.clear();
        self.wait = None;
        self.receive_deadline = None;
        self.request = None;
        self.state = ProcessState::Exited;
    }

    /// Instruction pointer of the innermost frame.
    pub fn ip(&self) -> Option<usize> {
        self.frames.last().map(|f| f.ip)
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("state", &self.state)
            .field("frames", &self.frames.len())
            .field("stack", &self.stack.len())
            .field("mailbox", &self.mailbox.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Instruction;

    fn function(num_arguments: u8, num_upvalues: u8, num_local_vars: u8) -> Payload {
        Payload::Closure {
            prototype: Arc::new(Prototype {
                num_arguments,
                num_upvalues,
                num_local_vars,
                instructions: vec![Instruction::Ret],
                ..Default::default()
            }),
            upvalues: (0..num_upvalues).map(|i| Payload::Int(100 + i as i64)).collect(),
        }
    }

    fn process() -> Process {
        Process::init(Pid(1), SchedulerId(0), ProcessConfig::default())
    }

    #[test]
    fn test_start_lays_out_frame() {
        let mut p = process();
        p.start(&function(2, 1, 2), &[Payload::Int(1), Payload::Int(2)])
            .unwrap();
        let frame = p.frames.last().unwrap();
        assert_eq!(frame.callee_slot, 0);
        assert_eq!(frame.base, 1);
        // callee, 2 args, 1 upvalue, 2 locals
        assert_eq!(p.stack.len(), 6);
        assert_eq!(p.stack.at(2).unwrap(), Value::Int(1));
        assert_eq!(p.stack.at(4).unwrap(), Value::Int(100));
        assert_eq!(p.stack.at(-1).unwrap(), Value::Nil);
    }

    #[test]
    fn test_start_checks_arity() {
        let mut p = process();
        assert_eq!(
            p.start(&function(1, 0, 0), &[]),
            Err(RuntimeError::ArityMismatch {
                expected: 1,
                found: 0
            })
        );
        assert_eq!(
            process().start(&Payload::Int(3), &[]),
            Err(RuntimeError::NotCallable("integer"))
        );
    }

    #[test]
    fn test_frame_limit() {
        let config = ProcessConfig {
            max_frames: 1,
            ..Default::default()
        };
        let mut p = Process::init(Pid(1), SchedulerId(0), config);
        p.start(&function(0, 0, 0), &[]).unwrap();
        assert_eq!(
            p.enter(0, 0, false),
            Err(RuntimeError::StackOverflow { limit: 1 })
        );
    }

    #[test]
    fn test_protect_restores_depth_and_pushes_description() {
        let mut p = process();
        p.push_integer(1).unwrap();
        let result: Result<(), _> = p.protect(|p| {
            p.push_integer(2)?;
            p.push_integer(3)?;
            p.throw(7)
        });
        assert_eq!(result, Err(RuntimeError::Thrown(7)));
        assert_eq!(p.stack.len(), 2);
        assert_eq!(p.stack.at(1).unwrap(), Value::Int(1));
        let r = p.stack.at(-1).unwrap().heap_ref().unwrap();
        assert_eq!(p.heap.string(r).unwrap(), "thrown error code 7");
    }

    #[test]
    fn test_protect_passes_success_through() {
        let mut p = process();
        let v = p.protect(|p| {
            p.push_bool(true)?;
            Ok(5)
        });
        assert_eq!(v, Ok(5));
        assert_eq!(p.stack.len(), 1);
    }

    #[test]
    fn test_unwind_without_protected_frame() {
        let mut p = process();
        p.start(&function(0, 0, 0), &[]).unwrap();
        assert_eq!(
            p.unwind(RuntimeError::BadIndex(3)),
            Err(RuntimeError::BadIndex(3))
        );
    }

    #[test]
    fn test_unwind_to_protected_frame() {
        let mut p = process();
        p.start(&function(0, 0, 0), &[]).unwrap();
        // A protected call from the root frame.
        let callee = function(0, 0, 1).materialize(&mut p.heap).unwrap();
        p.push(callee).unwrap();
        p.enter(1, 0, true).unwrap();
        p.push_integer(9).unwrap();

        p.unwind(RuntimeError::BadIndex(3)).unwrap();
        assert_eq!(p.frames.len(), 1);
        assert_eq!(p.stack.len(), 3);
        assert_eq!(p.stack.at(-2).unwrap(), Value::Bool(false));
        let r = p.stack.at(-1).unwrap().heap_ref().unwrap();
        assert_eq!(p.heap.string(r).unwrap(), "bad index 3");
    }

    #[test]
    fn test_prepare_heap_collects_unrooted_objects() {
        let config = ProcessConfig {
            gc: GcConfig {
                heap_limit: 64,
                gc_threshold: 1024,
            },
            ..Default::default()
        };
        let mut p = Process::init(Pid(1), SchedulerId(0), config);
        p.heap.alloc_string("x".repeat(40)).unwrap();
        p.push_string("kept").unwrap();

        p.prepare_heap(50).unwrap();
        assert_eq!(p.heap.live_objects(), 1);
        assert!(p.prepare_heap(100).is_err());
    }

    #[test]
    fn test_deliver_copies_into_heap() {
        let mut p = process();
        p.deliver(&Payload::String("hi".into())).unwrap();
        let r = p.mailbox.receive().unwrap().heap_ref().unwrap();
        assert_eq!(p.heap.string(r).unwrap(), "hi");
    }

    #[test]
    fn test_cleanup_releases_everything() {
        let mut p = process();
        p.start(&function(0, 0, 0), &[]).unwrap();
        p.deliver(&Payload::Int(1)).unwrap();
        p.cleanup();
        assert_eq!(p.state(), ProcessState::Exited);
        assert!(p.stack.is_empty());
        assert!(p.mailbox.is_empty());
        assert_eq!(p.heap.live_objects(), 0);
    }
}
