//! Fetch-decode-execute loop.
//!
//! `run` executes the current process until something needs the scheduler:
//! a message to deliver, a process to spawn, a suspension, an exit or an
//! uncaught error. Suspension happens only between instructions, so a
//! process never resumes with a half-executed instruction.

use std::sync::Arc;
use std::time::{Duration, Instant};

use smallvec::SmallVec;
use tracing::trace;

use crate::error::RuntimeError;
use crate::gc::closure_size;
use crate::loader::{Loader, NativeKind, Symbol};
use crate::message::Payload;
use crate::module::{Constant, Instruction, Prototype};
use crate::process::{Process, Request};
use crate::value::{ObjectKind, Pid, Value};

/// Why the interpreter handed control back.
#[derive(Debug, PartialEq)]
pub enum Outcome {
    /// `SND` executed; the scheduler delivers and resumes the sender.
    Send { to: Pid, payload: Payload },
    /// A native asked for a new process; its pid replaces the stack top.
    /// `protected` is set when the native ran under `pcall`, so a failed
    /// spawn turns into `false, description` instead of unwinding.
    Spawn {
        callee: Payload,
        args: Vec<Payload>,
        protected: bool,
    },
    /// `BRK` executed.
    Break { ip: usize },
    Yield,
    /// `RCV` found nothing; retry on resume.
    Block { deadline: Option<Instant> },
    Sleep(Instant),
    /// The root frame returned.
    Exit(Value),
    /// An error reached the root frame.
    Trap(RuntimeError),
}

/// Run `process` until it needs the scheduler.
pub fn run(process: &mut Process, loader: &Loader) -> Outcome {
    loop {
        match step(process, loader) {
            Ok(None) => {}
            Ok(Some(outcome)) => return outcome,
            Err(err) => {
                if let Err(err) = process.unwind(err) {
                    return Outcome::Trap(err);
                }
            }
        }
    }
}

fn jump(frame_ip: usize, disp: i32, len: usize) -> Result<usize, RuntimeError> {
    let target = frame_ip as i64 + disp as i64;
    if target < 0 || target > len as i64 {
        return Err(RuntimeError::BadJump { target });
    }
    Ok(target as usize)
}

fn operand<'a, T>(items: &'a [T], index: u32, what: &'static str) -> Result<&'a T, RuntimeError> {
    items.get(index as usize).ok_or(RuntimeError::BadOperand {
        what,
        index: index as usize,
    })
}

/// Execute one instruction.
fn step(process: &mut Process, loader: &Loader) -> Result<Option<Outcome>, RuntimeError> {
    let (prototype, ip, base) = match process.frames.last_mut() {
        Some(frame) => {
            let ip = frame.ip;
            frame.ip += 1;
            (Arc::clone(&frame.prototype), ip, frame.base)
        }
        None => return Ok(Some(Outcome::Exit(Value::Nil))),
    };

    let Some(&instruction) = prototype.instructions.get(ip) else {
        // Falling off the end returns like RET.
        return ret(process, base, &prototype);
    };

    match instruction {
        Instruction::Nop => {}
        Instruction::Brk => return Ok(Some(Outcome::Break { ip })),
        Instruction::Pop(n) => process.stack.pop(n as usize)?,
        Instruction::Ldk(idx) => match operand(&prototype.constants, idx, "constant")? {
            Constant::Integer(i) => process.push_integer(*i)?,
            Constant::Real(r) => process.push_real(*r)?,
            Constant::String(s) => process.push_string(s)?,
        },
        Instruction::Nil => process.push(Value::Nil)?,
        Instruction::Ldb(b) => process.push_bool(b)?,
        Instruction::Lsi(i) => process.push_integer(i as i64)?,

        Instruction::Llv(idx) => {
            let slot = local_slot(&prototype, base, idx)?;
            let value = process.stack.slot(slot)?;
            process.push(value)?;
        }
        Instruction::Slv(idx) => {
            let slot = local_slot(&prototype, base, idx)?;
            let value = process.stack.pop_value()?;
            process.stack.set_slot(slot, value)?;
        }

        Instruction::Imp(idx) => {
            let import = operand(&prototype.imports, idx, "import")?;
            match loader.resolve(&import.module, &import.name)? {
                Symbol::Native(id) => process.push(Value::Native(id))?,
                Symbol::Function(function) => {
                    let upvalues = vec![Value::Nil; function.num_upvalues as usize];
                    process.prepare_heap(closure_size(upvalues.len()))?;
                    let r = process.heap.alloc_closure(function, &upvalues)?;
                    process.push(Value::Heap(r))?;
                }
            }
        }
        Instruction::Cls(idx) => {
            let nested = Arc::clone(operand(&prototype.nesteds, idx, "prototype")?);
            let n = nested.num_upvalues as usize;
            let len = process.stack.len();
            if n > len {
                return Err(RuntimeError::StackUnderflow {
                    requested: n,
                    size: len,
                });
            }
            // Upvalues stay on the stack, and thus rooted, until the closure exists.
            process.prepare_heap(closure_size(n))?;
            let r = process
                .heap
                .alloc_closure(nested, &process.stack.as_slice()[len - n..])?;
            process.stack.pop(n)?;
            process.push(Value::Heap(r))?;
        }

        Instruction::Jmp(disp) => {
            set_ip(process, jump(ip, disp, prototype.instructions.len())?);
        }
        Instruction::Jin(disp) => {
            let target = jump(ip, disp, prototype.instructions.len())?;
            if !process.stack.pop_value()?.is_truthy() {
                set_ip(process, target);
            }
        }
        Instruction::Ivk(nargs) => return invoke(process, loader, nargs as usize, false),
        Instruction::Ret => return ret(process, base, &prototype),

        Instruction::Snd => {
            let message = process.stack.pop_value()?;
            let to = match process.stack.pop_value()? {
                Value::Pid(pid) => pid,
                other => {
                    return Err(RuntimeError::TypeMismatch {
                        expected: "pid",
                        found: other.type_name(),
                    })
                }
            };
            let payload = Payload::capture(message, &process.heap)?;
            return Ok(Some(Outcome::Send { to, payload }));
        }
        Instruction::Rcv(disp) => return receive(process, ip, disp, prototype.instructions.len()),
        Instruction::Rmv => {
            process.mailbox.remove()?;
            process.receive_deadline = None;
        }
        Instruction::Rwd => process.mailbox.rewind(),
    }
    Ok(None)
}

fn set_ip(process: &mut Process, ip: usize) {
    if let Some(frame) = process.frames.last_mut() {
        frame.ip = ip;
    }
}

fn local_slot(prototype: &Prototype, base: usize, idx: u32) -> Result<usize, RuntimeError> {
    if idx as usize >= prototype.frame_size() {
        return Err(RuntimeError::BadOperand {
            what: "local",
            index: idx as usize,
        });
    }
    Ok(base + idx as usize)
}

fn ret(process: &mut Process, base: usize, prototype: &Prototype) -> Result<Option<Outcome>, RuntimeError> {
    let result = if process.stack.len() > base + prototype.frame_size() {
        process.stack.top().unwrap_or_default()
    } else {
        Value::Nil
    };
    let Some(frame) = process.frames.pop() else {
        return Ok(Some(Outcome::Exit(result)));
    };
    process.stack.truncate(frame.callee_slot);
    if process.frames.is_empty() {
        process.push(result)?;
        return Ok(Some(Outcome::Exit(result)));
    }
    if frame.protected {
        process.push_bool(true)?;
    }
    process.push(result)?;
    Ok(None)
}

/// Call the value sitting below the top `nargs` values.
fn invoke(
    process: &mut Process,
    loader: &Loader,
    nargs: usize,
    protected: bool,
) -> Result<Option<Outcome>, RuntimeError> {
    let len = process.stack.len();
    if nargs >= len {
        return Err(RuntimeError::StackUnderflow {
            requested: nargs + 1,
            size: len,
        });
    }
    let callee_slot = len - nargs - 1;

    match process.stack.slot(callee_slot)? {
        Value::Heap(r) if r.kind == ObjectKind::Closure => {
            process.enter(callee_slot, nargs, protected)?;
            Ok(None)
        }
        Value::Native(id) => {
            let native = loader.native(id).ok_or(RuntimeError::BadOperand {
                what: "native",
                index: id.0 as usize,
            })?;
            if let Some(arity) = native.arity {
                if arity != nargs {
                    return Err(RuntimeError::ArityMismatch {
                        expected: arity,
                        found: nargs,
                    });
                }
            }
            match native.kind {
                NativeKind::ProtectedCall => {
                    if nargs == 0 {
                        return Err(RuntimeError::ArityMismatch {
                            expected: 1,
                            found: 0,
                        });
                    }
                    process.stack.remove_slot(callee_slot)?;
                    let depth = process.frames.len();
                    match invoke(process, loader, nargs - 1, true) {
                        // The call never started, so no protected frame catches this.
                        Err(err) if process.frames.len() == depth => {
                            process.stack.truncate(callee_slot);
                            process.push_bool(false)?;
                            process.push_error(&err);
                            Ok(None)
                        }
                        other => other,
                    }
                }
                NativeKind::Function(f) => {
                    let args: SmallVec<[Value; 8]> = SmallVec::from_slice(&process.stack.as_slice()[callee_slot + 1..]);
                    trace!(native = %native.name, nargs, "native call");
                    let result = if protected {
                        match f(process, &args) {
                            Ok(value) => {
                                process.stack.truncate(callee_slot);
                                process.push_bool(true)?;
                                value
                            }
                            Err(err) => {
                                process.stack.truncate(callee_slot);
                                process.push_bool(false)?;
                                process.push_error(&err);
                                // A failed native leaves no request behind.
                                process.take_request();
                                return Ok(None);
                            }
                        }
                    } else {
                        let value = f(process, &args)?;
                        process.stack.truncate(callee_slot);
                        value
                    };
                    process.push(result)?;
                    Ok(process.take_request().map(|request| match request {
                        Request::Yield => Outcome::Yield,
                        Request::Sleep(delay) => Outcome::Sleep(Instant::now() + delay),
                        Request::Spawn { callee, args } => Outcome::Spawn {
                            callee,
                            args,
                            protected,
                        },
                    }))
                }
            }
        }
        other => Err(RuntimeError::NotCallable(other.type_name())),
    }
}

/// Selective receive. The timeout sits on the stack top.
fn receive(process: &mut Process, ip: usize, disp: i32, len: usize) -> Result<Option<Outcome>, RuntimeError> {
    let timeout = match process.stack.top() {
        Some(Value::Nil) => None,
        Some(Value::Int(ms)) => Some(Duration::from_millis(ms.max(0) as u64)),
        Some(other) => {
            return Err(RuntimeError::TypeMismatch {
                expected: "integer",
                found: other.type_name(),
            })
        }
        None => {
            return Err(RuntimeError::StackUnderflow {
                requested: 1,
                size: 0,
            })
        }
    };
    let target = jump(ip, disp, len)?;

    // The deadline survives non-matching messages; only RMV or the
    // timeout itself ends the receive.
    if let Some(message) = process.mailbox.receive() {
        process.stack.pop(1)?;
        process.push(message)?;
        return Ok(None);
    }

    let now = Instant::now();
    let deadline = match timeout {
        None => None,
        Some(timeout) => Some(*process.receive_deadline.get_or_insert(now + timeout)),
    };
    if deadline.is_some_and(|d| now >= d) {
        trace!(pid = %process.pid(), "receive timed out");
        process.receive_deadline = None;
        process.stack.pop(1)?;
        set_ip(process, target);
        return Ok(None);
    }

    set_ip(process, ip);
    Ok(Some(Outcome::Block { deadline }))
}
