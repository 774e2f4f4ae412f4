//! `std-process`: natives that talk to the scheduler.

use std::time::Duration;

use crate::error::RuntimeError;
use crate::loader::Library;
use crate::message::Payload;
use crate::process::{Process, Request};
use crate::value::Value;

use super::integer_arg;

pub fn library() -> Library {
    Library::new("std-process")
        .function("self/0", self_pid)
        .function("yield/0", yield_now)
        .function("sleep/1", sleep)
        .function("spawn", spawn)
        .protected_call("pcall")
}

fn self_pid(process: &mut Process, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Pid(process.pid()))
}

fn yield_now(process: &mut Process, _args: &[Value]) -> Result<Value, RuntimeError> {
    process.request(Request::Yield);
    Ok(Value::Nil)
}

/// Sleep at least the given number of milliseconds.
fn sleep(process: &mut Process, args: &[Value]) -> Result<Value, RuntimeError> {
    let ms = integer_arg(args, 0)?;
    process.request(Request::Sleep(Duration::from_millis(ms.max(0) as u64)));
    Ok(Value::Nil)
}

/// `spawn(callable, args...)`: the pid of the new process replaces the
/// result once the scheduler has created it.
fn spawn(process: &mut Process, args: &[Value]) -> Result<Value, RuntimeError> {
    let (callee, rest) = args.split_first().ok_or(RuntimeError::ArityMismatch {
        expected: 1,
        found: 0,
    })?;
    let callee = Payload::capture(*callee, &process.heap)?;
    let args = rest
        .iter()
        .map(|v| Payload::capture(*v, &process.heap))
        .collect::<Result<Vec<_>, _>>()?;
    process.request(Request::Spawn { callee, args });
    Ok(Value::Nil)
}
