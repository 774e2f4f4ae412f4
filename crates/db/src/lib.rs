//! Strand debug server
//!
//! Inspection boundary for a running VM:
//! - `encode_modules` renders the loader's chunks as JSON
//! - `router` serves modules and lifecycle counters over HTTP; `DebugServer`
//!   binds it to a socket
//! - `DebugObserver` forwards scheduler and loader events to the server

pub mod encode;
pub mod observer;
pub mod server;

pub use encode::{encode_instruction, encode_modules};
pub use observer::{DebugEvent, DebugObserver};
pub use server::{router, DbConfig, DebugServer, DebugState, DebugStats};
