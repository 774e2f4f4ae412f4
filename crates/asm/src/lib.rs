//! Strand assembler
//!
//! Builds bytecode modules one prototype at a time and converts them to and
//! from the binary chunk format:
//! - `StringTable` interns every symbol, source name and string constant
//! - `Assembler` edits a prototype tree through a cursor
//! - `chunk` writes and reads the serialized form

pub mod assembler;
pub mod chunk;
pub mod string_table;

pub use assembler::{AsmConstant, AsmError, AsmImport, AsmPrototype, Assembler, MAX_NESTED_LEVEL};
pub use chunk::{CHUNK_MAGIC, CHUNK_VERSION};
pub use string_table::{StringRef, StringTable};
