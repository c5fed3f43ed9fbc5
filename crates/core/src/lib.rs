//! Core types for the Orus language
//!
//! This crate holds everything the compiler and the VM share: runtime
//! values and the object heap with its mark-and-sweep collector, bytecode
//! chunks with their cache serialization, the opcode set, the type system,
//! native-function signatures, and diagnostics.

pub mod chunk;
pub mod diag;
pub mod heap;
pub mod natives;
pub mod opcode;
pub mod types;
pub mod value;

pub use chunk::{CHUNK_MAGIC, CHUNK_VERSION, Chunk, Constant};
pub use diag::{Diagnostic, ErrorKind, RuntimeErrorKind, Span};
pub use heap::{ErrorObj, Heap, ObjBody};
pub use opcode::{OpCode, Operands};
pub use types::{FieldDef, StructDef, Type, TypeRegistry};
pub use value::{HeapId, Value};

/// Maximum call-frame depth.
pub const FRAMES_MAX: usize = 64;

/// Maximum nesting of active `try` frames.
pub const TRY_MAX: usize = 16;

/// Number of global slots shared by all code in a process.
pub const GLOBALS_MAX: usize = 256;

/// Number of function-table slots.
pub const FUNCTIONS_MAX: usize = 256;
