//! Orus runtime library
//!
//! Executes bytecode produced by `orus-compiler`: a stack-based VM with
//! call frames and try/catch unwinding, an alternative register backend, a
//! native function table, and a module loader with cycle detection and a
//! bytecode cache. The [`Interpreter`] type ties it all together and is what
//! the `orus` binary (and embedding tests) drive.

pub mod config;
pub mod interpreter;
pub mod modules;
pub mod natives;
pub mod regvm;
pub mod vm;

pub use config::RuntimeConfig;
pub use interpreter::{Backend, Interpreter, InterpretError};
pub use modules::{Module, ModuleLoader};
