//! The interpreter façade
//!
//! [`Interpreter`] is an explicit value holding everything that was a
//! process-wide singleton in older designs: the compilation session (global,
//! function, and type tables), the object heap, global value slots, loaded
//! chunks and modules, and the interned strings materialized from constant
//! pools. Tests can instantiate as many independent interpreters as they
//! like.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use orus_core::chunk::Chunk;
use orus_core::diag::Diagnostic;
use orus_core::heap::Heap;
use orus_core::value::{HeapId, Value};
use orus_core::GLOBALS_MAX;
use orusc::{CompileOptions, Session, compile, parse, use_paths};

use crate::modules::ModuleLoader;

/// Which execution backend interprets chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    #[default]
    Stack,
    /// Register backend; chunks it cannot lower fall back to the stack VM.
    Register,
}

/// Where `print` output goes. Tests capture with a buffer.
pub enum OutputSink {
    Stdout,
    Buffer(Vec<u8>),
}

impl OutputSink {
    pub fn write_line(&mut self, text: &str) {
        match self {
            OutputSink::Stdout => {
                let stdout = std::io::stdout();
                let mut lock = stdout.lock();
                let _ = writeln!(lock, "{}", text);
                let _ = lock.flush();
            }
            OutputSink::Buffer(buffer) => {
                buffer.extend_from_slice(text.as_bytes());
                buffer.push(b'\n');
            }
        }
    }
}

/// Result of a failed `interpret` call, split by phase for exit codes.
#[derive(Debug)]
pub enum InterpretError {
    Compile(Vec<Diagnostic>),
    Runtime(Diagnostic),
}

impl std::fmt::Display for InterpretError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterpretError::Compile(diagnostics) => {
                for (index, diag) in diagnostics.iter().enumerate() {
                    if index > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}", diag)?;
                }
                Ok(())
            }
            InterpretError::Runtime(diag) => write!(f, "{}", diag),
        }
    }
}

impl std::error::Error for InterpretError {}

/// A running Orus interpreter.
pub struct Interpreter {
    pub(crate) session: Session,
    pub(crate) heap: Heap,
    pub(crate) globals: Vec<Value>,
    pub(crate) globals_defined: Vec<bool>,
    pub(crate) chunks: Vec<Chunk>,
    pub(crate) chunk_files: Vec<String>,
    pub(crate) loader: ModuleLoader,
    pub(crate) intern: HashMap<String, HeapId>,
    pub(crate) last_error: Option<Value>,
    pub(crate) backend: Backend,
    pub(crate) trace: bool,
    pub(crate) output: OutputSink,
}

impl Default for Interpreter {
    fn default() -> Self {
        Interpreter::new()
    }
}

impl Interpreter {
    pub fn new() -> Self {
        Interpreter {
            session: Session::new(),
            heap: Heap::new(),
            globals: vec![Value::Nil; GLOBALS_MAX],
            globals_defined: vec![false; GLOBALS_MAX],
            chunks: Vec::new(),
            chunk_files: Vec::new(),
            loader: ModuleLoader::new(),
            intern: HashMap::new(),
            last_error: None,
            backend: Backend::Stack,
            trace: false,
            output: OutputSink::Stdout,
        }
    }

    /// Capture output into an internal buffer instead of stdout.
    pub fn with_buffered_output(mut self) -> Self {
        self.output = OutputSink::Buffer(Vec::new());
        self
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    pub fn set_std_path(&mut self, path: Option<PathBuf>) {
        self.loader.std_path = path;
    }

    pub fn set_cache_path(&mut self, path: Option<PathBuf>) {
        self.loader.cache_path = path;
    }

    /// Captured output so far (buffered sink only).
    pub fn output_text(&self) -> String {
        match &self.output {
            OutputSink::Buffer(buffer) => String::from_utf8_lossy(buffer).into_owned(),
            OutputSink::Stdout => String::new(),
        }
    }

    pub fn take_output(&mut self) -> String {
        match &mut self.output {
            OutputSink::Buffer(buffer) => {
                String::from_utf8_lossy(&std::mem::take(buffer)).into_owned()
            }
            OutputSink::Stdout => String::new(),
        }
    }

    /// Compile and run a program. `path` names the source for diagnostics
    /// and module resolution.
    pub fn interpret(&mut self, source: &str, path: &str) -> Result<(), InterpretError> {
        self.interpret_with(source, path, false)
    }

    /// REPL entry point: a bare expression statement prints its value.
    pub fn interpret_repl(&mut self, source: &str) -> Result<(), InterpretError> {
        self.interpret_with(source, "<repl>", true)
    }

    fn interpret_with(
        &mut self,
        source: &str,
        path: &str,
        repl: bool,
    ) -> Result<(), InterpretError> {
        let program = parse(source, path).map_err(InterpretError::Compile)?;

        // Imports are loaded (and recursively compiled) before the entry
        // program compiles against their exports.
        for module_path in use_paths(&program) {
            self.compile_module(&module_path)
                .map_err(|diag| InterpretError::Compile(vec![diag]))?;
        }
        let imports = self.loader.import_map();

        let chunk_id = self.chunks.len() as u16;
        let opts = CompileOptions {
            file: path,
            module_name: None,
            chunk_id,
            repl,
        };
        let unit = compile(&program, &opts, &mut self.session, &imports)
            .map_err(InterpretError::Compile)?;
        self.chunks.push(unit.chunk);
        self.chunk_files.push(path.to_string());

        self.run_chunk(chunk_id).map_err(InterpretError::Runtime)
    }

    /// Values the collector must treat as roots besides the VM stack.
    pub(crate) fn persistent_roots(&self) -> Vec<Value> {
        let mut roots: Vec<Value> = Vec::with_capacity(self.globals.len() + self.intern.len() + 1);
        for (value, defined) in self.globals.iter().zip(&self.globals_defined) {
            if *defined {
                roots.push(*value);
            }
        }
        roots.extend(self.intern.values().map(|id| Value::Str(*id)));
        if let Some(err) = self.last_error {
            roots.push(err);
        }
        roots
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn independent_interpreters_do_not_share_state() {
        let mut a = Interpreter::new().with_buffered_output();
        let mut b = Interpreter::new().with_buffered_output();
        a.interpret("static x = 1\nprint(x)", "a.orus").unwrap();
        let err = b.interpret("print(x)", "b.orus").unwrap_err();
        assert!(matches!(err, InterpretError::Compile(_)));
    }

    #[test]
    fn repl_session_keeps_globals() {
        let mut interp = Interpreter::new().with_buffered_output();
        interp.interpret_repl("let x = 21").unwrap();
        interp.interpret_repl("x * 2").unwrap();
        assert_eq!(interp.take_output(), "42\n");
    }

    #[test]
    fn compile_errors_are_reported_not_run() {
        let mut interp = Interpreter::new().with_buffered_output();
        let err = interp.interpret("print(undefined_name)", "t.orus").unwrap_err();
        match err {
            InterpretError::Compile(diags) => {
                assert!(diags[0].to_string().contains("undefined"));
            }
            other => panic!("expected compile error, got {:?}", other),
        }
        assert_eq!(interp.output_text(), "");
    }
}
