//! Diagnostics shared by the parser, compiler, and VM.
//!
//! Every error carries a primary span `{file, line, column, length}`, a kind
//! tag, a message, and optional help/notes. Rendering beyond `Display` is the
//! CLI's job.

/// Source span of a diagnostic. Lines and columns are 1-indexed for display.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Span {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub length: u32,
}

impl Span {
    pub fn new(file: impl Into<String>, line: u32, column: u32, length: u32) -> Self {
        Span {
            file: file.into(),
            line,
            column,
            length,
        }
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Runtime error taxonomy. Stored on heap `Error` objects so `catch` bodies
/// can observe what went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    ArithmeticOverflow,
    DivisionByZero,
    UndefinedVariable,
    StackOverflow,
    StackUnderflow,
    TypeMismatch,
    IndexOutOfBounds,
    NullDereference,
    ModuleNotFound,
    ImportCycle,
    FileIo,
    Unknown,
}

impl std::fmt::Display for RuntimeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RuntimeErrorKind::ArithmeticOverflow => "arithmetic overflow",
            RuntimeErrorKind::DivisionByZero => "division by zero",
            RuntimeErrorKind::UndefinedVariable => "undefined variable",
            RuntimeErrorKind::StackOverflow => "stack overflow",
            RuntimeErrorKind::StackUnderflow => "stack underflow",
            RuntimeErrorKind::TypeMismatch => "type mismatch",
            RuntimeErrorKind::IndexOutOfBounds => "index out of bounds",
            RuntimeErrorKind::NullDereference => "null dereference",
            RuntimeErrorKind::ModuleNotFound => "module not found",
            RuntimeErrorKind::ImportCycle => "import cycle",
            RuntimeErrorKind::FileIo => "file I/O error",
            RuntimeErrorKind::Unknown => "runtime error",
        };
        f.write_str(name)
    }
}

/// Which phase produced a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Parse,
    Type,
    Name,
    Runtime(RuntimeErrorKind),
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Parse => f.write_str("parse error"),
            ErrorKind::Type => f.write_str("type error"),
            ErrorKind::Name => f.write_str("name error"),
            ErrorKind::Runtime(kind) => write!(f, "runtime error ({})", kind),
        }
    }
}

/// A single reported error.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub kind: ErrorKind,
    pub message: String,
    pub span: Span,
    pub help: Option<String>,
    pub notes: Vec<String>,
}

impl Diagnostic {
    pub fn parse(message: impl Into<String>, span: Span) -> Self {
        Diagnostic {
            kind: ErrorKind::Parse,
            message: message.into(),
            span,
            help: None,
            notes: Vec::new(),
        }
    }

    pub fn type_error(message: impl Into<String>, span: Span) -> Self {
        Diagnostic {
            kind: ErrorKind::Type,
            message: message.into(),
            span,
            help: None,
            notes: Vec::new(),
        }
    }

    pub fn name_error(message: impl Into<String>, span: Span) -> Self {
        Diagnostic {
            kind: ErrorKind::Name,
            message: message.into(),
            span,
            help: None,
            notes: Vec::new(),
        }
    }

    pub fn runtime(kind: RuntimeErrorKind, message: impl Into<String>, span: Span) -> Self {
        Diagnostic {
            kind: ErrorKind::Runtime(kind),
            message: message.into(),
            span,
            help: None,
            notes: Vec::new(),
        }
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}: {}", self.span, self.kind, self.message)?;
        if let Some(ref help) = self.help {
            write!(f, "\n  help: {}", help)?;
        }
        for note in &self.notes {
            write!(f, "\n  note: {}", note)?;
        }
        Ok(())
    }
}

impl std::error::Error for Diagnostic {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_span_and_kind() {
        let diag = Diagnostic::parse(
            "unexpected token ';'",
            Span::new("main.orus", 3, 7, 1),
        );
        let text = diag.to_string();
        assert!(text.contains("main.orus:3:7"));
        assert!(text.contains("parse error"));
        assert!(text.contains("unexpected token"));
    }

    #[test]
    fn help_and_notes_render_on_their_own_lines() {
        let diag = Diagnostic::type_error("operands must match", Span::default())
            .with_help("cast one side with `as`")
            .with_note("left is i32, right is f64");
        let text = diag.to_string();
        assert!(text.contains("help: cast one side"));
        assert!(text.contains("note: left is i32"));
    }
}
