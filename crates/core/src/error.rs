//! Error taxonomy for the Sable runtime
//!
//! Every user-visible error carries a phase (read/analyze/eval), a kind,
//! a message, and optionally a source position and a data map (the ex-data
//! of ex-info values). Reader and analyzer errors are bounded to a source
//! position; runtime errors may accumulate a frame trace as they unwind.

use crate::value::Value;
use std::fmt;

/// Which stage of the pipeline produced the error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Read,
    Analyze,
    Eval,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Read => write!(f, "read"),
            Phase::Analyze => write!(f, "analyze"),
            Phase::Eval => write!(f, "eval"),
        }
    }
}

/// Error kind, used for catch-by-class matching and exit reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Arity,
    Type,
    Value,
    Index,
    Compile,
    Reader,
    Unbound,
    Io,
    StmRetryExhausted,
    Interrupted,
    /// Internal STM conflict signal; consumed by the transaction loop and
    /// never surfaced to user code
    StmRetry,
}

impl ErrorKind {
    /// Host class name used by `catch` clauses
    pub fn class_name(&self) -> &'static str {
        match self {
            ErrorKind::Arity => "ArityException",
            ErrorKind::Type => "ClassCastException",
            ErrorKind::Value => "IllegalArgumentException",
            ErrorKind::Index => "IndexOutOfBoundsException",
            ErrorKind::Compile => "CompilerException",
            ErrorKind::Reader => "ReaderException",
            ErrorKind::Unbound => "IllegalStateException",
            ErrorKind::Io => "IOException",
            ErrorKind::StmRetryExhausted => "TransactionFailedException",
            ErrorKind::Interrupted => "InterruptedException",
            ErrorKind::StmRetry => "RetryException",
        }
    }

    pub fn keyword_name(&self) -> &'static str {
        match self {
            ErrorKind::Arity => "arity_error",
            ErrorKind::Type => "type_error",
            ErrorKind::Value => "value_error",
            ErrorKind::Index => "index_error",
            ErrorKind::Compile => "compile_error",
            ErrorKind::Reader => "reader_error",
            ErrorKind::Unbound => "unbound_error",
            ErrorKind::Io => "io_error",
            ErrorKind::StmRetryExhausted => "stm_retry_exhausted",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::StmRetry => "stm_retry",
        }
    }
}

/// Source position of the offending character or form (0-indexed internally,
/// displayed 1-indexed)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourcePos {
    pub line: usize,
    pub column: usize,
}

impl SourcePos {
    pub fn new(line: usize, column: usize) -> Self {
        SourcePos { line, column }
    }
}

impl fmt::Display for SourcePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line + 1, self.column + 1)
    }
}

/// The one error type threaded through reader, analyzer, compiler, and VM
#[derive(Debug, Clone)]
pub struct SableError {
    pub phase: Phase,
    pub kind: ErrorKind,
    pub message: String,
    pub pos: Option<SourcePos>,
    /// ex-data of ex-info values
    pub data: Option<Value>,
    /// The thrown user value, when the error originated from `throw`
    pub payload: Option<Value>,
    /// Frame source positions accumulated while unwinding the VM
    pub trace: Vec<String>,
}

impl SableError {
    pub fn new(phase: Phase, kind: ErrorKind, message: impl Into<String>) -> Self {
        SableError {
            phase,
            kind,
            message: message.into(),
            pos: None,
            data: None,
            payload: None,
            trace: Vec::new(),
        }
    }

    pub fn with_pos(mut self, pos: SourcePos) -> Self {
        self.pos = Some(pos);
        self
    }

    pub fn reader(message: impl Into<String>, pos: SourcePos) -> Self {
        SableError::new(Phase::Read, ErrorKind::Reader, message).with_pos(pos)
    }

    pub fn compile(message: impl Into<String>) -> Self {
        SableError::new(Phase::Analyze, ErrorKind::Compile, message)
    }

    pub fn compile_at(message: impl Into<String>, pos: Option<SourcePos>) -> Self {
        let mut e = SableError::new(Phase::Analyze, ErrorKind::Compile, message);
        e.pos = pos;
        e
    }

    pub fn arity(fn_name: &str, got: usize) -> Self {
        SableError::new(
            Phase::Eval,
            ErrorKind::Arity,
            format!("wrong number of args ({}) passed to {}", got, fn_name),
        )
    }

    pub fn type_err(message: impl Into<String>) -> Self {
        SableError::new(Phase::Eval, ErrorKind::Type, message)
    }

    pub fn value_err(message: impl Into<String>) -> Self {
        SableError::new(Phase::Eval, ErrorKind::Value, message)
    }

    pub fn index(message: impl Into<String>) -> Self {
        SableError::new(Phase::Eval, ErrorKind::Index, message)
    }

    pub fn unbound(message: impl Into<String>) -> Self {
        SableError::new(Phase::Eval, ErrorKind::Unbound, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        SableError::new(Phase::Eval, ErrorKind::Io, message)
    }

    pub fn interrupted() -> Self {
        SableError::new(Phase::Eval, ErrorKind::Interrupted, "execution interrupted")
    }

    /// An error carrying a thrown user value (from `throw` / `ex-info`)
    pub fn thrown(message: String, data: Option<Value>, payload: Value) -> Self {
        let mut e = SableError::new(Phase::Eval, ErrorKind::Value, message);
        e.data = data;
        e.payload = Some(payload);
        e
    }

    pub fn push_frame(&mut self, frame: String) {
        self.trace.push(frame);
    }

    /// Format the trace for top-level stderr reporting
    pub fn format_trace(&self) -> String {
        let mut out = String::new();
        for frame in &self.trace {
            out.push_str("\tat ");
            out.push_str(frame);
            out.push('\n');
        }
        out
    }
}

impl fmt::Display for SableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pos {
            Some(pos) => write!(f, "{} error at {}: {}", self.phase, pos, self.message),
            None => write!(f, "{} error: {}", self.phase, self.message),
        }
    }
}

impl std::error::Error for SableError {}

impl From<std::io::Error> for SableError {
    fn from(e: std::io::Error) -> Self {
        SableError::io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_position() {
        let e = SableError::reader("unexpected EOF", SourcePos::new(2, 4));
        assert_eq!(e.to_string(), "read error at 3:5: unexpected EOF");
    }

    #[test]
    fn test_display_without_position() {
        let e = SableError::arity("inc", 3);
        assert_eq!(e.to_string(), "eval error: wrong number of args (3) passed to inc");
        assert_eq!(e.kind, ErrorKind::Arity);
    }

    #[test]
    fn test_class_names_cover_kinds() {
        assert_eq!(ErrorKind::Arity.class_name(), "ArityException");
        assert_eq!(ErrorKind::StmRetryExhausted.keyword_name(), "stm_retry_exhausted");
    }
}
