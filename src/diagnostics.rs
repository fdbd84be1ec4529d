use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::{
    native::RegistrationError,
    output::ErrorFormat,
    threads::{FatalError, ManagerError},
    value::Value,
};

/// A location inside a source text. Lines and columns are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    pub offset: usize,
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub const fn new(offset: usize, line: usize, column: usize) -> Self {
        Self {
            offset,
            line,
            column,
        }
    }

    pub const fn start() -> Self {
        Self::new(0, 1, 1)
    }

    /// Moves past `ch`, resetting the column after a newline.
    pub fn advance(&mut self, ch: char) {
        self.offset += ch.len_utf8();
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::start()
    }
}

/// A (start, end) pair of positions within a named source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceSpan {
    pub source: Arc<str>,
    pub start: Position,
    pub end: Position,
}

impl SourceSpan {
    pub fn new(source: Arc<str>, start: Position, end: Position) -> Self {
        Self { source, start, end }
    }

    /// Span used for values and errors produced outside any script text.
    pub fn native() -> Self {
        Self::new(Arc::from("<native>"), Position::start(), Position::start())
    }

    /// Joins two spans of the same source into one covering both.
    pub fn to(&self, other: &SourceSpan) -> SourceSpan {
        SourceSpan {
            source: Arc::clone(&self.source),
            start: self.start,
            end: other.end,
        }
    }

    pub fn len(&self) -> usize {
        self.end.offset.saturating_sub(self.start.offset)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for SourceSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.source, self.start.line, self.start.column
        )
    }
}

/// Classification of a recoverable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    IllegalChar,
    IllegalSyntax,
    UnknownIdentifier,
    IllegalOperation,
    ExpectedChar,
    Interrupted,
    Runtime,
    Stop,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::IllegalChar => "Illegal Character",
            ErrorKind::IllegalSyntax => "Illegal Syntax",
            ErrorKind::UnknownIdentifier => "Unknown Identifier",
            ErrorKind::IllegalOperation => "Illegal Operation",
            ErrorKind::ExpectedChar => "Expected Character",
            ErrorKind::Interrupted => "Interrupted",
            ErrorKind::Runtime => "Runtime Error",
            ErrorKind::Stop => "Stop",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One traceback line: the scope that was unwound and where it was entered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub label: String,
    pub display_name: Arc<str>,
    pub span: Option<SourceSpan>,
}

impl fmt::Display for TraceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.span {
            Some(span) => write!(
                f,
                "File \"{}\", line {}, column {}, in {}",
                self.display_name, span.start.line, span.start.column, self.label
            ),
            None => write!(f, "File \"{}\", in {}", self.display_name, self.label),
        }
    }
}

/// Entries kept at each end of a long rendered traceback.
const TRACE_EDGE: usize = 10;

/// A recoverable failure raised while lexing, parsing or evaluating a script.
#[derive(Debug, Clone)]
pub struct CodeError {
    pub kind: ErrorKind,
    pub message: String,
    pub span: Option<SourceSpan>,
    pub notes: Vec<String>,
    /// Innermost entry first.
    pub traceback: Vec<TraceEntry>,
}

impl CodeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            span: None,
            notes: Vec::new(),
            traceback: Vec::new(),
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, message)
    }

    pub fn illegal_operation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IllegalOperation, message)
    }

    pub fn interrupted() -> Self {
        Self::new(ErrorKind::Interrupted, "execution interrupted")
    }

    pub fn stop() -> Self {
        Self::new(ErrorKind::Stop, String::new())
    }

    pub fn with_span(mut self, span: SourceSpan) -> Self {
        self.span = Some(span);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn push_trace(&mut self, entry: TraceEntry) {
        self.traceback.push(entry);
    }

    /// `Interrupted` and `Stop` unwind a program without being reported.
    pub fn is_silent(&self) -> bool {
        matches!(self.kind, ErrorKind::Interrupted | ErrorKind::Stop)
    }

    /// Renders the traceback (most recent call last) followed by the headline.
    pub fn render(&self, format: &ErrorFormat) -> String {
        if self.kind == ErrorKind::Stop {
            return String::new();
        }
        let mut out = String::new();
        out.push_str(&format.error);
        if !self.traceback.is_empty() {
            out.push_str("Traceback (most recent call last):\n");
            let total = self.traceback.len();
            for (index, entry) in self.traceback.iter().rev().enumerate() {
                if total > 2 * TRACE_EDGE && index >= TRACE_EDGE && index < total - TRACE_EDGE {
                    if index == TRACE_EDGE {
                        let hidden = total - 2 * TRACE_EDGE;
                        out.push_str(&format!("  ... {hidden} more entries ...\n"));
                    }
                    continue;
                }
                out.push_str("  ");
                out.push_str(&entry.to_string());
                out.push('\n');
            }
        }
        out.push_str(&format.highlight);
        out.push_str(self.kind.name());
        out.push_str(&format.reset);
        out.push_str(&format.error);
        out.push_str(": ");
        out.push_str(&self.message);
        if let Some(span) = &self.span {
            out.push_str(&format!("\n  at {span}"));
        }
        for note in &self.notes {
            out.push_str(&format!("\n  note: {note}"));
        }
        out.push_str(&format.reset);
        out
    }
}

impl fmt::Display for CodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(span) = &self.span {
            write!(f, " ({span})")?;
        }
        for note in &self.notes {
            write!(f, "\n  note: {note}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CodeError {}

/// Non-error unwind events used for non-local control flow.
#[derive(Debug, Clone)]
pub enum ControlSignal {
    Break(SourceSpan),
    Continue(SourceSpan),
    Return(Value, SourceSpan),
}

impl ControlSignal {
    /// Rewrites a signal that escaped every loop and call boundary.
    pub fn into_error(self) -> CodeError {
        match self {
            ControlSignal::Break(span) => {
                CodeError::illegal_operation("`break` outside loop").with_span(span)
            }
            ControlSignal::Continue(span) => {
                CodeError::illegal_operation("`continue` outside loop").with_span(span)
            }
            ControlSignal::Return(_, span) => {
                CodeError::illegal_operation("cannot return outside function").with_span(span)
            }
        }
    }
}

/// Everything that can unwind out of node evaluation.
#[derive(Debug, Clone)]
pub enum Unwind {
    Error(CodeError),
    Signal(ControlSignal),
}

impl Unwind {
    pub fn into_error(self) -> CodeError {
        match self {
            Unwind::Error(error) => error,
            Unwind::Signal(signal) => signal.into_error(),
        }
    }
}

impl From<CodeError> for Unwind {
    fn from(error: CodeError) -> Self {
        Unwind::Error(error)
    }
}

pub type EvalResult<T> = std::result::Result<T, Unwind>;

/// Unified error type for the quill runtime.
#[derive(Debug, Error)]
pub enum QuillError {
    #[error("{0}")]
    Code(#[from] CodeError),
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error(transparent)]
    Fatal(#[from] FatalError),
    #[error("invalid lexer rule: {0}")]
    Pattern(#[from] regex::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, QuillError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn span(line: usize, column: usize) -> SourceSpan {
        let start = Position::new(0, line, column);
        SourceSpan::new(Arc::from("main"), start, start)
    }

    #[test]
    fn position_resets_column_on_newline() {
        let mut pos = Position::start();
        for ch in "ab\nc".chars() {
            pos.advance(ch);
        }
        assert_eq!(pos, Position::new(4, 2, 2));
    }

    #[test]
    fn render_lists_outermost_scope_first() {
        let mut error = CodeError::runtime("boom").with_span(span(3, 7));
        error.push_trace(TraceEntry {
            label: "function inner".into(),
            display_name: Arc::from("main"),
            span: Some(span(2, 1)),
        });
        error.push_trace(TraceEntry {
            label: "<program>".into(),
            display_name: Arc::from("main"),
            span: None,
        });
        let text = error.render(&ErrorFormat::plain());
        let program = text.find("<program>").unwrap();
        let inner = text.find("function inner").unwrap();
        assert!(program < inner, "{text}");
        assert!(text.contains("Runtime Error: boom"), "{text}");
        assert!(text.contains("at main:3:7"), "{text}");
    }

    #[test]
    fn stop_renders_nothing() {
        assert_eq!(CodeError::stop().render(&ErrorFormat::ansi()), "");
        assert!(CodeError::stop().is_silent());
        assert!(CodeError::interrupted().is_silent());
    }

    #[test]
    fn escaped_signals_become_illegal_operations() {
        let error = ControlSignal::Return(Value::null(), span(1, 1)).into_error();
        assert_eq!(error.kind, ErrorKind::IllegalOperation);
        assert!(error.message.contains("cannot return outside function"));
        let error = ControlSignal::Break(span(1, 1)).into_error();
        assert_eq!(error.kind, ErrorKind::IllegalOperation);
    }

    #[test]
    fn long_tracebacks_are_elided_in_the_middle() {
        let mut error = CodeError::runtime("deep");
        for depth in 0..50 {
            error.push_trace(TraceEntry {
                label: format!("frame {depth}"),
                display_name: Arc::from("main"),
                span: None,
            });
        }
        let text = error.render(&ErrorFormat::plain());
        assert!(text.contains("... 30 more entries ..."), "{text}");
        assert!(text.contains("in frame 49\n"));
        assert!(text.contains("in frame 0\n"));
        assert!(!text.contains("in frame 25\n"));
    }
}
