// File: src/errors.rs
//
// Structured error reporting for lumen: compile-time diagnostics collected
// during a panic-mode-recovering parse, and runtime errors raised during
// execution, both rendered with `colored` the way a terminal compiler would.

use colored::Colorize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Compile,
    Runtime,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Compile => write!(f, "Compile Error"),
            ErrorKind::Runtime => write!(f, "Runtime Error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation {
    pub line: u32,
}

impl SourceLocation {
    pub fn new(line: u32) -> Self {
        Self { line }
    }

    pub fn unknown() -> Self {
        Self { line: 0 }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}", self.line)
    }
}

/// One frame of a runtime stack trace, innermost first.
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub function_name: String,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub struct LumenError {
    pub kind: ErrorKind,
    pub message: String,
    pub location: SourceLocation,
    pub lexeme: Option<String>,
    pub trace: Vec<TraceFrame>,
}

impl LumenError {
    pub fn compile(message: impl Into<String>, location: SourceLocation) -> Self {
        Self { kind: ErrorKind::Compile, message: message.into(), location, lexeme: None, trace: Vec::new() }
    }

    pub fn compile_at(message: impl Into<String>, location: SourceLocation, lexeme: &str) -> Self {
        Self {
            kind: ErrorKind::Compile,
            message: message.into(),
            location,
            lexeme: Some(lexeme.to_string()),
            trace: Vec::new(),
        }
    }

    pub fn runtime(message: impl Into<String>, location: SourceLocation) -> Self {
        Self { kind: ErrorKind::Runtime, message: message.into(), location, lexeme: None, trace: Vec::new() }
    }

    pub fn with_trace(mut self, trace: Vec<TraceFrame>) -> Self {
        self.trace = trace;
        self
    }
}

impl fmt::Display for LumenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header = format!("{}", self.kind);
        write!(f, "{}", header.red().bold())?;
        write!(f, ": {}", self.message)?;
        if let Some(ref lex) = self.lexeme {
            write!(f, " (at '{}')", lex)?;
        }
        writeln!(f, " [{}]", self.location)?;
        for frame in &self.trace {
            writeln!(f, "  {} [line {}] in {}", "at".bright_blue(), frame.line, frame.function_name)?;
        }
        Ok(())
    }
}

impl std::error::Error for LumenError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Ok = 0,
    CompileError = 65,
    RuntimeError = 70,
}
