//! # Diagnostic Rendering
//!
//! Turns a [`CompilerError`] into the text shown to a user:
//!
//! ```text
//! main.snap:2:9: error: use of unresolved identifier: `b'
//!     let c = b
//!             ^
//! ```
//!
//! Internal compiler errors render with their own level so they can be told
//! apart from errors in user code.

use std::fmt;

use crate::error::CompilerError;
use crate::source::{SourceFile, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiagnosticLevel {
    /// Internal compiler error
    Ice,
    Error,
}

impl fmt::Display for DiagnosticLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticLevel::Ice => write!(f, "internal compiler error"),
            DiagnosticLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub message: String,
    pub span: Option<Span>,
}

impl From<&CompilerError> for Diagnostic {
    fn from(error: &CompilerError) -> Self {
        Self {
            level: if error.is_internal() {
                DiagnosticLevel::Ice
            } else {
                DiagnosticLevel::Error
            },
            message: error.message().to_string(),
            span: error.span(),
        }
    }
}

impl Diagnostic {
    /// Render against the file the error's span points into
    pub fn render(&self, file: &SourceFile) -> String {
        let Some(span) = self.span else {
            return format!("{}: {}: {}", file.name, self.level, self.message);
        };
        let location = file.location(span.start);
        let mut out = format!(
            "{}:{}:{}: {}: {}",
            file.name, location.line, location.column, self.level, self.message
        );
        if let Some(line) = file.line(location.line) {
            let width = span.len().clamp(1, line.len().saturating_sub(location.column - 1).max(1));
            out.push('\n');
            out.push_str(line);
            out.push('\n');
            out.push_str(&" ".repeat(location.column - 1));
            out.push_str(&"^".repeat(width));
        }
        out
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.level, self.message)
    }
}
