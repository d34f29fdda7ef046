//! # Compiler Error Types
//!
//! Every failure raised while checking or lowering a Snap tree is a
//! [`CompilerError`]. Each carries a human-readable message and the source
//! anchor of the offending node when one is known. Errors are fatal to the
//! current compilation unit and are never recovered between passes.

use crate::source::Span;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompilerError {
    /// An identifier is not bound anywhere in the active scope chain
    #[error("{message}")]
    UnresolvedIdentifier { message: String, span: Option<Span> },

    /// A type name is not bound anywhere in the active scope chain
    #[error("{message}")]
    UnresolvedType { message: String, span: Option<Span> },

    /// A declaration, import or instantiation collides with an existing binding
    #[error("{message}")]
    Redefinition { message: String, span: Option<Span> },

    /// An operand, argument, return value, union member or cast target failed
    /// the convertibility check
    #[error("{message}")]
    TypeMismatch { message: String, span: Option<Span> },

    /// A node has a shape the compiler cannot accept in this position
    #[error("{message}")]
    Structural { message: String, span: Option<Span> },

    /// A pass invariant was violated
    #[error("internal compiler error: {message}")]
    Internal { message: String, span: Option<Span> },
}

impl CompilerError {
    pub fn unresolved_identifier(identifier: impl std::fmt::Display, span: Option<Span>) -> Self {
        Self::UnresolvedIdentifier {
            message: format!("use of unresolved identifier: `{}'", identifier),
            span,
        }
    }

    pub fn unresolved_type(identifier: impl std::fmt::Display, span: Option<Span>) -> Self {
        Self::UnresolvedType {
            message: format!("use of undeclared type `{}'", identifier),
            span,
        }
    }

    pub fn redefinition(message: impl Into<String>, span: Option<Span>) -> Self {
        Self::Redefinition {
            message: message.into(),
            span,
        }
    }

    pub fn type_mismatch(message: impl Into<String>, span: Option<Span>) -> Self {
        Self::TypeMismatch {
            message: message.into(),
            span,
        }
    }

    pub fn structural(message: impl Into<String>, span: Option<Span>) -> Self {
        Self::Structural {
            message: message.into(),
            span,
        }
    }

    pub fn internal(message: impl Into<String>, span: Option<Span>) -> Self {
        Self::Internal {
            message: message.into(),
            span,
        }
    }

    pub fn span(&self) -> Option<Span> {
        match self {
            CompilerError::UnresolvedIdentifier { span, .. }
            | CompilerError::UnresolvedType { span, .. }
            | CompilerError::Redefinition { span, .. }
            | CompilerError::TypeMismatch { span, .. }
            | CompilerError::Structural { span, .. }
            | CompilerError::Internal { span, .. } => *span,
        }
    }

    /// Message without the internal-compiler-error prefix
    pub fn message(&self) -> &str {
        match self {
            CompilerError::UnresolvedIdentifier { message, .. }
            | CompilerError::UnresolvedType { message, .. }
            | CompilerError::Redefinition { message, .. }
            | CompilerError::TypeMismatch { message, .. }
            | CompilerError::Structural { message, .. }
            | CompilerError::Internal { message, .. } => message,
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, CompilerError::Internal { .. })
    }

    /// Attach an anchor if the error does not carry one yet
    pub fn or_span(mut self, fallback: Option<Span>) -> Self {
        let slot = match &mut self {
            CompilerError::UnresolvedIdentifier { span, .. }
            | CompilerError::UnresolvedType { span, .. }
            | CompilerError::Redefinition { span, .. }
            | CompilerError::TypeMismatch { span, .. }
            | CompilerError::Structural { span, .. }
            | CompilerError::Internal { span, .. } => span,
        };
        if slot.is_none() {
            *slot = fallback;
        }
        self
    }
}

pub type CompilerResult<T> = Result<T, CompilerError>;
