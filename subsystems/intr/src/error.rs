//! # Error Handling
//!
//! Error taxonomy for the interrupt dispatcher. Registration, removal, and
//! binding errors are returned to the calling driver; dispatch-path errors
//! are either absorbed (stray interrupts) or fatal (invariant violations,
//! which panic rather than propagate because the safety invariants have
//! already been broken by the time they are observed).

use core::fmt;

/// Classification of dispatcher errors visible to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed registration, missing callbacks, or a bad CPU id.
    InvalidArgument,

    /// Destroy requested while handlers remain registered.
    Busy,

    /// CPU binding is unavailable for this event.
    Unsupported,

    /// Privilege check failed for an affinity change.
    PermissionDenied,

    /// A bounded name or description no longer fits its budget.
    OutOfSpace,

    /// The referenced event or handler no longer exists.
    NotFound,
}

impl ErrorKind {
    /// Stable short name for diagnostics.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::Busy => "busy",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::OutOfSpace => "out of space",
            ErrorKind::NotFound => "not found",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An interrupt-dispatcher error: a kind plus a static message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntrError {
    kind: ErrorKind,
    message: &'static str,
}

impl IntrError {
    /// Create a new error with kind and message.
    pub const fn new(kind: ErrorKind, message: &'static str) -> Self {
        Self { kind, message }
    }

    /// Create an error from a kind with its default message.
    pub const fn from_kind(kind: ErrorKind) -> Self {
        Self::new(kind, kind.as_str())
    }

    /// Get the error kind.
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the message.
    pub const fn message(&self) -> &'static str {
        self.message
    }
}

impl fmt::Display for IntrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

/// Result type for dispatcher operations.
pub type IntrResult<T> = Result<T, IntrError>;
