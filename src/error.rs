//! Error taxonomy for the native call engine
//!
//! Recoverable failures are `NfiError` values. Engine invariant violations
//! (over-releasing a closure, retaining a dead one) are panics instead.

use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, NfiError>;

/// Errors surfaced to callers of the engine
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NfiError {
    /// Caller supplied a different number of arguments than the signature declares
    #[error("arity error: expected {expected} arguments, got {actual}")]
    Arity { expected: usize, actual: usize },

    /// A value cannot be marshalled as the declared native type
    #[error("unsupported type: cannot convert {found} to {expected}")]
    UnsupportedType { expected: String, found: String },

    /// Signature mixes incompatible types or uses a type in an invalid position
    #[error("invalid signature: {0}")]
    SignatureConstruction(String),

    /// Signature cannot be used in the requested call direction
    #[error("signature {signature} cannot be called {direction}")]
    InvalidCallDirection {
        signature: String,
        direction: &'static str,
    },

    #[error("library not found: {name}: {reason}")]
    LibraryNotFound { name: String, reason: String },

    #[error("symbol not found: {name}")]
    SymbolNotFound { name: String },

    /// Native code handed back a handle the context never issued or already released
    #[error("unknown object handle {0:#x}")]
    UnknownObjectHandle(usize),

    /// Native code called a trampoline whose managed side is gone
    #[error("closure at {0:#x} is no longer alive")]
    DeadClosure(usize),

    #[error("native context has been disposed")]
    Disposed,

    /// Call-interface preparation or closure allocation failed in the backend
    #[error("native backend error: {0}")]
    Backend(String),

    /// Error raised by a managed callable
    #[error("managed callable failed: {0}")]
    Managed(String),
}

impl NfiError {
    /// Shorthand for an `UnsupportedType` error
    pub fn unsupported(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::UnsupportedType {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Shorthand for a `SignatureConstruction` error
    pub fn invalid_signature(msg: impl Into<String>) -> Self {
        Self::SignatureConstruction(msg.into())
    }

    /// Non-zero status reported to native callers for this error
    pub fn status_code(&self) -> i32 {
        match self {
            Self::Arity { .. } => 1,
            Self::UnsupportedType { .. } => 2,
            Self::SignatureConstruction(_) | Self::InvalidCallDirection { .. } => 3,
            Self::LibraryNotFound { .. } | Self::SymbolNotFound { .. } => 4,
            Self::UnknownObjectHandle(_) => 5,
            Self::DeadClosure(_) => 6,
            Self::Disposed => 7,
            Self::Backend(_) => 8,
            Self::Managed(_) => 9,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}
