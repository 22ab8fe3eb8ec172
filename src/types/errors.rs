//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context. Compilation issues are deliberately NOT
//! part of this enum: they are aggregated into a `CompilationResult` and never
//! surface at runtime.

use std::time::Duration;
use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Handler error classification used by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// May succeed on retry (network hiccup, rate limit).
    Transient,
    /// Will not succeed on retry (bad input, contract violation).
    Permanent,
}

/// LLM port failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmErrorKind {
    Timeout,
    RateLimited,
    InvalidRequest,
    ServerError,
}

impl LlmErrorKind {
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            LlmErrorKind::Timeout | LlmErrorKind::RateLimited | LlmErrorKind::ServerError
        )
    }
}

/// Main error enum for the execution core.
#[derive(Error, Debug)]
pub enum Error {
    /// Structural validation failure outside the compiler (bad registry use,
    /// malformed handle references at runtime).
    #[error("validation error: {0}")]
    Validation(String),

    /// Resource not found (unknown execution, diagram, node, person).
    #[error("not found: {0}")]
    NotFound(String),

    /// Handler-reported failure with a retry classification.
    #[error("handler error: {message}")]
    Handler { class: ErrorClass, message: String },

    /// Input-resolver transform precondition failure.
    #[error("transform error: {0}")]
    Transform(String),

    /// Spread packing collided with an already-bound input key.
    #[error("input collision on key '{0}'")]
    InputCollision(String),

    /// A required input port has no bound value and no default.
    #[error("missing required input '{0}'")]
    MissingRequiredInput(String),

    /// Internal invariant violation (invalid status transition, duplicate
    /// sequence). Fatal to the execution.
    #[error("execution error: {0}")]
    Execution(String),

    /// LLM port failure.
    #[error("llm error ({kind:?}): {message}")]
    Llm { kind: LlmErrorKind, message: String },

    /// Handler exceeded its configured timeout.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Cancellation request observed.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors (FileStore adapters).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the retry policy may reschedule a node failing with this error.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Handler { class, .. } => *class == ErrorClass::Transient,
            Error::Llm { kind, .. } => kind.is_transient(),
            Error::Timeout(_) => true,
            Error::Io(_) => true,
            _ => false,
        }
    }

    /// Short machine-readable kind for event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::NotFound(_) => "not_found",
            Error::Handler { .. } => "handler",
            Error::Transform(_) => "transform",
            Error::InputCollision(_) => "input_collision",
            Error::MissingRequiredInput(_) => "missing_required_input",
            Error::Execution(_) => "execution",
            Error::Llm { .. } => "llm",
            Error::Timeout(_) => "timeout",
            Error::Cancelled(_) => "cancelled",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
        }
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Handler {
            class: ErrorClass::Transient,
            message: msg.into(),
        }
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Handler {
            class: ErrorClass::Permanent,
            message: msg.into(),
        }
    }

    pub fn transform(msg: impl Into<String>) -> Self {
        Self::Transform(msg.into())
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn llm(kind: LlmErrorKind, msg: impl Into<String>) -> Self {
        Self::Llm {
            kind,
            message: msg.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::transient("busy").is_transient());
        assert!(!Error::permanent("bad input").is_transient());
        assert!(Error::llm(LlmErrorKind::RateLimited, "slow down").is_transient());
        assert!(!Error::llm(LlmErrorKind::InvalidRequest, "bad schema").is_transient());
        assert!(Error::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!Error::execution("duplicate seq").is_transient());
    }

    #[test]
    fn kind_is_stable() {
        assert_eq!(Error::transform("x").kind(), "transform");
        assert_eq!(Error::MissingRequiredInput("a".into()).kind(), "missing_required_input");
    }
}
