//! Error taxonomy shared across the runtime
//!
//! Handler failures are classified so the message processor can translate
//! them deterministically into ack/nak/term/DLQ decisions:
//! - `Unrecoverable`: programming or validation errors; never retried
//! - `Transient`: timeouts and temporary I/O; retried with short backoff
//! - `Failed`: everything else; retried until delivery limits, then
//!   dead-lettered

use thiserror::Error;

/// Envelope codec errors.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed payload: {message}")]
    MalformedPayload { message: String },

    #[error("serialization error: {message}")]
    Serialization { message: String },
}

/// Classified handler failure.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    #[error("unrecoverable: {message}")]
    Unrecoverable { message: String },

    #[error("transient: {message}")]
    Transient { message: String },

    #[error("{message}")]
    Failed { message: String },
}

impl HandlerError {
    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self::Unrecoverable {
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Unrecoverable { .. })
    }

    /// Stable class label used in DLQ envelopes and logs.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Unrecoverable { .. } => "unrecoverable",
            Self::Transient { .. } => "transient",
            Self::Failed { .. } => "handler_error",
        }
    }
}

/// Publish-side errors surfaced to callers before any bus call happens.
///
/// Transport failures are not represented here; they come back inside the
/// publish result so batch publishing never short-circuits.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("payload too large: {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}
