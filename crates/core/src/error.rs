//! Caller-visible error taxonomy.
//!
//! Every failure that reaches a caller is one of these kinds. The `kind()`
//! strings are part of the response contract and must not change.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum HandlerError {
    /// A request field is missing, has the wrong type, or is out of range.
    #[error("invalid field '{field}': {reason}")]
    Validation { field: String, reason: String },

    /// The request body exceeded the configured size limit.
    #[error("request body too large: {0}")]
    PayloadTooLarge(String),

    /// A base64 payload or the media inside it could not be decoded.
    #[error("could not decode '{field}': {reason}")]
    Codec { field: String, reason: String },

    /// The backend could not be reached within the submission retry budget.
    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),

    /// The backend rejected or failed the job.
    #[error("job failed: {0}")]
    JobFailed(String),

    #[error("job did not finish within {timeout_secs}s")]
    JobTimedOut { timeout_secs: u64 },

    #[error("job cancelled: {0}")]
    JobCancelled(String),

    #[error("backend not ready after {attempts} probe attempts: {reason}")]
    StartupNotReady { attempts: u32, reason: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl HandlerError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn codec(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Codec {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::PayloadTooLarge(_) => "payload_too_large",
            Self::Codec { .. } => "codec_error",
            Self::BackendUnreachable(_) => "backend_unreachable",
            Self::JobFailed(_) => "job_failed",
            Self::JobTimedOut { .. } => "job_timed_out",
            Self::JobCancelled(_) => "job_cancelled",
            Self::StartupNotReady { .. } => "startup_not_ready",
            Self::Internal(_) => "internal_error",
        }
    }

    /// True for failures detected before any backend interaction.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. } | Self::PayloadTooLarge(_) | Self::Codec { .. }
        )
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        HandlerError::Internal(format!("{err:#}"))
    }
}
