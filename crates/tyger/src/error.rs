//! Error kinds surfaced across the control-plane core.
//!
//! Request handlers surface these typed errors upward; background loops
//! recover locally (log and wait for the next tick). Only
//! [`Error::BackendTransient`] is retried by the resilience pipeline by
//! default; see [`crate::pipeline`] for the per-failure overrides.

use tyger_retry::FailureKind;

/// Result alias used across the core.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed input: unknown codespec, missing or extra buffer binding,
    /// tag out of bounds, ttl out of range, unsupported backend feature.
    #[error("validation error: {0}")]
    Validation(String),

    /// A run, buffer, or codespec id does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// ETag mismatch or concurrent-state conflict. The caller should refresh
    /// its view and retry the mutation.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Transient backend or store failure; retried by the resilience pipeline.
    #[error("transient backend failure: {0}")]
    BackendTransient(String),

    /// Non-retryable backend rejection (image not found, invalid spec).
    #[error("backend rejected the request: {0}")]
    BackendFatal(String),

    /// Operation cancelled by the caller or by process shutdown.
    #[error("operation cancelled")]
    Cancelled,

    /// Unexpected failure, surfaced as an opaque server error.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Error::PreconditionFailed(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Error::BackendTransient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Error::BackendFatal(msg.into())
    }

    /// Whether the resilience pipeline may retry the failed call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::BackendTransient(_))
    }

    /// Classification consulted by [`crate::pipeline::Pipeline`] when
    /// deciding whether to retry.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Error::BackendTransient(_) => FailureKind::Transient,
            Error::Internal(_) => FailureKind::Ambiguous,
            _ => FailureKind::Permanent,
        }
    }
}
