use thiserror::Error;

/// Kernel error taxonomy surfaced to transport-layer callers.
///
/// Deny paths and validation errors are propagated unchanged; the transport layer is
/// responsible for collapsing every existence-concealment-relevant variant into the
/// same opaque response. `KernelError` itself never carries a reason string that should
/// not eventually be logged to audit.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("unauthenticated")]
    Unauthenticated,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found")]
    NotFound,

    #[error("insufficient tier")]
    InsufficientTier,

    #[error("insufficient clearance")]
    InsufficientClearance,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("rate limited")]
    RateLimited,

    #[error("gone")]
    Gone,

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("internal error (correlation id {correlation_id}): {message}")]
    Internal {
        correlation_id: String,
        message: String,
    },
}

impl KernelError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Every deny reason that existence concealment must hide behind a uniform
    /// "not found"-equivalent response at the transport boundary.
    pub fn is_concealed_deny(&self) -> bool {
        matches!(
            self,
            Self::NotFound | Self::InsufficientTier | Self::InsufficientClearance
        )
    }
}
