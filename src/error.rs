//! Error types for the per-message pipeline stages.
//!
//! Classification cannot fail. Every other stage returns one of these, and the
//! pipeline logs them in one place without stopping the event loop.

/// Failure of a webhook delivery. Never retried.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("webhook returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("webhook request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to encode lead: {0}")]
    Encode(#[from] serde_json::Error),
}

impl DeliveryError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, DeliveryError::Transport(e) if e.is_timeout())
    }
}

/// A stage of lead handling failed for one message.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("metadata resolution failed: {0:#}")]
    Metadata(anyhow::Error),

    #[error("duplicate check failed: {0:#}")]
    Dedupe(anyhow::Error),

    #[error("delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("recording lead failed: {0:#}")]
    Record(anyhow::Error),
}

impl StageError {
    pub fn stage(&self) -> &'static str {
        match self {
            StageError::Metadata(_) => "metadata",
            StageError::Dedupe(_) => "dedupe",
            StageError::Delivery(_) => "delivery",
            StageError::Record(_) => "record",
        }
    }
}
