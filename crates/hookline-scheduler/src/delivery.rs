//! The seam between the scheduler and whatever actually transmits a message.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::ScheduledMessage;

/// Why a delivery attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The destination refused the message; retrying will not help.
    #[error("rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The destination asked us to slow down.
    #[error("rate limited, retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    /// The destination failed on its side.
    #[error("server error HTTP {status}")]
    Server { status: u16 },

    /// Connection, TLS or timeout failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The stored content cannot be turned into a valid request.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The message references a webhook that no longer exists.
    #[error("webhook not found: {0}")]
    WebhookNotFound(String),
}

impl DeliveryError {
    /// Whether another attempt within the same dispatch may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeliveryError::RateLimited { .. }
                | DeliveryError::Server { .. }
                | DeliveryError::Transport(_)
        )
    }
}

/// Sends one scheduled message to its destination.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, message: &ScheduledMessage) -> Result<(), DeliveryError>;
}
