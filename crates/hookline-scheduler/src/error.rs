use thiserror::Error;

use crate::state::TransitionError;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored JSON column could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The provided schedule definition is invalid or unsupported.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// A stored row could not be turned into a typed message.
    #[error("Corrupt row {id}: {reason}")]
    CorruptRow { id: String, reason: String },

    /// No scheduled message with the given ID exists in the store.
    #[error("Message not found: {id}")]
    MessageNotFound { id: String },

    /// No webhook with the given ID exists in the store.
    #[error("Webhook not found: {id}")]
    WebhookNotFound { id: String },

    /// The state machine refused the requested transition.
    #[error("Transition rejected: {0}")]
    Transition(#[from] TransitionError),

    /// Another writer changed the row between read and write.
    #[error("Concurrent update on message {id}")]
    Conflict { id: String },

    /// The connection mutex was poisoned by a panicking thread.
    #[error("Store lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
