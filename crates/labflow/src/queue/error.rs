//! Ingestion queue error types.

use thiserror::Error;

use crate::db::DatabaseError;

#[derive(Error, Debug)]
pub enum QueueError {
    /// The backing channel cannot accept the message.
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    /// The delivery token no longer matches an in-flight delivery
    /// (already acknowledged, released, or redelivered to someone else).
    #[error("Delivery token for message {message_id} is no longer valid")]
    InvalidToken { message_id: String },

    /// The message exhausted its delivery budget and sits in the
    /// dead-letter channel.
    #[error("Message {message_id} was dead-lettered after {receive_count} deliveries")]
    DeadLettered {
        message_id: String,
        receive_count: u32,
    },

    #[error("Dead letter not found: {0}")]
    NotFound(String),

    #[error("Failed to encode admission message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}
