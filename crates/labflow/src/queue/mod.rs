//! Ingestion queue: at-least-once admission with a dead-letter channel.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::InputParams;

pub mod error;
pub mod sqlite;

pub use error::QueueError;
pub use sqlite::SqliteQueue;

/// Deliveries allowed before a message is moved to the dead-letter channel.
pub const DEAD_LETTER_THRESHOLD: u32 = 3;

/// Payload of a "new job" admission event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdmissionMessage {
    pub job_id: String,
    pub user_id: String,
    pub input_params: InputParams,
    pub submitted_at: DateTime<Utc>,
}

impl AdmissionMessage {
    pub fn new(job_id: &str, user_id: &str, input_params: InputParams) -> Self {
        Self {
            job_id: job_id.to_string(),
            user_id: user_id.to_string(),
            input_params,
            submitted_at: Utc::now(),
        }
    }
}

/// Handle used to acknowledge or release one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryToken {
    pub message_id: String,
    pub(crate) receipt: String,
}

/// A dequeued message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: AdmissionMessage,
    pub token: DeliveryToken,
    /// How many times this message has been handed out, this one included.
    pub receive_count: u32,
}

/// A message parked in the dead-letter channel.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub message_id: String,
    pub job_id: String,
    /// Decoded payload, absent when the body could not be parsed.
    pub message: Option<AdmissionMessage>,
    pub raw_body: String,
    pub receive_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub visible: u64,
    pub in_flight: u64,
    pub dead_lettered: u64,
}

/// At-least-once admission channel.
///
/// A dequeued message stays invisible for a visibility window; if it is
/// neither acknowledged nor released in that window it is handed out again
/// with a higher receive count. Once the count would exceed
/// [`DEAD_LETTER_THRESHOLD`] the message is dead-lettered instead.
pub trait IngestionQueue: Send + Sync {
    /// Adds a message. Returns its message id.
    fn enqueue(&self, message: &AdmissionMessage) -> Result<String, QueueError>;

    /// Waits up to `poll_timeout` for a message.
    fn dequeue(&self, poll_timeout: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Removes a delivered message for good.
    fn ack(&self, token: &DeliveryToken) -> Result<(), QueueError>;

    /// Hands a delivered message back for immediate redelivery.
    fn release(&self, token: &DeliveryToken) -> Result<(), QueueError>;

    fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError>;

    /// Moves a dead letter back to the queue with a fresh delivery count.
    fn replay_dead_letter(&self, message_id: &str) -> Result<(), QueueError>;

    fn depth(&self) -> Result<QueueDepth, QueueError>;
}
