//! Work queue with receive-and-hide semantics and a dead-letter queue.
//!
//! ## Delivery model
//!
//! - **At-least-once**: a message is redelivered until acked or dead-lettered
//! - **Receive-and-hide**: at most one active processor per message; the
//!   visibility timeout is the implicit per-attempt deadline
//! - **Threshold**: the receive that would exceed `max_receive_count` moves
//!   the message verbatim to the DLQ instead of delivering it
//! - **No automatic reprocessing** of dead letters; operators requeue jobs

mod in_memory;
#[cfg(feature = "redis")]
mod redis_streams;
mod types;

use std::time::Duration;

use chrono::NaiveDate;

use reportflow_core::{JobId, MessageId};

pub use in_memory::InMemoryQueue;
#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsQueue, RedisStreamsQueueConfig};
pub use types::{
    BackoffStrategy, DeadLetter, Delivery, JobAction, QueueConfig, QueueError, QueueMessage,
    QueueStats, ReceiptHandle, RetryPolicy,
};

/// Main work queue.
pub trait MessageQueue: Send + Sync {
    fn send(&self, message: QueueMessage) -> Result<(), QueueError>;

    /// Receive the next visible message, hiding it for the visibility timeout.
    ///
    /// Returns `Ok(None)` when nothing is currently visible.
    fn receive(&self) -> Result<Option<Delivery>, QueueError>;

    /// Delete a message. Fails with [`QueueError::StaleReceipt`] if the receipt
    /// is no longer current.
    fn ack(&self, receipt: &ReceiptHandle) -> Result<(), QueueError>;

    /// Release a message for redelivery after `delay`.
    fn nack(&self, receipt: &ReceiptHandle, delay: Duration) -> Result<(), QueueError>;

    fn stats(&self) -> Result<QueueStats, QueueError>;
}

/// Dead-letter side of the queue.
///
/// Entries stay until removed; `observed_at` tracks whether the dead-letter
/// listener has already recorded the job failure.
pub trait DeadLetterQueue: Send + Sync {
    /// All entries, optionally restricted to one batch date.
    fn list(&self, batch_date: Option<NaiveDate>) -> Result<Vec<DeadLetter>, QueueError>;

    /// Oldest entries not yet observed by the listener.
    fn poll_unobserved(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError>;

    fn mark_observed(&self, message_id: MessageId) -> Result<(), QueueError>;

    /// Drop every entry for `job_id`; returns how many were removed.
    fn remove_for_job(&self, job_id: JobId) -> Result<usize, QueueError>;
}
