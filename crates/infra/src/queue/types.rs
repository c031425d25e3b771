//! Queue message envelope, delivery metadata and retry policy.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub use reportflow_core::JobAction;
use reportflow_core::{Job, JobId, MessageId, Ticker};

/// Queue message wire format. Metadata only, never the computed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub message_id: MessageId,
    pub job_id: JobId,
    pub ticker: Ticker,
    pub date: NaiveDate,
    pub enqueued_at: DateTime<Utc>,
    pub action: JobAction,
}

impl QueueMessage {
    /// A fresh message for `job`, carrying the action it was scheduled with.
    pub fn for_job(job: &Job, now: DateTime<Utc>) -> Self {
        Self {
            message_id: MessageId::new(),
            job_id: job.job_id,
            ticker: job.ticker.clone(),
            date: job.date,
            enqueued_at: now,
            action: job.action,
        }
    }
}

/// Proof of a specific receive. Only the latest receipt of a message can
/// acknowledge or release it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle {
    pub message_id: MessageId,
    pub token: String,
}

/// A received message, hidden from other consumers until acked, released, or
/// until its visibility window elapses.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: QueueMessage,
    pub receipt: ReceiptHandle,
    /// How many times this message has been received, including this one.
    pub receive_count: u32,
}

/// A message moved verbatim to the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message: QueueMessage,
    pub receive_count: u32,
    pub dead_lettered_at: DateTime<Utc>,
    /// Set once the dead-letter listener has recorded the job failure.
    pub observed_at: Option<DateTime<Utc>>,
}

/// Queue error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    /// The receipt was superseded by a later receive, released, or the
    /// message is gone.
    #[error("stale receipt for message {0}")]
    StaleReceipt(MessageId),
    #[error("message already queued: {0}")]
    Duplicate(MessageId),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("queue backend error: {0}")]
    Backend(String),
}

/// Point-in-time queue depth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Ready to be received now.
    pub visible: usize,
    /// Received and hidden, not yet acked.
    pub in_flight: usize,
    /// Released with a backoff delay that has not elapsed yet.
    pub delayed: usize,
    /// DLQ depth; anything above zero is worth an alert.
    pub dead_lettered: usize,
}

impl QueueStats {
    /// Messages still owned by the main queue.
    pub fn outstanding(&self) -> usize {
        self.visible + self.in_flight + self.delayed
    }
}

/// Queue-level settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a received message stays hidden; the implicit per-attempt deadline.
    pub visibility_timeout: Duration,
    /// A message may be received this many times; the next receive moves it to
    /// the DLQ instead.
    pub max_receive_count: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(300),
            max_receive_count: 3,
        }
    }
}

impl QueueConfig {
    pub fn from_policy(policy: &RetryPolicy, visibility_timeout: Duration) -> Self {
        Self {
            visibility_timeout,
            max_receive_count: policy.max_receive_count,
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

impl core::str::FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            other => Err(format!("unknown backoff strategy '{other}'")),
        }
    }
}

/// Retry policy for failed attempts.
///
/// Redelivery is how retries happen; this policy makes the threshold and the
/// delay between attempts explicit instead of leaning on visibility timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Dead-letter threshold (`1` = fail fast).
    pub max_receive_count: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_receive_count: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// One attempt, straight to the DLQ on failure.
    pub fn fail_fast() -> Self {
        Self {
            max_receive_count: 1,
            ..Default::default()
        }
    }

    /// Fixed delays, no jitter.
    pub fn fixed(max_receive_count: u32, delay: Duration) -> Self {
        Self {
            max_receive_count,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Immediate redelivery; what tests use to drive N failures deterministically.
    pub fn immediate(max_receive_count: u32) -> Self {
        Self::fixed(max_receive_count, Duration::ZERO)
    }

    pub fn exponential(max_receive_count: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_receive_count,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before the message becomes visible again after failed attempt
    /// number `attempt` (1-indexed, i.e. the delivery's receive count).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic jitter derived from the attempt number.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether a delivery with this receive count still has a retry left.
    pub fn has_retry_left(&self, receive_count: u32) -> bool {
        receive_count < self.max_receive_count
    }
}
