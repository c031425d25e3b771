//! In-memory queue with visibility timeouts and a dead-letter side queue.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use reportflow_core::{JobId, MessageId};

use super::types::{
    DeadLetter, Delivery, QueueConfig, QueueError, QueueMessage, QueueStats, ReceiptHandle,
};
use super::{DeadLetterQueue, MessageQueue};

#[derive(Debug)]
struct Stored {
    message: QueueMessage,
    receive_count: u32,
    visible_at: DateTime<Utc>,
    /// Token of the most recent receive; `None` once released with `nack`.
    receipt: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    next_seq: u64,
    /// Main queue in send order.
    main: BTreeMap<u64, Stored>,
    index: HashMap<MessageId, u64>,
    dead: BTreeMap<u64, DeadLetter>,
}

/// Single-process queue for tests/dev.
///
/// - FIFO by send order among visible messages (no cross-message ordering is promised)
/// - A received message is hidden for `visibility_timeout`, then redelivered
/// - The receive that would exceed `max_receive_count` dead-letters the message
#[derive(Debug)]
pub struct InMemoryQueue {
    config: QueueConfig,
    state: Mutex<State>,
}

impl InMemoryQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
        }
    }

    pub fn arc(config: QueueConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::Backend("queue lock poisoned".into()))
    }

    fn to_chrono(d: Duration) -> chrono::Duration {
        chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl MessageQueue for InMemoryQueue {
    fn send(&self, message: QueueMessage) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        if state.index.contains_key(&message.message_id) {
            return Err(QueueError::Duplicate(message.message_id));
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.index.insert(message.message_id, seq);
        state.main.insert(
            seq,
            Stored {
                message,
                receive_count: 0,
                visible_at: Utc::now(),
                receipt: None,
            },
        );
        Ok(())
    }

    fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        let now = Utc::now();
        let mut state = self.lock()?;

        loop {
            let Some(seq) = state
                .main
                .iter()
                .find(|(_, s)| s.visible_at <= now)
                .map(|(seq, _)| *seq)
            else {
                return Ok(None);
            };

            let exhausted = state
                .main
                .get(&seq)
                .is_some_and(|s| s.receive_count >= self.config.max_receive_count);

            if exhausted {
                if let Some(stored) = state.main.remove(&seq) {
                    state.index.remove(&stored.message.message_id);
                    tracing::warn!(
                        message_id = %stored.message.message_id,
                        job_id = %stored.message.job_id,
                        ticker = %stored.message.ticker,
                        receive_count = stored.receive_count,
                        "message exceeded max receive count; moved to dead-letter queue"
                    );
                    state.dead.insert(
                        seq,
                        DeadLetter {
                            message: stored.message,
                            receive_count: stored.receive_count,
                            dead_lettered_at: now,
                            observed_at: None,
                        },
                    );
                }
                continue;
            }

            let Some(stored) = state.main.get_mut(&seq) else {
                return Ok(None);
            };
            let token = Uuid::now_v7().to_string();
            stored.receive_count += 1;
            stored.visible_at = now + Self::to_chrono(self.config.visibility_timeout);
            stored.receipt = Some(token.clone());

            return Ok(Some(Delivery {
                message: stored.message.clone(),
                receipt: ReceiptHandle {
                    message_id: stored.message.message_id,
                    token,
                },
                receive_count: stored.receive_count,
            }));
        }
    }

    fn ack(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        let seq = current_seq(&state, receipt)?;
        state.main.remove(&seq);
        state.index.remove(&receipt.message_id);
        Ok(())
    }

    fn nack(&self, receipt: &ReceiptHandle, delay: Duration) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        let seq = current_seq(&state, receipt)?;
        if let Some(stored) = state.main.get_mut(&seq) {
            stored.visible_at = Utc::now() + Self::to_chrono(delay);
            stored.receipt = None;
        }
        Ok(())
    }

    fn stats(&self) -> Result<QueueStats, QueueError> {
        let now = Utc::now();
        let state = self.lock()?;
        let mut stats = QueueStats {
            dead_lettered: state.dead.len(),
            ..Default::default()
        };
        for stored in state.main.values() {
            if stored.visible_at <= now {
                stats.visible += 1;
            } else if stored.receipt.is_some() {
                stats.in_flight += 1;
            } else {
                stats.delayed += 1;
            }
        }
        Ok(stats)
    }
}

/// Resolve a receipt to its queue slot, rejecting receipts superseded by a
/// later receive (or by a `nack`).
fn current_seq(state: &State, receipt: &ReceiptHandle) -> Result<u64, QueueError> {
    let seq = state
        .index
        .get(&receipt.message_id)
        .copied()
        .ok_or(QueueError::StaleReceipt(receipt.message_id))?;
    match state.main.get(&seq) {
        Some(stored) if stored.receipt.as_deref() == Some(receipt.token.as_str()) => Ok(seq),
        _ => Err(QueueError::StaleReceipt(receipt.message_id)),
    }
}

impl DeadLetterQueue for InMemoryQueue {
    fn list(&self, batch_date: Option<NaiveDate>) -> Result<Vec<DeadLetter>, QueueError> {
        let state = self.lock()?;
        Ok(state
            .dead
            .values()
            .filter(|d| batch_date.is_none_or(|date| d.message.date == date))
            .cloned()
            .collect())
    }

    fn poll_unobserved(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        let state = self.lock()?;
        Ok(state
            .dead
            .values()
            .filter(|d| d.observed_at.is_none())
            .take(limit)
            .cloned()
            .collect())
    }

    fn mark_observed(&self, message_id: MessageId) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        if let Some(entry) = state
            .dead
            .values_mut()
            .find(|d| d.message.message_id == message_id)
        {
            entry.observed_at.get_or_insert_with(Utc::now);
        }
        Ok(())
    }

    fn remove_for_job(&self, job_id: JobId) -> Result<usize, QueueError> {
        let mut state = self.lock()?;
        let before = state.dead.len();
        state.dead.retain(|_, d| d.message.job_id != job_id);
        Ok(before - state.dead.len())
    }
}
