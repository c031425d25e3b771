//! Redis Streams-backed work queue (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - **Stream** `reportflow:jobs`, read through one consumer group shared by
//!   every worker; each process is a named consumer
//! - **Visibility**: an entry stays in the group's pending list until acked;
//!   entries idle longer than the visibility timeout are reclaimed with `XCLAIM`
//! - **Backoff**: `nack` moves the message into a sorted set scored by its
//!   visible-at time; due members are promoted back onto the stream on receive
//! - **Dead letters**: stream `reportflow:jobs:dlq`; the listener's "observed"
//!   marks live in the hash `reportflow:jobs:dlq:observed`
//!
//! Receive counts survive backoff because each stream entry carries the
//! number of receives that happened before it was (re)added.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use redis::Commands;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamPendingReply, StreamRangeReply,
    StreamReadOptions, StreamReadReply,
};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use reportflow_core::{JobId, MessageId};

use super::types::{
    DeadLetter, Delivery, QueueConfig, QueueError, QueueMessage, QueueStats, ReceiptHandle,
};
use super::{DeadLetterQueue, MessageQueue};

const DEFAULT_STREAM_KEY: &str = "reportflow:jobs";
const DEFAULT_GROUP: &str = "reportflow-workers";

/// How many idle pending entries to inspect per receive.
const RECLAIM_BATCH: usize = 16;

#[derive(Debug, Clone)]
pub struct RedisStreamsQueueConfig {
    pub stream_key: String,
    pub group: String,
    /// Unique per process (e.g. `worker-<hostname>-<pid>`).
    pub consumer: String,
    pub queue: QueueConfig,
}

impl RedisStreamsQueueConfig {
    pub fn new(consumer: impl Into<String>, queue: QueueConfig) -> Self {
        Self {
            stream_key: DEFAULT_STREAM_KEY.to_string(),
            group: DEFAULT_GROUP.to_string(),
            consumer: consumer.into(),
            queue,
        }
    }

    fn delayed_key(&self) -> String {
        format!("{}:delayed", self.stream_key)
    }

    fn dlq_key(&self) -> String {
        format!("{}:dlq", self.stream_key)
    }

    fn observed_key(&self) -> String {
        format!("{}:dlq:observed", self.stream_key)
    }
}

/// Member of the delayed sorted set.
#[derive(Debug, Serialize, Deserialize)]
struct DelayedEntry {
    prior_receives: u32,
    message: QueueMessage,
}

#[derive(Debug, Clone)]
pub struct RedisStreamsQueue {
    client: Arc<redis::Client>,
    config: RedisStreamsQueueConfig,
}

fn backend(context: &str) -> impl FnOnce(redis::RedisError) -> QueueError + '_ {
    move |e| QueueError::Backend(format!("{context} failed: {e}"))
}

fn serialization(e: serde_json::Error) -> QueueError {
    QueueError::Serialization(e.to_string())
}

impl RedisStreamsQueue {
    /// Connect and make sure the consumer group exists.
    pub fn connect(
        redis_url: impl AsRef<str>,
        config: RedisStreamsQueueConfig,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(backend("connect"))?;
        let queue = Self {
            client: Arc::new(client),
            config,
        };
        queue.ensure_consumer_group()?;
        Ok(queue)
    }

    /// `XGROUP CREATE ... MKSTREAM`; an existing group is fine.
    pub fn ensure_consumer_group(&self) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        let created: redis::RedisResult<()> =
            conn.xgroup_create_mkstream(&self.config.stream_key, &self.config.group, "0");
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(backend("XGROUP CREATE")(e)),
        }
    }

    fn conn(&self) -> Result<redis::Connection, QueueError> {
        self.client.get_connection().map_err(backend("connection"))
    }

    fn max_receive_count(&self) -> u32 {
        self.config.queue.max_receive_count
    }

    fn add_entry(
        &self,
        conn: &mut redis::Connection,
        message: &QueueMessage,
        prior_receives: u32,
    ) -> Result<String, QueueError> {
        let payload = serde_json::to_string(message).map_err(serialization)?;
        conn.xadd(
            &self.config.stream_key,
            "*",
            &[
                ("message_id", message.message_id.to_string()),
                ("prior_receives", prior_receives.to_string()),
                ("payload", payload),
            ],
        )
        .map_err(backend("XADD"))
    }

    /// Move due members of the delayed set back onto the stream.
    fn promote_due(&self, conn: &mut redis::Connection) -> Result<(), QueueError> {
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<String> = conn
            .zrangebyscore(self.config.delayed_key(), "-inf", now_ms)
            .map_err(backend("ZRANGEBYSCORE"))?;

        for member in due {
            // Only the consumer that wins ZREM re-adds the entry.
            let removed: u32 = conn
                .zrem(self.config.delayed_key(), &member)
                .map_err(backend("ZREM"))?;
            if removed == 0 {
                continue;
            }
            let entry: DelayedEntry = serde_json::from_str(&member).map_err(serialization)?;
            self.add_entry(conn, &entry.message, entry.prior_receives)?;
        }
        Ok(())
    }

    fn parse_entry(entry: &StreamId) -> Result<(QueueMessage, u32), QueueError> {
        let payload: String = entry
            .get("payload")
            .ok_or_else(|| QueueError::Serialization(format!("entry {} has no payload", entry.id)))?;
        let prior: u32 = entry.get("prior_receives").unwrap_or(0);
        let message = serde_json::from_str(&payload).map_err(serialization)?;
        Ok((message, prior))
    }

    /// Hand out a delivery, or dead-letter the entry if it is past the threshold.
    fn deliver_or_dead_letter(
        &self,
        conn: &mut redis::Connection,
        entry: &StreamId,
        times_delivered: u32,
    ) -> Result<Option<Delivery>, QueueError> {
        let (message, prior) = Self::parse_entry(entry)?;
        let receive_count = prior + times_delivered;

        if receive_count > self.max_receive_count() {
            self.dead_letter(conn, &entry.id, message, receive_count - 1)?;
            return Ok(None);
        }

        Ok(Some(Delivery {
            receipt: ReceiptHandle {
                message_id: message.message_id,
                token: encode_token(&entry.id, times_delivered),
            },
            message,
            receive_count,
        }))
    }

    fn dead_letter(
        &self,
        conn: &mut redis::Connection,
        entry_id: &str,
        message: QueueMessage,
        receive_count: u32,
    ) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&message).map_err(serialization)?;
        redis::pipe()
            .atomic()
            .xadd(
                self.config.dlq_key(),
                "*",
                &[
                    ("message_id", message.message_id.to_string()),
                    ("job_id", message.job_id.to_string()),
                    ("receive_count", receive_count.to_string()),
                    ("dead_lettered_at", Utc::now().to_rfc3339()),
                    ("payload", payload),
                ],
            )
            .ignore()
            .xack(&self.config.stream_key, &self.config.group, &[entry_id])
            .ignore()
            .xdel(&self.config.stream_key, &[entry_id])
            .ignore()
            .query::<()>(conn)
            .map_err(backend("dead-letter MULTI"))?;

        warn!(
            message_id = %message.message_id,
            job_id = %message.job_id,
            ticker = %message.ticker,
            receive_count,
            "message exceeded max receive count; moved to dead-letter queue"
        );
        Ok(())
    }

    /// Reclaim entries whose visibility timeout has elapsed.
    fn reclaim_idle(&self, conn: &mut redis::Connection) -> Result<Option<Delivery>, QueueError> {
        let idle_ms = self.config.queue.visibility_timeout.as_millis() as u64;
        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg("IDLE")
            .arg(idle_ms)
            .arg("-")
            .arg("+")
            .arg(RECLAIM_BATCH)
            .query(conn)
            .map_err(backend("XPENDING"))?;

        for pending_entry in pending.ids {
            let claimed: StreamClaimReply = conn
                .xclaim(
                    &self.config.stream_key,
                    &self.config.group,
                    &self.config.consumer,
                    idle_ms,
                    &[&pending_entry.id],
                )
                .map_err(backend("XCLAIM"))?;

            // Another consumer may have claimed it first.
            let Some(entry) = claimed.ids.first() else {
                continue;
            };
            // XCLAIM bumped the delivery counter.
            let times_delivered = pending_entry.times_delivered as u32 + 1;
            if let Some(delivery) = self.deliver_or_dead_letter(conn, entry, times_delivered)? {
                return Ok(Some(delivery));
            }
        }
        Ok(None)
    }

    fn read_new(&self, conn: &mut redis::Connection) -> Result<Option<Delivery>, QueueError> {
        let opts = StreamReadOptions::default()
            .group(&self.config.group, &self.config.consumer)
            .count(1);
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.config.stream_key], &[">"], &opts)
            .map_err(backend("XREADGROUP"))?;

        let Some(entry) = reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|k| k.ids)
            .next()
        else {
            return Ok(None);
        };
        self.deliver_or_dead_letter(conn, &entry, 1)
    }

    /// Check that `receipt` still owns its pending entry.
    fn verify_receipt(
        &self,
        conn: &mut redis::Connection,
        receipt: &ReceiptHandle,
    ) -> Result<String, QueueError> {
        let stale = || QueueError::StaleReceipt(receipt.message_id);
        let (entry_id, delivered) = decode_token(&receipt.token).ok_or_else(stale)?;

        let pending: StreamPendingCountReply = conn
            .xpending_count(&self.config.stream_key, &self.config.group, entry_id, entry_id, 1)
            .map_err(backend("XPENDING"))?;
        match pending.ids.first() {
            Some(p)
                if p.consumer == self.config.consumer && p.times_delivered as u32 == delivered =>
            {
                Ok(entry_id.to_string())
            }
            _ => Err(stale()),
        }
    }

    fn read_dead_letters(
        &self,
        conn: &mut redis::Connection,
    ) -> Result<Vec<(String, DeadLetter)>, QueueError> {
        let range: StreamRangeReply = conn
            .xrange_all(self.config.dlq_key())
            .map_err(backend("XRANGE"))?;
        let observed: HashMap<String, String> = conn
            .hgetall(self.config.observed_key())
            .map_err(backend("HGETALL"))?;

        range
            .ids
            .iter()
            .map(|entry| {
                let (message, _) = Self::parse_entry(entry)?;
                let receive_count: u32 = entry.get("receive_count").unwrap_or(0);
                let dead_lettered_at = entry
                    .get::<String>("dead_lettered_at")
                    .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now);
                let observed_at = observed
                    .get(&message.message_id.to_string())
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|t| t.with_timezone(&Utc));
                Ok((
                    entry.id.clone(),
                    DeadLetter {
                        message,
                        receive_count,
                        dead_lettered_at,
                        observed_at,
                    },
                ))
            })
            .collect()
    }
}

fn encode_token(entry_id: &str, times_delivered: u32) -> String {
    format!("{entry_id}/{times_delivered}")
}

fn decode_token(token: &str) -> Option<(&str, u32)> {
    let (entry_id, delivered) = token.rsplit_once('/')?;
    Some((entry_id, delivered.parse().ok()?))
}

impl MessageQueue for RedisStreamsQueue {
    #[instrument(skip(self, message), fields(message_id = %message.message_id, job_id = %message.job_id), err)]
    fn send(&self, message: QueueMessage) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        self.add_entry(&mut conn, &message, 0).map(|_| ())
    }

    fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.conn()?;
        self.promote_due(&mut conn)?;

        if let Some(delivery) = self.reclaim_idle(&mut conn)? {
            return Ok(Some(delivery));
        }
        // A dead-lettered new entry yields nothing this round; the caller polls again.
        self.read_new(&mut conn)
    }

    fn ack(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        let entry_id = self.verify_receipt(&mut conn, receipt)?;
        redis::pipe()
            .atomic()
            .xack(&self.config.stream_key, &self.config.group, &[&entry_id])
            .ignore()
            .xdel(&self.config.stream_key, &[&entry_id])
            .ignore()
            .query::<()>(&mut conn)
            .map_err(backend("ack MULTI"))
    }

    fn nack(&self, receipt: &ReceiptHandle, delay: Duration) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        let entry_id = self.verify_receipt(&mut conn, receipt)?;

        let range: StreamRangeReply = conn
            .xrange(&self.config.stream_key, &entry_id, &entry_id)
            .map_err(backend("XRANGE"))?;
        let entry = range
            .ids
            .first()
            .ok_or(QueueError::StaleReceipt(receipt.message_id))?;
        let (message, prior) = Self::parse_entry(entry)?;
        let (_, delivered) = decode_token(&receipt.token).unwrap_or_default();

        let member = serde_json::to_string(&DelayedEntry {
            prior_receives: prior + delivered,
            message,
        })
        .map_err(serialization)?;
        let visible_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;

        redis::pipe()
            .atomic()
            .zadd(self.config.delayed_key(), member, visible_at)
            .ignore()
            .xack(&self.config.stream_key, &self.config.group, &[&entry_id])
            .ignore()
            .xdel(&self.config.stream_key, &[&entry_id])
            .ignore()
            .query::<()>(&mut conn)
            .map_err(backend("nack MULTI"))
    }

    fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.conn()?;
        let len: usize = conn
            .xlen(&self.config.stream_key)
            .map_err(backend("XLEN"))?;
        let pending: StreamPendingReply = conn
            .xpending(&self.config.stream_key, &self.config.group)
            .map_err(backend("XPENDING"))?;
        let delayed: usize = conn
            .zcard(self.config.delayed_key())
            .map_err(backend("ZCARD"))?;
        let dead_lettered: usize = conn
            .xlen(self.config.dlq_key())
            .map_err(backend("XLEN"))?;

        let in_flight = pending.count();
        Ok(QueueStats {
            visible: len.saturating_sub(in_flight),
            in_flight,
            delayed,
            dead_lettered,
        })
    }
}

impl DeadLetterQueue for RedisStreamsQueue {
    fn list(&self, batch_date: Option<NaiveDate>) -> Result<Vec<DeadLetter>, QueueError> {
        let mut conn = self.conn()?;
        Ok(self
            .read_dead_letters(&mut conn)?
            .into_iter()
            .map(|(_, d)| d)
            .filter(|d| batch_date.is_none_or(|date| d.message.date == date))
            .collect())
    }

    fn poll_unobserved(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        let mut conn = self.conn()?;
        Ok(self
            .read_dead_letters(&mut conn)?
            .into_iter()
            .map(|(_, d)| d)
            .filter(|d| d.observed_at.is_none())
            .take(limit)
            .collect())
    }

    fn mark_observed(&self, message_id: MessageId) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        conn.hset_nx(
            self.config.observed_key(),
            message_id.to_string(),
            Utc::now().to_rfc3339(),
        )
        .map_err(backend("HSETNX"))
    }

    fn remove_for_job(&self, job_id: JobId) -> Result<usize, QueueError> {
        let mut conn = self.conn()?;
        let matching: Vec<(String, DeadLetter)> = self
            .read_dead_letters(&mut conn)?
            .into_iter()
            .filter(|(_, d)| d.message.job_id == job_id)
            .collect();
        if matching.is_empty() {
            return Ok(0);
        }

        let entry_ids: Vec<&str> = matching.iter().map(|(id, _)| id.as_str()).collect();
        let message_ids: Vec<String> = matching
            .iter()
            .map(|(_, d)| d.message.message_id.to_string())
            .collect();
        redis::pipe()
            .atomic()
            .xdel(self.config.dlq_key(), &entry_ids)
            .ignore()
            .hdel(self.config.observed_key(), &message_ids)
            .ignore()
            .query::<()>(&mut conn)
            .map_err(backend("DLQ remove MULTI"))?;
        Ok(matching.len())
    }
}
