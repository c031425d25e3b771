//! Pipeline settings read from `REPORTFLOW_*` environment variables.
//!
//! Every variable is optional; unset means the default. A value that is set
//! but unparsable is an error rather than a silent fallback.

use std::time::Duration;

use crate::derive::DeriveConfig;
use crate::queue::{BackoffStrategy, QueueConfig, RetryPolicy};
use crate::workers::WorkerConfig;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse '{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("{var} must be at least 1")]
    Zero { var: &'static str },
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workers: usize,
    pub max_receive_count: u32,
    pub visibility_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub backoff_strategy: BackoffStrategy,
    pub job_ttl: chrono::Duration,
    /// How long a job may sit `pending` before the operator may requeue it.
    pub pending_grace: chrono::Duration,
    pub derive_concurrency: usize,
    pub derive_timeout: Duration,
    pub completion_poll: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        let queue = QueueConfig::default();
        let derive = DeriveConfig::default();
        Self {
            workers: WorkerConfig::default().workers,
            max_receive_count: retry.max_receive_count,
            visibility_timeout: queue.visibility_timeout,
            backoff_base: retry.base_delay,
            backoff_max: retry.max_delay,
            backoff_strategy: retry.strategy,
            job_ttl: chrono::Duration::days(7),
            pending_grace: chrono::Duration::minutes(15),
            derive_concurrency: derive.max_concurrent,
            derive_timeout: derive.timeout,
            completion_poll: Duration::from_secs(5),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; `from_env` with the process
    /// environment swapped out.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let cfg = Self {
            workers: read(&lookup, "REPORTFLOW_WORKERS")?.unwrap_or(d.workers),
            max_receive_count: read(&lookup, "REPORTFLOW_MAX_RECEIVE_COUNT")?
                .unwrap_or(d.max_receive_count),
            visibility_timeout: read(&lookup, "REPORTFLOW_VISIBILITY_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(d.visibility_timeout),
            backoff_base: read(&lookup, "REPORTFLOW_BACKOFF_BASE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(d.backoff_base),
            backoff_max: read(&lookup, "REPORTFLOW_BACKOFF_MAX_MS")?
                .map(Duration::from_millis)
                .unwrap_or(d.backoff_max),
            backoff_strategy: read(&lookup, "REPORTFLOW_BACKOFF_STRATEGY")?
                .unwrap_or(d.backoff_strategy),
            job_ttl: read(&lookup, "REPORTFLOW_JOB_TTL_HOURS")?
                .map(chrono::Duration::hours)
                .unwrap_or(d.job_ttl),
            pending_grace: read(&lookup, "REPORTFLOW_PENDING_GRACE_SECS")?
                .map(chrono::Duration::seconds)
                .unwrap_or(d.pending_grace),
            derive_concurrency: read(&lookup, "REPORTFLOW_DERIVE_CONCURRENCY")?
                .unwrap_or(d.derive_concurrency),
            derive_timeout: read(&lookup, "REPORTFLOW_DERIVE_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(d.derive_timeout),
            completion_poll: read(&lookup, "REPORTFLOW_COMPLETION_POLL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(d.completion_poll),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Zero { var: "REPORTFLOW_WORKERS" });
        }
        if self.max_receive_count == 0 {
            return Err(ConfigError::Zero { var: "REPORTFLOW_MAX_RECEIVE_COUNT" });
        }
        if self.derive_concurrency == 0 {
            return Err(ConfigError::Zero { var: "REPORTFLOW_DERIVE_CONCURRENCY" });
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_receive_count: self.max_receive_count,
            base_delay: self.backoff_base,
            max_delay: self.backoff_max.max(self.backoff_base),
            strategy: self.backoff_strategy,
            ..RetryPolicy::default()
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::from_policy(&self.retry_policy(), self.visibility_timeout)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::default()
            .with_workers(self.workers)
            .with_retry(self.retry_policy())
    }

    pub fn derive_config(&self) -> DeriveConfig {
        DeriveConfig {
            max_concurrent: self.derive_concurrency,
            timeout: self.derive_timeout,
        }
    }
}

fn read<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse().map(Some).map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}
