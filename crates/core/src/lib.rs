//! `reportflow-core`: domain building blocks for the batch report pipeline.
//!
//! This crate contains **pure domain** types (no storage, queue or threading
//! concerns): identifiers, tickers, the job lifecycle, batch phases and cached
//! result records.

pub mod batch;
pub mod entity;
pub mod error;
pub mod id;
pub mod job;
pub mod report;
pub mod ticker;

pub use batch::{Batch, BatchPhase};
pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{BatchId, JobId, MessageId};
pub use job::{CompleteOutcome, FailOutcome, Job, JobAction, JobStatus};
pub use report::{ArtifactRef, ReportPayload, ResultCacheEntry, ResultKey};
pub use ticker::Ticker;
