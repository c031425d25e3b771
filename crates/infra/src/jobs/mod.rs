//! Job and batch status tracking.
//!
//! ## Design
//!
//! - One `Job` row per ticker per batch date, one `Batch` row per date
//! - Status transitions are atomic compare-and-set operations
//! - `attempts` only increases; `completed` is never left
//! - Expired jobs (TTL) are invisible and removed by `purge_expired`
//!
//! ## Components
//!
//! - `JobStatusStore`: persistence contract (in-memory or Postgres)
//! - `AttemptOutcome` / `StatusCounts`: transition and aggregate results

pub mod postgres;
pub mod store;

pub use postgres::PostgresJobStatusStore;
pub use store::{AttemptOutcome, InMemoryJobStatusStore, JobStatusStore, JobStoreError, StatusCounts};
