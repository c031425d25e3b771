//! Infrastructure layer: job store, queue, result cache, workers and the
//! completion/derivation wiring.
//!
//! Every backend sits behind a sync `Send + Sync` trait so the in-memory and
//! durable implementations are interchangeable as `Arc<dyn Trait>`.

pub mod cache;
pub mod collaborators;
pub mod completion;
pub mod config;
pub mod derive;
pub mod jobs;
pub mod operator;
pub mod queue;
pub mod scheduler;
pub mod workers;
