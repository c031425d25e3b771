//! Background workers: the report worker pool, the dead-letter listener and
//! the derivation trigger.
//!
//! Every background loop runs on a named OS thread and stops through a
//! [`WorkerHandle`].

pub mod dead_letter_listener;
pub mod derivation_trigger;
pub mod pool;

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

pub use dead_letter_listener::{DeadLetterListener, ListenerReport};
pub use derivation_trigger::DerivationTrigger;
pub use pool::{
    PoolStats, ProcessOutcome, Worker, WorkerConfig, WorkerError, WorkerPool, WorkerPoolHandle,
};

/// Tick for loops that wait on a channel; bounds shutdown latency.
pub(crate) const SHUTDOWN_TICK: Duration = Duration::from_millis(250);

/// Handle to control and join a background worker.
///
/// Dropping the handle without calling [`shutdown`](Self::shutdown) also
/// stops the worker at its next tick, without joining it.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn new(shutdown: mpsc::Sender<()>, join: thread::JoinHandle<()>) -> Self {
        Self {
            shutdown,
            join: Some(join),
        }
    }

    /// True once the worker thread has returned on its own.
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Sleep for `interval`, waking early on shutdown. Returns `true` if the loop
/// should stop.
pub(crate) fn wait_or_shutdown(shutdown_rx: &mpsc::Receiver<()>, interval: Duration) -> bool {
    match shutdown_rx.recv_timeout(interval) {
        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => true,
        Err(mpsc::RecvTimeoutError::Timeout) => false,
    }
}
