use std::io;
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use tracing::{info, warn};

use reportflow_events::{CompletionEvent, InMemoryEventBus};
use reportflow_infra::{
    cache::{InMemoryResultCache, ResultCache},
    collaborators::{ArtifactRenderer, ReportComputer},
    completion::CompletionDetector,
    config::PipelineConfig,
    derive::DerivedArtifactPipeline,
    jobs::{InMemoryJobStatusStore, JobStatusStore},
    operator::Operator,
    queue::{DeadLetterQueue, InMemoryQueue, MessageQueue},
    scheduler::Scheduler,
    workers::{DeadLetterListener, DerivationTrigger, Worker, WorkerHandle, WorkerPool, WorkerPoolHandle},
};

#[cfg(feature = "redis")]
use reportflow_infra::{
    cache::PostgresResultCache,
    jobs::PostgresJobStatusStore,
    queue::{RedisStreamsQueue, RedisStreamsQueueConfig},
};
#[cfg(feature = "redis")]
use sqlx::PgPool;

/// Completion notifications stay in-process: the bus only links the detector
/// to the derivation trigger.
pub type CompletionBus = Arc<InMemoryEventBus<CompletionEvent>>;

/// The two external worker functions.
#[derive(Clone)]
pub struct Collaborators {
    pub computer: Arc<dyn ReportComputer>,
    pub renderer: Arc<dyn ArtifactRenderer>,
}

/// Storage and queue backends, type-erased.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn JobStatusStore>,
    pub queue: Arc<dyn MessageQueue>,
    pub dead_letters: Arc<dyn DeadLetterQueue>,
    pub cache: Arc<dyn ResultCache>,
}

impl Backends {
    pub fn in_memory(config: &PipelineConfig) -> Self {
        let queue = InMemoryQueue::arc(config.queue_config());
        Self {
            store: InMemoryJobStatusStore::arc(),
            queue: queue.clone(),
            dead_letters: queue,
            cache: InMemoryResultCache::arc(),
        }
    }

    /// Postgres for jobs and results, Redis Streams for the queue. Must run
    /// inside the tokio runtime whose handle the adapters will block on.
    #[cfg(feature = "redis")]
    pub async fn persistent(
        config: &PipelineConfig,
        database_url: &str,
        redis_url: &str,
    ) -> anyhow::Result<Self> {
        use anyhow::Context;

        let pool = PgPool::connect(database_url)
            .await
            .context("failed to connect to Postgres")?;
        sqlx::raw_sql(include_str!("../../../../migrations/0001_reportflow.sql"))
            .execute(&pool)
            .await
            .context("failed to apply schema")?;

        let runtime = tokio::runtime::Handle::current();
        let consumer = format!("reportflow-{}", std::process::id());
        let queue = Arc::new(
            RedisStreamsQueue::connect(redis_url, RedisStreamsQueueConfig::new(consumer, config.queue_config()))
                .context("failed to connect to Redis")?,
        );

        Ok(Self {
            store: Arc::new(PostgresJobStatusStore::new(pool.clone(), runtime.clone())),
            queue: queue.clone(),
            dead_letters: queue,
            cache: Arc::new(PostgresResultCache::new(pool, runtime)),
        })
    }
}

/// Pick backends from `USE_PERSISTENT_STORES`, `DATABASE_URL` and `REDIS_URL`.
pub async fn build_backends(config: &PipelineConfig) -> anyhow::Result<Backends> {
    let use_persistent = std::env::var("USE_PERSISTENT_STORES")
        .unwrap_or_else(|_| "false".to_string())
        .parse::<bool>()
        .unwrap_or(false);

    if use_persistent {
        #[cfg(feature = "redis")]
        {
            let database_url = std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set when USE_PERSISTENT_STORES=true"))?;
            let redis_url =
                std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
            return Backends::persistent(config, &database_url, &redis_url).await;
        }
        #[cfg(not(feature = "redis"))]
        {
            warn!("USE_PERSISTENT_STORES=true but redis feature not enabled, falling back to in-memory");
        }
    }

    Ok(Backends::in_memory(config))
}

/// Everything the handlers and background threads need.
pub struct AppServices {
    pub config: PipelineConfig,
    pub backends: Backends,
    pub scheduler: Scheduler,
    pub operator: Operator,
    pub detector: Arc<CompletionDetector<CompletionBus>>,
    pub derive: Arc<DerivedArtifactPipeline>,
    pub bus: CompletionBus,
    worker: Arc<Worker>,
    watches: Mutex<Vec<WorkerHandle>>,
}

impl AppServices {
    pub fn new(config: PipelineConfig, backends: Backends, collaborators: Collaborators) -> Self {
        let Backends {
            store,
            queue,
            dead_letters,
            cache,
        } = backends.clone();
        let bus: CompletionBus = Arc::new(InMemoryEventBus::new());

        Self {
            scheduler: Scheduler::new(store.clone(), queue.clone(), config.job_ttl),
            operator: Operator::new(
                store.clone(),
                queue.clone(),
                dead_letters.clone(),
                config.pending_grace,
            ),
            detector: Arc::new(CompletionDetector::new(store.clone(), bus.clone())),
            derive: Arc::new(DerivedArtifactPipeline::new(
                cache.clone(),
                store.clone(),
                collaborators.renderer,
                config.derive_config(),
            )),
            worker: Arc::new(Worker::new(
                store,
                queue,
                dead_letters,
                cache,
                collaborators.computer,
                config.retry_policy(),
            )),
            bus,
            backends,
            config,
            watches: Mutex::new(Vec::new()),
        }
    }

    /// Start the worker pool, the DLQ listener and the derivation trigger,
    /// then resume completion watches for batches still open in the store.
    pub fn start_background(&self) -> io::Result<Background> {
        let pool = WorkerPool::spawn(self.worker.clone(), self.config.worker_config())?;
        let listener = DeadLetterListener::new(
            self.backends.store.clone(),
            self.backends.dead_letters.clone(),
        )
        .spawn(self.config.completion_poll)?;
        let trigger = DerivationTrigger::spawn(&self.bus, self.derive.clone())?;
        info!(workers = pool.size(), "background components started");
        self.resume_watches();
        Ok(Background {
            pool,
            listener,
            trigger,
        })
    }

    /// Watch every batch whose completion event has not gone out yet, e.g.
    /// batches scheduled before a restart. Returns how many were resumed.
    pub fn resume_watches(&self) -> usize {
        let open = match self.backends.store.open_batches() {
            Ok(dates) => dates,
            Err(e) => {
                warn!(error = %e, "failed to list open batches; completion watches not resumed");
                return 0;
            }
        };
        for date in &open {
            self.watch_batch(*date);
        }
        if !open.is_empty() {
            info!(batches = open.len(), "resumed completion watches");
        }
        open.len()
    }

    /// Poll `batch_date` for completion until it settles.
    pub fn watch_batch(&self, batch_date: NaiveDate) {
        let handle = match self
            .detector
            .clone()
            .spawn_watch(batch_date, self.config.completion_poll)
        {
            Ok(h) => h,
            Err(e) => {
                warn!(batch_date = %batch_date, error = %e, "failed to start completion watch");
                return;
            }
        };
        if let Ok(mut watches) = self.watches.lock() {
            watches.retain(|w| !w.is_finished());
            watches.push(handle);
        }
    }

    pub fn stop_watches(&self) {
        let drained: Vec<WorkerHandle> = match self.watches.lock() {
            Ok(mut w) => w.drain(..).collect(),
            Err(_) => return,
        };
        for watch in drained {
            watch.shutdown();
        }
    }
}

/// Long-running threads owned by the process.
#[derive(Debug)]
pub struct Background {
    pub pool: WorkerPoolHandle,
    listener: WorkerHandle,
    trigger: WorkerHandle,
}

impl Background {
    pub fn shutdown(self) {
        self.pool.shutdown();
        self.listener.shutdown();
        self.trigger.shutdown();
    }
}
