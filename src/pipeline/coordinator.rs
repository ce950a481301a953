//! Pipeline lifecycle
//!
//! `PipelineCoordinator::open` acquires every resource up front (store,
//! rollup tables, topic, consumer progress), so a bad configuration or an
//! unreachable store fails before anything runs. `start` then spawns the
//! ingestion loop and the periodic tasks, each under a supervisor.
//!
//! Shutdown order: ingestion first (its in-flight batch gets `shutdown_grace`
//! to commit, then is abandoned uncommitted), then the maintenance tasks and
//! the metrics reporter.

use super::clock::Clock;
use super::config::PipelineConfig;
use super::ingestion::{
    shared_source, ConsumerState, IngestionLoop, IngestionSettings, SharedSource,
};
use super::metrics::{MetricsSnapshot, PipelineMetrics, RetentionMetrics, RollupMetrics};
use super::retention::RetentionEvictor;
use super::rollup::RollupMaintainer;
use super::supervisor::{supervise, ExponentialBackoff};
use crate::error::PipelineError;
use crate::queue::{JsonlTopic, OffsetStore};
use crate::store::{ChunkedStore, RollupStore};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub struct PipelineCoordinator {
    config: PipelineConfig,
    store: Arc<ChunkedStore>,
    rollups: RollupStore,
    source: SharedSource,
    clock: Arc<dyn Clock>,
}

fn fatal(what: &str, e: impl std::fmt::Display) -> PipelineError {
    PipelineError::FatalConfiguration(format!("{}: {}", what, e))
}

impl PipelineCoordinator {
    pub fn new(
        config: PipelineConfig,
        store: Arc<ChunkedStore>,
        rollups: RollupStore,
        source: SharedSource,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            rollups,
            source,
            clock,
        }
    }

    /// Opens the store and the configured topic. Every failure here is fatal.
    pub fn open(config: PipelineConfig, clock: Arc<dyn Clock>) -> Result<Self, PipelineError> {
        config.validate()?;

        let store = ChunkedStore::open(&config.store_path, config.chunk_width_chrono()?, clock.clone())
            .map_err(|e| fatal("cannot open store", e))?;
        let rollups = RollupStore::open(store.meta_path())
            .map_err(|e| fatal("cannot open rollup tables", e))?;
        let offsets = OffsetStore::open(store.meta_path())
            .map_err(|e| fatal("cannot open consumer offsets", e))?;
        let topic = JsonlTopic::open(&config.queue_path, &config.topic)
            .map_err(|e| fatal("cannot open topic", e))?;
        let consumer = topic
            .consumer(config.consumer_group.clone(), offsets, config.start_position)
            .map_err(|e| fatal("cannot create consumer", e))?;

        Ok(Self::new(
            config,
            Arc::new(store),
            rollups,
            shared_source(consumer),
            clock,
        ))
    }

    pub fn store(&self) -> &Arc<ChunkedStore> {
        &self.store
    }

    pub fn rollups(&self) -> &RollupStore {
        &self.rollups
    }

    /// Spawns all tasks. Must be called from within a tokio runtime.
    pub fn start(self) -> Result<PipelineHandle, PipelineError> {
        let config = &self.config;
        let policies = config.rollup_policies()?;
        let horizon = config.retention_horizon_chrono()?;

        let ingest_token = CancellationToken::new();
        let maintenance_token = CancellationToken::new();
        let (fatal_tx, fatal_rx) = mpsc::channel(8);

        let metrics = PipelineMetrics {
            rollups: policies
                .iter()
                .map(|p| (p.view.name, Arc::new(RollupMetrics::default())))
                .collect(),
            retention: Arc::new(RetentionMetrics::default()),
            ..PipelineMetrics::default()
        };

        log::info!("🚀 Starting pipeline");
        log::info!("   ├─ Store: {}", self.store.root().display());
        log::info!("   ├─ Chunk width: {:?}", config.chunk_width);
        log::info!("   ├─ Retention: {} days", horizon.num_days());
        log::info!("   └─ Rollups: {}", policies.len());

        // Ingestion
        let ingestion = Arc::new(IngestionLoop::new(
            self.source.clone(),
            self.store.clone(),
            IngestionSettings {
                batch_size: config.batch_size,
                poll_timeout: config.poll_timeout,
                store_deadline: config.store_deadline,
            },
            metrics.ingest.clone(),
        ));
        let ingestion_state = ingestion.subscribe_state();
        let ingestion_task = {
            let token = ingest_token.clone();
            spawn_supervised(
                "ingestion",
                ingest_token.clone(),
                &metrics,
                fatal_tx.clone(),
                move || {
                    let ingestion = ingestion.clone();
                    let token = token.clone();
                    async move { ingestion.run(&token).await }
                },
            )
        };

        let mut maintenance = Vec::new();

        // Rollups
        for (policy, (_, rollup_metrics)) in policies.iter().copied().zip(metrics.rollups.iter()) {
            let maintainer = Arc::new(RollupMaintainer::new(
                policy,
                self.store.clone(),
                self.rollups.clone(),
                self.clock.clone(),
                rollup_metrics.clone(),
                config.store_deadline,
            ));
            let token = maintenance_token.clone();
            maintenance.push(spawn_supervised(
                policy.view.name,
                maintenance_token.clone(),
                &metrics,
                fatal_tx.clone(),
                move || {
                    let maintainer = maintainer.clone();
                    let token = token.clone();
                    async move { maintainer.run(token).await }
                },
            ));
        }

        // Retention
        let evictor = Arc::new(RetentionEvictor::new(
            self.store.clone(),
            self.rollups.clone(),
            policies,
            horizon,
            config.retention_interval,
            self.clock.clone(),
            metrics.retention.clone(),
            config.store_deadline,
        ));
        {
            let token = maintenance_token.clone();
            maintenance.push(spawn_supervised(
                "retention",
                maintenance_token.clone(),
                &metrics,
                fatal_tx.clone(),
                move || {
                    let evictor = evictor.clone();
                    let token = token.clone();
                    async move { evictor.run(token).await }
                },
            ));
        }

        // Periodic metrics line
        maintenance.push(spawn_reporter(
            metrics.clone(),
            config.metrics_interval,
            maintenance_token.clone(),
        ));

        log::info!("✅ All pipeline tasks running");

        Ok(PipelineHandle {
            ingest_token,
            maintenance_token,
            ingestion: ingestion_task,
            maintenance,
            fatal_rx,
            metrics,
            ingestion_state,
            shutdown_grace: config.shutdown_grace,
        })
    }
}

fn spawn_supervised<F, Fut>(
    name: &'static str,
    shutdown: CancellationToken,
    metrics: &PipelineMetrics,
    fatal_tx: mpsc::Sender<PipelineError>,
    make_task: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), PipelineError>> + Send + 'static,
{
    let restarts = metrics.tasks.clone();
    tokio::spawn(async move {
        let result = supervise(
            name,
            shutdown,
            ExponentialBackoff::default(),
            restarts,
            make_task,
        )
        .await;
        if let Err(e) = result {
            let _ = fatal_tx.send(e).await;
        }
    })
}

fn spawn_reporter(
    metrics: PipelineMetrics,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => log::info!("📊 {}", metrics.snapshot()),
            }
        }
    })
}

/// Running pipeline.
pub struct PipelineHandle {
    ingest_token: CancellationToken,
    maintenance_token: CancellationToken,
    ingestion: JoinHandle<()>,
    maintenance: Vec<JoinHandle<()>>,
    fatal_rx: mpsc::Receiver<PipelineError>,
    metrics: PipelineMetrics,
    ingestion_state: watch::Receiver<ConsumerState>,
    shutdown_grace: Duration,
}

impl PipelineHandle {
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn ingestion_state(&self) -> ConsumerState {
        *self.ingestion_state.borrow()
    }

    /// Resolves when a task fails fatally. Pending forever otherwise.
    pub async fn fatal_error(&mut self) -> PipelineError {
        match self.fatal_rx.recv().await {
            Some(e) => e,
            None => std::future::pending().await,
        }
    }

    /// Stops every task and returns the final counters.
    pub async fn shutdown(mut self) -> MetricsSnapshot {
        log::info!("🛑 Shutting down pipeline...");

        self.ingest_token.cancel();
        match timeout(self.shutdown_grace, &mut self.ingestion).await {
            Ok(_) => log::info!("   ├─ Ingestion drained"),
            Err(_) => {
                log::warn!(
                    "   ├─ ⚠️  Ingestion did not finish within {:?}; in-flight batch left uncommitted",
                    self.shutdown_grace
                );
                self.ingestion.abort();
                let _ = (&mut self.ingestion).await;
            }
        }

        self.maintenance_token.cancel();
        for mut task in self.maintenance.drain(..) {
            if timeout(self.shutdown_grace, &mut task).await.is_err() {
                task.abort();
                let _ = task.await;
            }
        }
        log::info!("   └─ Maintenance tasks stopped");

        let snapshot = self.metrics.snapshot();
        log::info!("📊 Final metrics: {}", snapshot);
        log::info!("✅ Pipeline stopped");
        snapshot
    }
}
