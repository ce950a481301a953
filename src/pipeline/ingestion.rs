//! Stream consumer: poll, classify, append, commit
//!
//! The loop cycles `Idle → Polling → Processing → Committing → Idle` until
//! shutdown. Progress is committed for a whole batch only after every record
//! in it is resolved (stored, ignored as duplicate, rejected, or failed for a
//! non-transient reason). A transient store failure leaves the batch
//! uncommitted and ends the attempt with `PipelineError::BatchNotCommitted`;
//! the next attempt rewinds the source and the batch is delivered again.
//! Redelivery is harmless because appends ignore duplicates.

use super::metrics::IngestMetrics;
use crate::error::{PipelineError, QueueError};
use crate::event::{classify_bytes, Classification};
use crate::queue::{Batch, MessageSource};
use crate::store::{AppendResult, ChunkedStore};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

/// Source shared across supervised restarts of the loop.
pub type SharedSource = Arc<AsyncMutex<Box<dyn MessageSource>>>;

pub fn shared_source(source: impl MessageSource + 'static) -> SharedSource {
    Arc::new(AsyncMutex::new(Box::new(source)))
}

const RATE_LOG_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Polling,
    Processing,
    Committing,
    Stopped,
}

/// Outcome counts for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub records: usize,
    pub stored: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub store_errors: usize,
    /// Subset of `store_errors` that may succeed on redelivery.
    pub retryable_errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestionSettings {
    pub batch_size: usize,
    pub poll_timeout: Duration,
    pub store_deadline: Duration,
}

pub struct IngestionLoop {
    source: SharedSource,
    store: Arc<ChunkedStore>,
    settings: IngestionSettings,
    metrics: Arc<IngestMetrics>,
    state: watch::Sender<ConsumerState>,
}

impl IngestionLoop {
    pub fn new(
        source: SharedSource,
        store: Arc<ChunkedStore>,
        settings: IngestionSettings,
        metrics: Arc<IngestMetrics>,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Idle);
        Self {
            source,
            store,
            settings,
            metrics,
            state,
        }
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.send_replace(state);
    }

    /// Consumes until `shutdown` fires or the source closes.
    ///
    /// Shutdown is observed while waiting on a poll. A batch already being
    /// processed runs to its commit first.
    pub async fn run(&self, shutdown: &CancellationToken) -> Result<(), PipelineError> {
        let mut source = self.source.lock().await;
        source.rewind().await?;

        log::info!("🚀 Starting ingestion from {}", source.describe());
        log::info!("   ├─ Batch size: {}", self.settings.batch_size);
        log::info!("   ├─ Poll timeout: {:?}", self.settings.poll_timeout);
        log::info!("   └─ Store deadline: {:?}", self.settings.store_deadline);

        let mut window_records = 0u64;
        let mut total_records = 0u64;
        let mut last_log_time = Instant::now();

        loop {
            self.set_state(ConsumerState::Polling);
            let batch = tokio::select! {
                _ = shutdown.cancelled() => break,
                polled = source.poll(self.settings.batch_size, self.settings.poll_timeout) => {
                    match polled {
                        Ok(batch) => batch,
                        Err(QueueError::Closed) => {
                            log::warn!("⚠️  Source closed, stopping ingestion");
                            break;
                        }
                        Err(e) => {
                            self.set_state(ConsumerState::Idle);
                            return Err(e.into());
                        }
                    }
                }
            };
            if batch.is_empty() {
                continue;
            }

            self.set_state(ConsumerState::Processing);
            let summary = match self.process_batch(&batch).await {
                Ok(summary) => summary,
                Err(e) => {
                    self.set_state(ConsumerState::Idle);
                    return Err(e);
                }
            };

            self.set_state(ConsumerState::Committing);
            if let Err(e) = source.commit(batch.next_offset).await {
                self.set_state(ConsumerState::Idle);
                self.metrics.record_uncommitted();
                return Err(e.into());
            }
            self.metrics.record_batch(&summary);
            self.set_state(ConsumerState::Idle);

            log::debug!(
                "✅ Committed batch up to {}: {} stored, {} duplicates, {} rejected, {} store errors",
                batch.next_offset,
                summary.stored,
                summary.duplicates,
                summary.rejected,
                summary.store_errors
            );

            window_records += summary.records as u64;
            total_records += summary.records as u64;
            if last_log_time.elapsed() >= RATE_LOG_INTERVAL {
                let per_sec = window_records as f64 / last_log_time.elapsed().as_secs_f64();
                log::info!(
                    "📊 Ingestion rate: {:.1} records/sec (total: {})",
                    per_sec,
                    total_records
                );
                last_log_time = Instant::now();
                window_records = 0;
            }
        }

        self.set_state(ConsumerState::Stopped);
        log::info!("✅ Ingestion stopped");
        Ok(())
    }

    /// Classifies and stores one batch. Rejections and permanent store errors
    /// are counted; any transient store error fails the batch.
    pub async fn process_batch(&self, batch: &Batch) -> Result<BatchSummary, PipelineError> {
        let mut summary = BatchSummary {
            records: batch.len(),
            ..BatchSummary::default()
        };

        let mut events = Vec::with_capacity(batch.len());
        for record in &batch.records {
            match classify_bytes(&record.payload) {
                Classification::Valid(event) => events.push(event),
                Classification::Rejected(rejected) => {
                    summary.rejected += 1;
                    log::warn!(
                        "⚠️  Rejected record at offset {}: {} ({})",
                        record.offset,
                        rejected.reason,
                        rejected.raw_snippet
                    );
                }
            }
        }

        if events.is_empty() {
            return Ok(summary);
        }
        let valid = events.len();

        let outcomes = match self
            .store
            .append_all_within(events, self.settings.store_deadline)
            .await
        {
            Ok(outcomes) => outcomes,
            Err(e) => {
                log::warn!("⚠️  Batch append failed: {}", e);
                self.metrics.record_uncommitted();
                return Err(PipelineError::BatchNotCommitted {
                    next_offset: batch.next_offset,
                    failed: valid,
                });
            }
        };

        for outcome in outcomes {
            match outcome {
                Ok(AppendResult::Inserted) => summary.stored += 1,
                Ok(AppendResult::DuplicateIgnored) => summary.duplicates += 1,
                Err(e) => {
                    summary.store_errors += 1;
                    if e.is_retryable() {
                        summary.retryable_errors += 1;
                    } else {
                        log::warn!("⚠️  Skipping record the store refused: {}", e);
                    }
                }
            }
        }

        if summary.retryable_errors > 0 {
            self.metrics.record_uncommitted();
            return Err(PipelineError::BatchNotCommitted {
                next_offset: batch.next_offset,
                failed: summary.retryable_errors,
            });
        }

        Ok(summary)
    }
}
