//! Periodic eviction of chunks past the retention horizon

use super::clock::Clock;
use super::metrics::RetentionMetrics;
use super::rollup::RollupPolicy;
use crate::error::PipelineError;
use crate::store::{run_blocking, saturating_sub, ChunkInfo, ChunkedStore, RollupStore};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvictionOutcome {
    Evicted {
        cutoff: DateTime<Utc>,
        dropped: Vec<ChunkInfo>,
    },
    /// A rollup has never been materialized, so no raw data may go yet.
    Deferred { rollup: &'static str },
}

pub struct RetentionEvictor {
    store: Arc<ChunkedStore>,
    rollups: RollupStore,
    /// Eviction never runs ahead of these watermarks or into their refresh windows.
    policies: Vec<RollupPolicy>,
    horizon: ChronoDuration,
    period: Duration,
    clock: Arc<dyn Clock>,
    metrics: Arc<RetentionMetrics>,
    store_deadline: Duration,
}

impl RetentionEvictor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<ChunkedStore>,
        rollups: RollupStore,
        policies: Vec<RollupPolicy>,
        horizon: ChronoDuration,
        period: Duration,
        clock: Arc<dyn Clock>,
        metrics: Arc<RetentionMetrics>,
        store_deadline: Duration,
    ) -> Self {
        Self {
            store,
            rollups,
            policies,
            horizon,
            period,
            clock,
            metrics,
            store_deadline,
        }
    }

    /// One eviction pass: drops chunks ending at or before
    /// `now - horizon`, clamped so that no chunk a rollup still has to read
    /// (before its watermark or inside its refresh window) is dropped.
    pub async fn evict_once(&self) -> Result<EvictionOutcome, PipelineError> {
        let now = self.clock.now();
        let mut cutoff = saturating_sub(now, self.horizon);

        for policy in &self.policies {
            cutoff = cutoff.min(policy.window_start(now));
            let rollups = self.rollups.clone();
            let view = policy.view;
            let watermark =
                run_blocking(self.store_deadline, move || rollups.watermark(&view)).await?;
            match watermark {
                Some(w) => cutoff = cutoff.min(w),
                None if self.store.earliest_chunk_start().is_none() => {}
                None => {
                    self.metrics.record_deferred();
                    return Ok(EvictionOutcome::Deferred { rollup: view.name });
                }
            }
        }

        let dropped = self
            .store
            .drop_chunks_ending_before_within(cutoff, self.store_deadline)
            .await?;
        self.metrics.record_pass(dropped.len());
        Ok(EvictionOutcome::Evicted { cutoff, dropped })
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), PipelineError> {
        log::info!(
            "🚀 Starting retention evictor (horizon {} days, every {:?})",
            self.horizon.num_days(),
            self.period
        );

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    match self.evict_once().await {
                        Ok(EvictionOutcome::Evicted { cutoff, dropped }) => {
                            if dropped.is_empty() {
                                log::debug!("Retention pass: nothing ends before {}", cutoff);
                            } else {
                                log::info!("🗑️  Retention dropped {} chunk(s) ending before {}", dropped.len(), cutoff);
                            }
                        }
                        Ok(EvictionOutcome::Deferred { rollup }) => {
                            log::info!("⏸️  Retention deferred: {} has no watermark yet", rollup);
                        }
                        Err(e) => {
                            self.metrics.record_failure();
                            log::warn!("⚠️  Retention pass failed, will retry next period: {}", e);
                        }
                    }
                }
            }
        }
    }
}
