//! Per-component counters
//!
//! Each component owns its counters and receives them at construction; the
//! coordinator reads them all into one `MetricsSnapshot`. Counters are
//! cumulative since start.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

#[derive(Debug, Default)]
pub struct IngestMetrics {
    batches: AtomicU64,
    records: AtomicU64,
    stored: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
    store_errors: AtomicU64,
    uncommitted_batches: AtomicU64,
}

impl IngestMetrics {
    pub fn record_batch(&self, summary: &super::ingestion::BatchSummary) {
        add(&self.batches, 1);
        add(&self.records, summary.records as u64);
        add(&self.stored, summary.stored as u64);
        add(&self.duplicates, summary.duplicates as u64);
        add(&self.rejected, summary.rejected as u64);
        add(&self.store_errors, summary.store_errors as u64);
    }

    pub fn record_uncommitted(&self) {
        add(&self.uncommitted_batches, 1);
    }

    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            batches: read(&self.batches),
            records: read(&self.records),
            stored: read(&self.stored),
            duplicates: read(&self.duplicates),
            rejected: read(&self.rejected),
            store_errors: read(&self.store_errors),
            uncommitted_batches: read(&self.uncommitted_batches),
        }
    }
}

#[derive(Debug, Default)]
pub struct RollupMetrics {
    refreshes: AtomicU64,
    buckets: AtomicU64,
    rows_written: AtomicU64,
    failures: AtomicU64,
}

impl RollupMetrics {
    pub fn record_refresh(&self, buckets: usize, rows: usize) {
        add(&self.refreshes, 1);
        add(&self.buckets, buckets as u64);
        add(&self.rows_written, rows as u64);
    }

    pub fn record_failure(&self) {
        add(&self.failures, 1);
    }

    pub fn snapshot(&self) -> RollupSnapshot {
        RollupSnapshot {
            refreshes: read(&self.refreshes),
            buckets: read(&self.buckets),
            rows_written: read(&self.rows_written),
            failures: read(&self.failures),
        }
    }
}

#[derive(Debug, Default)]
pub struct RetentionMetrics {
    passes: AtomicU64,
    chunks_dropped: AtomicU64,
    deferred: AtomicU64,
    failures: AtomicU64,
}

impl RetentionMetrics {
    pub fn record_pass(&self, dropped: usize) {
        add(&self.passes, 1);
        add(&self.chunks_dropped, dropped as u64);
    }

    pub fn record_deferred(&self) {
        add(&self.deferred, 1);
    }

    pub fn record_failure(&self) {
        add(&self.failures, 1);
    }

    pub fn snapshot(&self) -> RetentionSnapshot {
        RetentionSnapshot {
            passes: read(&self.passes),
            chunks_dropped: read(&self.chunks_dropped),
            deferred: read(&self.deferred),
            failures: read(&self.failures),
        }
    }
}

/// Restarts performed by a supervisor.
#[derive(Debug, Default)]
pub struct TaskMetrics {
    restarts: AtomicU64,
}

impl TaskMetrics {
    pub fn record_restart(&self) {
        add(&self.restarts, 1);
    }

    pub fn restarts(&self) -> u64 {
        read(&self.restarts)
    }
}

/// The counters of every component of one pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineMetrics {
    pub ingest: Arc<IngestMetrics>,
    pub rollups: Vec<(&'static str, Arc<RollupMetrics>)>,
    pub retention: Arc<RetentionMetrics>,
    pub tasks: Arc<TaskMetrics>,
}

impl PipelineMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ingest: self.ingest.snapshot(),
            rollups: self
                .rollups
                .iter()
                .map(|(name, m)| (name.to_string(), m.snapshot()))
                .collect(),
            retention: self.retention.snapshot(),
            task_restarts: self.tasks.restarts(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSnapshot {
    pub batches: u64,
    pub records: u64,
    pub stored: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub store_errors: u64,
    pub uncommitted_batches: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RollupSnapshot {
    pub refreshes: u64,
    pub buckets: u64,
    pub rows_written: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionSnapshot {
    pub passes: u64,
    pub chunks_dropped: u64,
    pub deferred: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub ingest: IngestSnapshot,
    pub rollups: Vec<(String, RollupSnapshot)>,
    pub retention: RetentionSnapshot,
    pub task_restarts: u64,
}

impl MetricsSnapshot {
    pub fn rollup(&self, name: &str) -> Option<RollupSnapshot> {
        self.rollups
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| *s)
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let i = &self.ingest;
        write!(
            f,
            "ingest: {} records in {} batches (stored {}, duplicates {}, rejected {}, store errors {}, uncommitted {})",
            i.records, i.batches, i.stored, i.duplicates, i.rejected, i.store_errors, i.uncommitted_batches
        )?;
        for (name, r) in &self.rollups {
            write!(
                f,
                " | {}: {} refreshes, {} rows, {} failures",
                name, r.refreshes, r.rows_written, r.failures
            )?;
        }
        let r = &self.retention;
        write!(
            f,
            " | retention: {} chunks dropped in {} passes ({} deferred, {} failures) | restarts: {}",
            r.chunks_dropped, r.passes, r.deferred, r.failures, self.task_restarts
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ingestion::BatchSummary;

    #[test]
    fn test_ingest_counters_accumulate() {
        let metrics = IngestMetrics::default();
        let summary = BatchSummary {
            records: 10,
            stored: 7,
            duplicates: 1,
            rejected: 2,
            ..BatchSummary::default()
        };
        metrics.record_batch(&summary);
        metrics.record_batch(&summary);
        metrics.record_uncommitted();

        let snap = metrics.snapshot();
        assert_eq!(snap.batches, 2);
        assert_eq!(snap.records, 20);
        assert_eq!(snap.stored, 14);
        assert_eq!(snap.rejected, 4);
        assert_eq!(snap.uncommitted_batches, 1);
    }

    #[test]
    fn test_snapshot_display_names_every_rollup() {
        let snapshot = MetricsSnapshot {
            rollups: vec![
                ("hourly_energy_usage".to_string(), RollupSnapshot::default()),
                ("daily_maintenance_trend".to_string(), RollupSnapshot::default()),
            ],
            ..MetricsSnapshot::default()
        };
        let line = snapshot.to_string();
        assert!(line.contains("hourly_energy_usage"));
        assert!(line.contains("daily_maintenance_trend"));
        assert_eq!(snapshot.rollup("missing"), None);
    }
}
