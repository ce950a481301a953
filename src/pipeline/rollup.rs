//! Incremental rollup maintenance
//!
//! Each cycle recomputes a window of buckets from the store:
//!
//! 1. `new_watermark = floor(now - end_offset, bucket_width)`; buckets at or
//!    after it may still receive data and are left alone.
//! 2. The window starts at `floor(now - start_offset, bucket_width)`, or at
//!    the old watermark when the rollup is further behind. Late events that
//!    land inside the window are folded in on the next cycle.
//! 3. Every bucket of the window is recomputed from a scan of the store, one
//!    bucket at a time.
//! 4. The rows and the new watermark are written in a single transaction.
//!
//! A failed or interrupted cycle writes nothing, and the same range is
//! retried on the next tick. Events older than `start_offset` when they
//! arrive are stored but no longer change the rollup.

use super::clock::Clock;
use super::metrics::RollupMetrics;
use crate::error::PipelineError;
use crate::event::Event;
use crate::store::{
    run_blocking, saturating_sub, time_bucket, ChunkedStore, RollupRow, RollupStore, RollupView,
    TimeRange,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollupPolicy {
    pub view: RollupView,
    pub bucket_width: ChronoDuration,
    /// Buckets newer than `now - start_offset` are recomputed on every cycle.
    pub start_offset: ChronoDuration,
    pub end_offset: ChronoDuration,
    pub refresh_interval: Duration,
}

impl RollupPolicy {
    /// First bucket of the re-refresh window at `now`.
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        time_bucket(saturating_sub(now, self.start_offset), self.bucket_width)
    }

    /// End of the closed buckets at `now`.
    pub fn closed_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        time_bucket(saturating_sub(now, self.end_offset), self.bucket_width)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Store is empty and the rollup has never been materialized.
    NoData,
    /// The refresh window is empty.
    UpToDate { watermark: DateTime<Utc> },
    Refreshed {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        buckets: usize,
        rows: usize,
    },
    /// Shutdown arrived mid-cycle; nothing was written.
    Interrupted,
}

#[derive(Debug, Default, Clone, Copy)]
struct Mean {
    sum: f64,
    count: u64,
}

impl Mean {
    fn push(&mut self, value: Option<f64>) {
        if let Some(v) = value {
            self.sum += v;
            self.count += 1;
        }
    }

    /// `None` when no event carried the field.
    fn value(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Per-machine means of `view`'s columns over `events`, ordered by machine.
fn aggregate_bucket(view: &RollupView, bucket: DateTime<Utc>, events: &[Event]) -> Vec<RollupRow> {
    let mut per_machine: BTreeMap<&str, Vec<Mean>> = BTreeMap::new();
    for event in events.iter().filter(|e| e.kind() == view.kind) {
        let means = per_machine
            .entry(event.machine.as_str())
            .or_insert_with(|| vec![Mean::default(); view.columns.len()]);
        for (mean, column) in means.iter_mut().zip(view.columns) {
            mean.push(column.source.value(event));
        }
    }

    per_machine
        .into_iter()
        .map(|(machine, means)| RollupRow {
            bucket,
            machine: machine.to_string(),
            values: means.iter().map(Mean::value).collect(),
        })
        .collect()
}

pub struct RollupMaintainer {
    policy: RollupPolicy,
    store: Arc<ChunkedStore>,
    rollups: RollupStore,
    clock: Arc<dyn Clock>,
    metrics: Arc<RollupMetrics>,
    store_deadline: Duration,
}

impl RollupMaintainer {
    pub fn new(
        policy: RollupPolicy,
        store: Arc<ChunkedStore>,
        rollups: RollupStore,
        clock: Arc<dyn Clock>,
        metrics: Arc<RollupMetrics>,
        store_deadline: Duration,
    ) -> Self {
        Self {
            policy,
            store,
            rollups,
            clock,
            metrics,
            store_deadline,
        }
    }

    pub fn name(&self) -> &'static str {
        self.policy.view.name
    }

    /// One refresh cycle.
    pub async fn refresh(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<RefreshOutcome, PipelineError> {
        let view = self.policy.view;
        let width = self.policy.bucket_width;
        let now = self.clock.now();
        let new_watermark = self.policy.closed_until(now);

        let Some(earliest) = self.store.earliest_chunk_start().map(|t| time_bucket(t, width))
        else {
            return Ok(RefreshOutcome::NoData);
        };
        let rollups = self.rollups.clone();
        let stored = run_blocking(self.store_deadline, move || rollups.watermark(&view)).await?;
        let old_watermark = stored.unwrap_or(earliest);

        // Buckets before the earliest chunk have no source events left to recompute from
        let from = old_watermark.min(self.policy.window_start(now).max(earliest));
        if from >= new_watermark {
            return Ok(RefreshOutcome::UpToDate {
                watermark: old_watermark,
            });
        }

        let range = TimeRange::new(from, new_watermark);
        let chunks = self.store.chunks();
        let mut rows = Vec::new();
        let mut buckets = 0usize;
        let mut bucket = from;

        while bucket < new_watermark {
            if shutdown.is_cancelled() {
                log::info!("⏸️  {} refresh interrupted by shutdown", view.name);
                return Ok(RefreshOutcome::Interrupted);
            }

            let bucket_range = TimeRange::new(bucket, bucket + width);
            if chunks
                .iter()
                .any(|c| bucket_range.overlaps(c.start, c.end))
            {
                let events = self
                    .store
                    .scan_collect_within(Some(view.kind), bucket_range, self.store_deadline)
                    .await?;
                rows.extend(aggregate_bucket(&view, bucket, &events));
            }
            buckets += 1;
            bucket = bucket + width;
        }

        let watermark = new_watermark.max(old_watermark);
        let refreshed_at = self.clock.now();
        let row_count = rows.len();
        let rollups = self.rollups.clone();
        run_blocking(self.store_deadline, move || {
            rollups.apply_refresh(&view, range, &rows, watermark, refreshed_at)
        })
        .await?;

        self.metrics.record_refresh(buckets, row_count);
        Ok(RefreshOutcome::Refreshed {
            from,
            to: new_watermark,
            buckets,
            rows: row_count,
        })
    }

    /// Refreshes on every tick until shutdown. The first tick fires immediately,
    /// which performs the initial materialization at startup.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), PipelineError> {
        log::info!(
            "🚀 Starting {} maintainer (bucket {}s, window {}s..{}s, every {:?})",
            self.name(),
            self.policy.bucket_width.num_seconds(),
            self.policy.start_offset.num_seconds(),
            self.policy.end_offset.num_seconds(),
            self.policy.refresh_interval
        );

        let mut ticker = interval(self.policy.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    match self.refresh(&shutdown).await {
                        Ok(RefreshOutcome::Refreshed { from, to, buckets, rows }) => {
                            log::info!(
                                "📊 {} refreshed [{}, {}): {} bucket(s), {} row(s)",
                                self.name(), from, to, buckets, rows
                            );
                        }
                        Ok(outcome) => log::debug!("{}: {:?}", self.name(), outcome),
                        Err(e) => {
                            self.metrics.record_failure();
                            log::warn!("⚠️  {} refresh failed, will retry next cycle: {}", self.name(), e);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EnergyReading, MaintenanceReading, Payload};
    use crate::pipeline::clock::ManualClock;
    use crate::store::{DAILY_MAINTENANCE_TREND, HOURLY_ENERGY_USAGE};
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    fn energy(t: DateTime<Utc>, machine: &str, kwh: Option<f64>, current: Option<f64>) -> Event {
        Event::new(
            t,
            machine,
            Payload::Energy(EnergyReading {
                energy_kwh: kwh,
                current_a: current,
                ..EnergyReading::default()
            }),
        )
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<ChunkedStore>,
        rollups: RollupStore,
        clock: Arc<ManualClock>,
        metrics: Arc<RollupMetrics>,
    }

    fn fixture(now: DateTime<Utc>) -> Fixture {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(now));
        let store = Arc::new(
            ChunkedStore::open(dir.path(), ChronoDuration::days(1), clock.clone()).unwrap(),
        );
        let rollups = RollupStore::open(store.meta_path()).unwrap();
        Fixture {
            _dir: dir,
            store,
            rollups,
            clock,
            metrics: Arc::new(RollupMetrics::default()),
        }
    }

    fn hourly(f: &Fixture) -> RollupMaintainer {
        RollupMaintainer::new(
            RollupPolicy {
                view: HOURLY_ENERGY_USAGE,
                bucket_width: ChronoDuration::hours(1),
                start_offset: ChronoDuration::days(7),
                end_offset: ChronoDuration::minutes(3),
                refresh_interval: Duration::from_secs(180),
            },
            f.store.clone(),
            f.rollups.clone(),
            f.clock.clone(),
            f.metrics.clone(),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_mean_skips_absent_values() {
        let events = vec![
            energy(at(10, 5), "M1", Some(5.0), None),
            energy(at(10, 40), "M1", Some(7.0), None),
            energy(at(10, 41), "M2", None, Some(3.0)),
        ];
        let rows = aggregate_bucket(&HOURLY_ENERGY_USAGE, at(10, 0), &events);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].machine, "M1");
        assert_eq!(rows[0].values, vec![Some(6.0), None]);
        assert_eq!(rows[1].values, vec![None, Some(3.0)]);
    }

    #[tokio::test]
    async fn test_hourly_rollup_after_bucket_closes() {
        let f = fixture(at(10, 50));
        f.store.append(&energy(at(10, 5), "M1", Some(5.0), Some(10.0))).unwrap();
        f.store.append(&energy(at(10, 40), "M1", Some(7.0), None)).unwrap();
        let maintainer = hourly(&f);
        let token = CancellationToken::new();

        // Bucket 10:00 is still open
        maintainer.refresh(&token).await.unwrap();
        let range = TimeRange::new(at(0, 0), at(23, 0));
        assert!(f.rollups.hourly_energy_usage(range, None).unwrap().is_empty());

        // Closed, but the end offset has not elapsed yet
        f.clock.set(at(11, 2));
        maintainer.refresh(&token).await.unwrap();
        assert!(f.rollups.hourly_energy_usage(range, None).unwrap().is_empty());

        f.clock.set(at(11, 3));
        let outcome = maintainer.refresh(&token).await.unwrap();
        assert!(matches!(outcome, RefreshOutcome::Refreshed { rows: 1, .. }));

        let rows = f.rollups.hourly_energy_usage(range, Some("M1")).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].bucket, at(10, 0));
        assert_eq!(rows[0].avg_kwh, Some(6.0));
        assert_eq!(rows[0].avg_current, Some(10.0));
        assert_eq!(
            f.rollups.watermark(&HOURLY_ENERGY_USAGE).unwrap(),
            Some(at(11, 0))
        );

        // Nothing new closed: the window is recomputed, the row is unchanged
        assert!(matches!(
            maintainer.refresh(&token).await.unwrap(),
            RefreshOutcome::Refreshed { rows: 1, .. }
        ));
        let rows = f.rollups.hourly_energy_usage(range, Some("M1")).unwrap();
        assert_eq!(rows[0].avg_kwh, Some(6.0));
    }

    #[tokio::test]
    async fn test_late_event_corrects_materialized_bucket() {
        // Test: an event stored after its bucket was materialized is folded in next cycle
        let f = fixture(at(11, 3));
        let maintainer = hourly(&f);
        let token = CancellationToken::new();
        let range = TimeRange::new(at(10, 0), at(11, 0));

        f.store.append(&energy(at(10, 5), "M1", Some(5.0), None)).unwrap();
        maintainer.refresh(&token).await.unwrap();
        let rows = f.rollups.hourly_energy_usage(range, Some("M1")).unwrap();
        assert_eq!(rows[0].avg_kwh, Some(5.0));

        f.store.append(&energy(at(10, 40), "M1", Some(7.0), None)).unwrap();
        f.store.append(&energy(at(10, 50), "M2", Some(1.0), None)).unwrap();
        f.clock.set(at(11, 6));
        maintainer.refresh(&token).await.unwrap();

        let rows = f.rollups.hourly_energy_usage(range, None).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].machine, "M1");
        assert_eq!(rows[0].avg_kwh, Some(6.0));
        assert_eq!(rows[1].avg_kwh, Some(1.0));
        assert_eq!(
            f.rollups.watermark(&HOURLY_ENERGY_USAGE).unwrap(),
            Some(at(11, 0))
        );
    }

    #[tokio::test]
    async fn test_events_older_than_window_are_not_folded_in() {
        // Test: the re-refresh window bounds how far back a cycle recomputes
        let f = fixture(at(11, 3));
        let maintainer = RollupMaintainer::new(
            RollupPolicy {
                start_offset: ChronoDuration::hours(2),
                ..hourly(&f).policy
            },
            f.store.clone(),
            f.rollups.clone(),
            f.clock.clone(),
            f.metrics.clone(),
            Duration::from_secs(5),
        );
        let token = CancellationToken::new();

        f.store.append(&energy(at(10, 5), "M1", Some(5.0), None)).unwrap();
        maintainer.refresh(&token).await.unwrap();

        // At 14:00 the window would start at 12:00; catching up starts at the 11:00 watermark
        f.clock.set(at(14, 0));
        f.store.append(&energy(at(10, 40), "M1", Some(7.0), None)).unwrap();
        let outcome = maintainer.refresh(&token).await.unwrap();
        assert!(matches!(
            outcome,
            RefreshOutcome::Refreshed { from, buckets: 2, .. } if from == at(11, 0)
        ));

        let rows = f
            .rollups
            .hourly_energy_usage(TimeRange::new(at(10, 0), at(11, 0)), Some("M1"))
            .unwrap();
        assert_eq!(rows[0].avg_kwh, Some(5.0));
    }

    #[test]
    fn test_window_bounds() {
        let policy = RollupPolicy {
            view: HOURLY_ENERGY_USAGE,
            bucket_width: ChronoDuration::hours(1),
            start_offset: ChronoDuration::days(7),
            end_offset: ChronoDuration::minutes(3),
            refresh_interval: Duration::from_secs(180),
        };
        assert_eq!(policy.closed_until(at(11, 2)), at(10, 0));
        assert_eq!(policy.closed_until(at(11, 3)), at(11, 0));
        assert_eq!(
            policy.window_start(at(11, 30)),
            at(11, 0) - ChronoDuration::days(7)
        );
        // Saturates instead of overflowing
        let far = RollupPolicy {
            start_offset: ChronoDuration::milliseconds(i64::MAX),
            ..policy
        };
        assert_eq!(far.window_start(at(11, 30)), DateTime::<Utc>::MIN_UTC);
    }

    #[tokio::test]
    async fn test_empty_store_records_no_watermark() {
        let f = fixture(at(12, 0));
        let outcome = hourly(&f).refresh(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::NoData);
        assert_eq!(f.rollups.watermark(&HOURLY_ENERGY_USAGE).unwrap(), None);
    }

    #[tokio::test]
    async fn test_catch_up_spans_several_buckets() {
        let f = fixture(at(15, 30));
        f.store.append(&energy(at(9, 15), "M1", Some(1.0), None)).unwrap();
        f.store.append(&energy(at(12, 15), "M2", Some(2.0), None)).unwrap();
        f.store.append(&energy(at(15, 10), "M2", Some(9.0), None)).unwrap();

        let outcome = hourly(&f).refresh(&CancellationToken::new()).await.unwrap();
        // Starts at the earliest chunk (midnight), stops before 15:00
        assert_eq!(
            outcome,
            RefreshOutcome::Refreshed {
                from: at(0, 0),
                to: at(15, 0),
                buckets: 15,
                rows: 2,
            }
        );
        assert_eq!(f.metrics.snapshot().rows_written, 2);
    }

    #[tokio::test]
    async fn test_interrupted_refresh_writes_nothing() {
        let f = fixture(at(15, 30));
        f.store.append(&energy(at(9, 15), "M1", Some(1.0), None)).unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let outcome = hourly(&f).refresh(&token).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Interrupted);
        assert_eq!(f.rollups.watermark(&HOURLY_ENERGY_USAGE).unwrap(), None);
    }

    #[tokio::test]
    async fn test_daily_maintenance_trend() {
        let f = fixture(at(23, 0));
        for (t, vib, temp) in [
            (at(1, 0), Some(0.2), Some(60.0)),
            (at(13, 0), Some(0.4), None),
        ] {
            f.store
                .append(&Event::new(
                    t,
                    "M1",
                    Payload::Maintenance(MaintenanceReading {
                        spindle_vibration_mm: vib,
                        bearing_temp: temp,
                        ..MaintenanceReading::default()
                    }),
                ))
                .unwrap();
        }
        let maintainer = RollupMaintainer::new(
            RollupPolicy {
                view: DAILY_MAINTENANCE_TREND,
                bucket_width: ChronoDuration::days(1),
                start_offset: ChronoDuration::days(60),
                end_offset: ChronoDuration::minutes(5),
                refresh_interval: Duration::from_secs(300),
            },
            f.store.clone(),
            f.rollups.clone(),
            f.clock.clone(),
            f.metrics.clone(),
            Duration::from_secs(5),
        );
        let token = CancellationToken::new();

        maintainer.refresh(&token).await.unwrap();
        let range = TimeRange::new(at(0, 0), at(0, 0) + ChronoDuration::days(2));
        assert!(f.rollups.daily_maintenance_trend(range, None).unwrap().is_empty());

        f.clock.set(at(0, 0) + ChronoDuration::days(1) + ChronoDuration::minutes(5));
        maintainer.refresh(&token).await.unwrap();
        let rows = f.rollups.daily_maintenance_trend(range, None).unwrap();
        assert_eq!(rows.len(), 1);
        assert!((rows[0].avg_vibration.unwrap() - 0.3).abs() < 1e-9);
        assert_eq!(rows[0].avg_temperature, Some(60.0));
    }
}
