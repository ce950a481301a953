//! Pipeline configuration from environment variables

use super::rollup::RollupPolicy;
use crate::error::ConfigError;
use crate::queue::StartPosition;
use crate::store::{DAILY_MAINTENANCE_TREND, HOURLY_ENERGY_USAGE};
use chrono::Duration as ChronoDuration;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Longest duration any span setting may take (100 years).
pub const MAX_SPAN: Duration = Duration::from_secs(36_500 * 86_400);

/// Bucket width, refresh window and period of one rollup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollupSchedule {
    pub bucket_width: Duration,
    /// How far back each refresh recomputes buckets
    pub start_offset: Duration,
    pub end_offset: Duration,
    pub refresh_interval: Duration,
}

/// Configuration for the pipeline runtime
///
/// Loaded from environment variables with defaults matching a production
/// deployment (one-day chunks, 90-day retention, hourly and daily rollups).
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Directory holding `<topic>.jsonl`
    pub queue_path: PathBuf,
    pub topic: String,
    pub consumer_group: String,
    pub start_position: StartPosition,

    /// Store root (chunk files and `meta.db`)
    pub store_path: PathBuf,
    pub chunk_width: Duration,

    pub retention_horizon: Duration,
    pub retention_interval: Duration,

    pub batch_size: usize,
    pub poll_timeout: Duration,
    /// Deadline for a single store operation
    pub store_deadline: Duration,
    /// How long shutdown waits for the in-flight batch
    pub shutdown_grace: Duration,
    pub metrics_interval: Duration,

    pub energy_rollup: RollupSchedule,
    pub maintenance_rollup: RollupSchedule,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_path: PathBuf::from("/var/lib/cncflow/queue"),
            topic: "cnc_data".to_string(),
            consumer_group: "cncflow-store-group".to_string(),
            start_position: StartPosition::Latest,
            store_path: PathBuf::from("/var/lib/cncflow/store"),
            chunk_width: Duration::from_secs(86_400),
            retention_horizon: Duration::from_secs(90 * 86_400),
            retention_interval: Duration::from_secs(86_400),
            batch_size: 500,
            poll_timeout: Duration::from_millis(3_000),
            store_deadline: Duration::from_millis(5_000),
            shutdown_grace: Duration::from_millis(10_000),
            metrics_interval: Duration::from_secs(10),
            energy_rollup: RollupSchedule {
                bucket_width: Duration::from_secs(3_600),
                start_offset: Duration::from_secs(7 * 86_400),
                end_offset: Duration::from_secs(180),
                refresh_interval: Duration::from_secs(180),
            },
            maintenance_rollup: RollupSchedule {
                bucket_width: Duration::from_secs(86_400),
                start_offset: Duration::from_secs(60 * 86_400),
                end_offset: Duration::from_secs(300),
                refresh_interval: Duration::from_secs(300),
            },
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `CNCFLOW_QUEUE_PATH` (default: /var/lib/cncflow/queue)
    /// - `CNCFLOW_QUEUE_TOPIC` (default: cnc_data)
    /// - `CNCFLOW_CONSUMER_GROUP` (default: cncflow-store-group)
    /// - `CNCFLOW_START_POSITION` (default: latest)
    /// - `CNCFLOW_STORE_PATH` (default: /var/lib/cncflow/store)
    /// - `CNCFLOW_CHUNK_WIDTH_SECS` (default: 86400)
    /// - `CNCFLOW_RETENTION_DAYS` (default: 90)
    /// - `CNCFLOW_RETENTION_INTERVAL_SECS` (default: 86400)
    /// - `CNCFLOW_BATCH_SIZE` (default: 500)
    /// - `CNCFLOW_POLL_TIMEOUT_MS` (default: 3000)
    /// - `CNCFLOW_STORE_DEADLINE_MS` (default: 5000)
    /// - `CNCFLOW_SHUTDOWN_GRACE_MS` (default: 10000)
    /// - `CNCFLOW_METRICS_INTERVAL_SECS` (default: 10)
    /// - `ENERGY_ROLLUP_{BUCKET,START_OFFSET,END_OFFSET,INTERVAL}_SECS`
    ///   (default: 3600/604800/180/180)
    /// - `MAINTENANCE_ROLLUP_{BUCKET,START_OFFSET,END_OFFSET,INTERVAL}_SECS`
    ///   (default: 86400/5184000/300/300)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env` with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let vars = Vars(&lookup);

        let config = Self {
            queue_path: vars.string("CNCFLOW_QUEUE_PATH").map(PathBuf::from).unwrap_or(d.queue_path),
            topic: vars.string("CNCFLOW_QUEUE_TOPIC").unwrap_or(d.topic),
            consumer_group: vars.string("CNCFLOW_CONSUMER_GROUP").unwrap_or(d.consumer_group),
            start_position: vars.parse("CNCFLOW_START_POSITION")?.unwrap_or(d.start_position),
            store_path: vars.string("CNCFLOW_STORE_PATH").map(PathBuf::from).unwrap_or(d.store_path),
            chunk_width: vars.secs("CNCFLOW_CHUNK_WIDTH_SECS")?.unwrap_or(d.chunk_width),
            retention_horizon: vars
                .parse::<u64>("CNCFLOW_RETENTION_DAYS")?
                .map(|days| Duration::from_secs(days.saturating_mul(86_400)))
                .unwrap_or(d.retention_horizon),
            retention_interval: vars
                .secs("CNCFLOW_RETENTION_INTERVAL_SECS")?
                .unwrap_or(d.retention_interval),
            batch_size: vars.parse("CNCFLOW_BATCH_SIZE")?.unwrap_or(d.batch_size),
            poll_timeout: vars.millis("CNCFLOW_POLL_TIMEOUT_MS")?.unwrap_or(d.poll_timeout),
            store_deadline: vars.millis("CNCFLOW_STORE_DEADLINE_MS")?.unwrap_or(d.store_deadline),
            shutdown_grace: vars.millis("CNCFLOW_SHUTDOWN_GRACE_MS")?.unwrap_or(d.shutdown_grace),
            metrics_interval: vars
                .secs("CNCFLOW_METRICS_INTERVAL_SECS")?
                .unwrap_or(d.metrics_interval),
            energy_rollup: vars.schedule("ENERGY_ROLLUP", d.energy_rollup)?,
            maintenance_rollup: vars.schedule("MAINTENANCE_ROLLUP", d.maintenance_rollup)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("CNCFLOW_CHUNK_WIDTH_SECS", self.chunk_width),
            ("CNCFLOW_RETENTION_DAYS", self.retention_horizon),
            ("CNCFLOW_RETENTION_INTERVAL_SECS", self.retention_interval),
            ("CNCFLOW_POLL_TIMEOUT_MS", self.poll_timeout),
            ("CNCFLOW_STORE_DEADLINE_MS", self.store_deadline),
            ("CNCFLOW_METRICS_INTERVAL_SECS", self.metrics_interval),
            ("ENERGY_ROLLUP_BUCKET_SECS", self.energy_rollup.bucket_width),
            ("ENERGY_ROLLUP_INTERVAL_SECS", self.energy_rollup.refresh_interval),
            ("MAINTENANCE_ROLLUP_BUCKET_SECS", self.maintenance_rollup.bucket_width),
            ("MAINTENANCE_ROLLUP_INTERVAL_SECS", self.maintenance_rollup.refresh_interval),
        ];
        for (name, value) in positive {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue(format!("{} must be greater than zero", name)));
            }
        }
        let spans = [
            ("CNCFLOW_CHUNK_WIDTH_SECS", self.chunk_width),
            ("CNCFLOW_RETENTION_DAYS", self.retention_horizon),
            ("ENERGY_ROLLUP_BUCKET_SECS", self.energy_rollup.bucket_width),
            ("ENERGY_ROLLUP_START_OFFSET_SECS", self.energy_rollup.start_offset),
            ("ENERGY_ROLLUP_END_OFFSET_SECS", self.energy_rollup.end_offset),
            ("MAINTENANCE_ROLLUP_BUCKET_SECS", self.maintenance_rollup.bucket_width),
            ("MAINTENANCE_ROLLUP_START_OFFSET_SECS", self.maintenance_rollup.start_offset),
            ("MAINTENANCE_ROLLUP_END_OFFSET_SECS", self.maintenance_rollup.end_offset),
        ];
        for (name, value) in spans {
            if value > MAX_SPAN {
                return Err(ConfigError::InvalidValue(format!(
                    "{} must not exceed {} days",
                    name,
                    MAX_SPAN.as_secs() / 86_400
                )));
            }
        }
        for (prefix, schedule) in [
            ("ENERGY_ROLLUP", self.energy_rollup),
            ("MAINTENANCE_ROLLUP", self.maintenance_rollup),
        ] {
            // The window must reach back past the newest closed bucket
            if schedule.start_offset < schedule.end_offset + schedule.bucket_width {
                return Err(ConfigError::InvalidValue(format!(
                    "{}_START_OFFSET_SECS must be at least END_OFFSET + BUCKET",
                    prefix
                )));
            }
        }
        if self.chunk_width.subsec_nanos() != 0 {
            return Err(ConfigError::InvalidValue(
                "CNCFLOW_CHUNK_WIDTH_SECS must be a whole number of seconds".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue(
                "CNCFLOW_BATCH_SIZE must be greater than zero".to_string(),
            ));
        }
        if self.topic.trim().is_empty() {
            return Err(ConfigError::InvalidValue("CNCFLOW_QUEUE_TOPIC must not be empty".to_string()));
        }
        if self.consumer_group.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "CNCFLOW_CONSUMER_GROUP must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn chunk_width_chrono(&self) -> Result<ChronoDuration, ConfigError> {
        to_chrono("CNCFLOW_CHUNK_WIDTH_SECS", self.chunk_width)
    }

    pub fn retention_horizon_chrono(&self) -> Result<ChronoDuration, ConfigError> {
        to_chrono("CNCFLOW_RETENTION_DAYS", self.retention_horizon)
    }

    /// Both rollup definitions with their configured schedules.
    pub fn rollup_policies(&self) -> Result<Vec<RollupPolicy>, ConfigError> {
        Ok(vec![
            RollupPolicy {
                view: HOURLY_ENERGY_USAGE,
                bucket_width: to_chrono("ENERGY_ROLLUP_BUCKET_SECS", self.energy_rollup.bucket_width)?,
                start_offset: to_chrono(
                    "ENERGY_ROLLUP_START_OFFSET_SECS",
                    self.energy_rollup.start_offset,
                )?,
                end_offset: to_chrono("ENERGY_ROLLUP_END_OFFSET_SECS", self.energy_rollup.end_offset)?,
                refresh_interval: self.energy_rollup.refresh_interval,
            },
            RollupPolicy {
                view: DAILY_MAINTENANCE_TREND,
                bucket_width: to_chrono(
                    "MAINTENANCE_ROLLUP_BUCKET_SECS",
                    self.maintenance_rollup.bucket_width,
                )?,
                start_offset: to_chrono(
                    "MAINTENANCE_ROLLUP_START_OFFSET_SECS",
                    self.maintenance_rollup.start_offset,
                )?,
                end_offset: to_chrono(
                    "MAINTENANCE_ROLLUP_END_OFFSET_SECS",
                    self.maintenance_rollup.end_offset,
                )?,
                refresh_interval: self.maintenance_rollup.refresh_interval,
            },
        ])
    }
}

fn to_chrono(name: &str, value: Duration) -> Result<ChronoDuration, ConfigError> {
    ChronoDuration::from_std(value)
        .map_err(|_| ConfigError::InvalidValue(format!("{} is out of range", name)))
}

struct Vars<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse().map(Some).map_err(|e| {
                ConfigError::InvalidValue(format!("{}='{}': {}", key, raw, e))
            }),
        }
    }

    fn secs(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_secs))
    }

    fn millis(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }

    fn schedule(&self, prefix: &str, default: RollupSchedule) -> Result<RollupSchedule, ConfigError> {
        Ok(RollupSchedule {
            bucket_width: self
                .secs(&format!("{}_BUCKET_SECS", prefix))?
                .unwrap_or(default.bucket_width),
            start_offset: self
                .secs(&format!("{}_START_OFFSET_SECS", prefix))?
                .unwrap_or(default.start_offset),
            end_offset: self
                .secs(&format!("{}_END_OFFSET_SECS", prefix))?
                .unwrap_or(default.end_offset),
            refresh_interval: self
                .secs(&format!("{}_INTERVAL_SECS", prefix))?
                .unwrap_or(default.refresh_interval),
        })
    }
}
