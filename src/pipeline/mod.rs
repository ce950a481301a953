//! # Ingestion and maintenance runtime
//!
//! Three activities share one `ChunkedStore`:
//!
//! - **Ingestion** (`ingestion`): polls the queue, classifies each record,
//!   appends valid events, commits progress once the whole batch is resolved.
//! - **Rollup maintenance** (`rollup`): every few minutes, folds newly closed
//!   buckets into `hourly_energy_usage` and `daily_maintenance_trend`.
//! - **Retention** (`retention`): daily, drops whole chunks past the horizon.
//!
//! None of them waits on another. Each runs under a supervisor
//! (`supervisor`) that restarts it after transient failures, and the
//! coordinator (`coordinator`) owns their lifecycle.

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod ingestion;
pub mod metrics;
pub mod retention;
pub mod rollup;
pub mod supervisor;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{PipelineConfig, RollupSchedule};
pub use coordinator::{PipelineCoordinator, PipelineHandle};
pub use ingestion::{
    shared_source, BatchSummary, ConsumerState, IngestionLoop, IngestionSettings, SharedSource,
};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use retention::{EvictionOutcome, RetentionEvictor};
pub use rollup::{RefreshOutcome, RollupMaintainer, RollupPolicy};
pub use supervisor::{supervise, ExponentialBackoff};
