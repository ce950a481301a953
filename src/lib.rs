//! cncflow: machine telemetry ingestion, time-partitioned storage and rollups
//!
//! Raw JSON telemetry from CNC machines (energy samples, maintenance samples,
//! anomaly events) is consumed from an ordered queue, validated, and stored
//! idempotently in day-sized SQLite chunks. Hourly energy and daily
//! maintenance rollups are maintained incrementally, and chunks past the
//! retention horizon are dropped whole.

pub mod error;
pub mod event;
pub mod pipeline;
pub mod queue;
pub mod sqlite_pragma;
pub mod store;

pub use error::{ConfigError, PipelineError, QueueError, StoreError};
pub use event::{classify, classify_bytes, Classification, Event, EventKind, Payload};
pub use store::{AppendResult, ChunkedStore, RollupStore, TimeRange};
