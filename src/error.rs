//! Error types shared across the pipeline
//!
//! Record-level problems (malformed JSON, unknown discriminators) are not errors
//! here: the classifier turns them into `RejectedRecord` values. These types
//! cover configuration, storage and transport failures.

use rusqlite::ErrorCode;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store operation exceeded its {0:?} deadline")]
    DeadlineExceeded(Duration),

    #[error("Write to chunk starting at {chunk_start_ms}ms failed: {message}")]
    ChunkWrite {
        chunk_start_ms: i64,
        message: String,
        retryable: bool,
    },

    #[error("Store was created with {stored_ms}ms chunks but {configured_ms}ms is configured")]
    ChunkWidthMismatch { stored_ms: i64, configured_ms: i64 },

    #[error("Invalid stored row: {0}")]
    InvalidRow(String),

    #[error("Blocking store task failed: {0}")]
    Task(String),
}

impl StoreError {
    /// Transient failures: the same operation may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::DeadlineExceeded(_) | StoreError::Io(_) | StoreError::Task(_) => true,
            StoreError::ChunkWrite { retryable, .. } => *retryable,
            StoreError::Database(err) => is_transient_sqlite(err),
            StoreError::ChunkWidthMismatch { .. } | StoreError::InvalidRow(_) => false,
        }
    }
}

pub(crate) fn is_transient_sqlite(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy)
            | Some(ErrorCode::DatabaseLocked)
            | Some(ErrorCode::SystemIoFailure)
            | Some(ErrorCode::CannotOpen)
            | Some(ErrorCode::DiskFull)
            | Some(ErrorCode::OutOfMemory)
    )
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Offset store error: {0}")]
    Offsets(#[from] rusqlite::Error),

    #[error("Payload contains a line break and cannot be published to a JSONL topic")]
    InvalidPayload,

    #[error("Queue is closed")]
    Closed,

    #[error("Offset task failed: {0}")]
    Task(String),
}

impl QueueError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, QueueError::Closed | QueueError::InvalidPayload)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Fatal configuration error: {0}")]
    FatalConfiguration(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Batch ending at offset {next_offset} left uncommitted: {failed} record(s) hit a transient store error")]
    BatchNotCommitted { next_offset: u64, failed: usize },

    #[error("Task {0} exhausted its restart budget")]
    RetriesExhausted(&'static str),
}

impl PipelineError {
    /// Fatal errors terminate the process instead of being retried by a supervisor.
    pub fn is_fatal(&self) -> bool {
        match self {
            PipelineError::FatalConfiguration(_)
            | PipelineError::Config(_)
            | PipelineError::RetriesExhausted(_) => true,
            PipelineError::Store(err) => matches!(err, StoreError::ChunkWidthMismatch { .. }),
            PipelineError::Queue(err) => !err.is_retryable(),
            PipelineError::BatchNotCommitted { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(StoreError::DeadlineExceeded(Duration::from_millis(5)).is_retryable());
        assert!(!StoreError::InvalidRow("bad kind".to_string()).is_retryable());
        assert!(!StoreError::ChunkWidthMismatch {
            stored_ms: 1,
            configured_ms: 2
        }
        .is_retryable());

        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(StoreError::Database(busy).is_retryable());

        assert!(QueueError::Io(std::io::Error::other("gone")).is_retryable());
        assert!(!QueueError::Closed.is_retryable());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(PipelineError::FatalConfiguration("store unreachable".into()).is_fatal());
        assert!(PipelineError::from(StoreError::ChunkWidthMismatch {
            stored_ms: 1,
            configured_ms: 2
        })
        .is_fatal());
        assert!(!PipelineError::from(StoreError::DeadlineExceeded(Duration::ZERO)).is_fatal());
        assert!(!PipelineError::BatchNotCommitted {
            next_offset: 10,
            failed: 1
        }
        .is_fatal());

        // A closed queue cannot be recovered by restarting the consumer
        assert!(PipelineError::from(QueueError::Closed).is_fatal());
        assert!(PipelineError::from(QueueError::InvalidPayload).is_fatal());
        assert!(!PipelineError::from(QueueError::Io(std::io::Error::other("gone"))).is_fatal());
        assert!(!PipelineError::from(QueueError::Task("join".to_string())).is_fatal());
    }
}
