//! Message sources the ingestion loop consumes from
//!
//! A source hands out ordered batches and remembers, per consumer group, the
//! offset after the last committed batch. Polled-but-uncommitted records are
//! redelivered after `rewind` or a restart.

pub mod jsonl;
pub mod memory;
pub mod offsets;

pub use jsonl::{JsonlConsumer, JsonlTopic};
pub use memory::{MemoryConsumer, MemoryQueue};
pub use offsets::OffsetStore;

use crate::error::QueueError;
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRecord {
    pub offset: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub records: Vec<QueueRecord>,
    /// Offset to commit once every record of this batch is resolved.
    pub next_offset: u64,
}

impl Batch {
    pub fn empty(next_offset: u64) -> Self {
        Self {
            records: Vec::new(),
            next_offset,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// Where a consumer group without committed progress starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPosition {
    Earliest,
    #[default]
    Latest,
}

impl FromStr for StartPosition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest" => Ok(StartPosition::Earliest),
            "latest" => Ok(StartPosition::Latest),
            other => Err(format!(
                "unknown start position '{}' (expected earliest or latest)",
                other
            )),
        }
    }
}

impl fmt::Display for StartPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartPosition::Earliest => f.write_str("earliest"),
            StartPosition::Latest => f.write_str("latest"),
        }
    }
}

#[async_trait]
pub trait MessageSource: Send {
    /// Waits at most `timeout` for records; returns an empty batch on timeout.
    async fn poll(&mut self, max_records: usize, timeout: Duration) -> Result<Batch, QueueError>;

    /// Durably records that everything before `next_offset` is processed.
    async fn commit(&mut self, next_offset: u64) -> Result<(), QueueError>;

    /// Moves the read position back to the last committed offset.
    async fn rewind(&mut self) -> Result<(), QueueError>;

    fn describe(&self) -> String;
}
