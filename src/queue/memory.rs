//! In-process ordered log with per-group committed offsets

use super::{Batch, MessageSource, QueueRecord, StartPosition};
use crate::error::QueueError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};

#[derive(Clone)]
pub struct MemoryQueue {
    inner: Arc<Inner>,
}

struct Inner {
    log: Mutex<Vec<Vec<u8>>>,
    committed: Mutex<HashMap<String, u64>>,
    /// Current log length; consumers wait on changes.
    len_tx: watch::Sender<u64>,
    closed: AtomicBool,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        let (len_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                log: Mutex::new(Vec::new()),
                committed: Mutex::new(HashMap::new()),
                len_tx,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Appends a message and returns its offset.
    pub fn publish(&self, payload: impl Into<Vec<u8>>) -> u64 {
        let mut log = self.inner.log.lock();
        log.push(payload.into());
        let len = log.len() as u64;
        self.inner.len_tx.send_replace(len);
        len - 1
    }

    pub fn publish_json(&self, value: &serde_json::Value) -> u64 {
        self.publish(value.to_string())
    }

    /// Consumers drain what is left, then get `QueueError::Closed`.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.len_tx.send_modify(|_| {});
    }

    pub fn len(&self) -> u64 {
        *self.inner.len_tx.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn committed_offset(&self, group: &str) -> Option<u64> {
        self.inner.committed.lock().get(group).copied()
    }

    pub fn consumer(&self, group: impl Into<String>, start: StartPosition) -> MemoryConsumer {
        let group = group.into();
        let origin = match start {
            StartPosition::Earliest => 0,
            StartPosition::Latest => self.len(),
        };
        let position = self.committed_offset(&group).unwrap_or(origin);
        MemoryConsumer {
            queue: self.clone(),
            len_rx: self.inner.len_tx.subscribe(),
            group,
            origin,
            position,
        }
    }
}

pub struct MemoryConsumer {
    queue: MemoryQueue,
    len_rx: watch::Receiver<u64>,
    group: String,
    /// Start position used while the group has nothing committed.
    origin: u64,
    position: u64,
}

impl MemoryConsumer {
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn seek(&mut self, offset: u64) {
        self.position = offset;
    }

    fn take(&mut self, max_records: usize) -> Batch {
        let log = self.queue.inner.log.lock();
        let start = self.position as usize;
        let end = log.len().min(start.saturating_add(max_records.max(1)));
        let records: Vec<QueueRecord> = log
            .get(start..end)
            .unwrap_or_default()
            .iter()
            .enumerate()
            .map(|(i, payload)| QueueRecord {
                offset: (start + i) as u64,
                payload: payload.clone(),
            })
            .collect();
        self.position = end.max(start) as u64;
        Batch {
            records,
            next_offset: self.position,
        }
    }
}

#[async_trait]
impl MessageSource for MemoryConsumer {
    async fn poll(&mut self, max_records: usize, timeout: Duration) -> Result<Batch, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            let available = *self.len_rx.borrow_and_update();
            if available > self.position {
                return Ok(self.take(max_records));
            }
            if self.queue.inner.closed.load(Ordering::SeqCst) {
                return Err(QueueError::Closed);
            }
            match timeout_at(deadline, self.len_rx.changed()).await {
                Err(_) => return Ok(Batch::empty(self.position)),
                Ok(Err(_)) => return Err(QueueError::Closed),
                Ok(Ok(())) => continue,
            }
        }
    }

    async fn commit(&mut self, next_offset: u64) -> Result<(), QueueError> {
        self.queue
            .inner
            .committed
            .lock()
            .insert(self.group.clone(), next_offset);
        Ok(())
    }

    async fn rewind(&mut self) -> Result<(), QueueError> {
        self.position = self
            .queue
            .committed_offset(&self.group)
            .unwrap_or(self.origin);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("memory queue (group {})", self.group)
    }
}
