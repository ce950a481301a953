//! File-backed topic: one JSON message per line in `<endpoint>/<topic>.jsonl`
//!
//! Offsets are byte positions in the file. A consumer only hands out complete
//! lines, so a producer caught mid-write is never observed.

use super::{Batch, MessageSource, OffsetStore, QueueRecord, StartPosition};
use crate::error::QueueError;
use async_trait::async_trait;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::time::{sleep, Instant};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const TAIL_SCAN_BLOCK: u64 = 8 * 1024;

#[derive(Debug, Clone)]
pub struct JsonlTopic {
    topic: String,
    path: PathBuf,
}

impl JsonlTopic {
    /// Opens the topic, creating the endpoint directory and an empty log if needed.
    pub fn open(endpoint: impl AsRef<Path>, topic: &str) -> Result<Self, QueueError> {
        let endpoint = endpoint.as_ref();
        std::fs::create_dir_all(endpoint)?;
        let path = endpoint.join(format!("{}.jsonl", topic));
        OpenOptions::new().create(true).append(true).open(&path)?;
        log::info!("📥 Opened topic '{}' at {}", topic, path.display());
        Ok(Self {
            topic: topic.to_string(),
            path,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one message and returns its offset.
    pub fn publish(&self, payload: &[u8]) -> Result<u64, QueueError> {
        if payload.contains(&b'\n') {
            return Err(QueueError::InvalidPayload);
        }
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        let offset = file.seek(SeekFrom::End(0))?;
        let mut line = Vec::with_capacity(payload.len() + 1);
        line.extend_from_slice(payload);
        line.push(b'\n');
        file.write_all(&line)?;
        file.flush()?;
        Ok(offset)
    }

    pub fn publish_json(&self, value: &serde_json::Value) -> Result<u64, QueueError> {
        self.publish(value.to_string().as_bytes())
    }

    /// Creates a consumer resuming from the group's committed offset, or from
    /// `start` when the group has never committed on this topic.
    pub fn consumer(
        &self,
        group: impl Into<String>,
        offsets: OffsetStore,
        start: StartPosition,
    ) -> Result<JsonlConsumer, QueueError> {
        let group = group.into();
        let committed = match offsets.load(&group, &self.topic)? {
            Some(offset) => offset,
            None => match start {
                StartPosition::Earliest => 0,
                StartPosition::Latest => last_line_boundary(&self.path)?,
            },
        };
        log::info!(
            "📍 Consumer group '{}' starts topic '{}' at byte {}",
            group,
            self.topic,
            committed
        );
        Ok(JsonlConsumer {
            topic: self.topic.clone(),
            path: self.path.clone(),
            group,
            offsets,
            committed,
            position: committed,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }
}

/// Offset just after the last complete line.
fn last_line_boundary(path: &Path) -> Result<u64, QueueError> {
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    let mut end = len;
    let mut block = vec![0u8; TAIL_SCAN_BLOCK as usize];
    while end > 0 {
        let start = end.saturating_sub(TAIL_SCAN_BLOCK);
        let size = (end - start) as usize;
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut block[..size])?;
        if let Some(pos) = block[..size].iter().rposition(|b| *b == b'\n') {
            return Ok(start + pos as u64 + 1);
        }
        end = start;
    }
    Ok(0)
}

pub struct JsonlConsumer {
    topic: String,
    path: PathBuf,
    group: String,
    offsets: OffsetStore,
    committed: u64,
    position: u64,
    poll_interval: Duration,
}

impl JsonlConsumer {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    async fn read_available(&mut self, max_records: usize) -> Result<Vec<QueueRecord>, QueueError> {
        let file = tokio::fs::File::open(&self.path).await?;
        let len = file.metadata().await?.len();
        if len < self.position {
            log::warn!(
                "⚠️  Topic '{}' shrank to {} bytes (position {}), restarting from 0",
                self.topic,
                len,
                self.position
            );
            self.position = 0;
            self.committed = 0;
        }
        if len == self.position {
            return Ok(Vec::new());
        }

        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(self.position)).await?;

        let mut records = Vec::new();
        let mut offset = self.position;
        let mut line = Vec::new();
        while records.len() < max_records.max(1) {
            line.clear();
            let read = reader.read_until(b'\n', &mut line).await?;
            if read == 0 || line.last() != Some(&b'\n') {
                break;
            }
            let line_offset = offset;
            offset += read as u64;
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            records.push(QueueRecord {
                offset: line_offset,
                payload: line.clone(),
            });
        }
        self.position = offset;
        Ok(records)
    }
}

#[async_trait]
impl MessageSource for JsonlConsumer {
    async fn poll(&mut self, max_records: usize, timeout: Duration) -> Result<Batch, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            let records = self.read_available(max_records).await?;
            if !records.is_empty() {
                return Ok(Batch {
                    records,
                    next_offset: self.position,
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Batch::empty(self.position));
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn commit(&mut self, next_offset: u64) -> Result<(), QueueError> {
        let offsets = self.offsets.clone();
        let group = self.group.clone();
        let topic = self.topic.clone();
        tokio::task::spawn_blocking(move || offsets.save(&group, &topic, next_offset))
            .await
            .map_err(|e| QueueError::Task(e.to_string()))??;
        self.committed = next_offset;
        Ok(())
    }

    async fn rewind(&mut self) -> Result<(), QueueError> {
        self.position = self.committed;
        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "topic '{}' at {} (group {})",
            self.topic,
            self.path.display(),
            self.group
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, JsonlTopic, OffsetStore) {
        let dir = tempdir().unwrap();
        let topic = JsonlTopic::open(dir.path().join("queue"), "cnc_data").unwrap();
        let offsets = OffsetStore::open(dir.path().join("meta.db")).unwrap();
        (dir, topic, offsets)
    }

    #[tokio::test]
    async fn test_publish_and_poll() {
        let (_dir, topic, offsets) = setup();
        assert_eq!(topic.publish(b"{\"a\":1}").unwrap(), 0);
        assert_eq!(topic.publish(b"{\"a\":2}").unwrap(), 8);

        let mut consumer = topic
            .consumer("g", offsets, StartPosition::Earliest)
            .unwrap();
        let batch = consumer.poll(10, Duration::from_millis(50)).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.records[1].offset, 8);
        assert_eq!(batch.records[1].payload, b"{\"a\":2}".to_vec());
        assert_eq!(batch.next_offset, 16);
    }

    #[tokio::test]
    async fn test_rejects_multiline_payload() {
        let (_dir, topic, _offsets) = setup();
        assert!(matches!(
            topic.publish(b"{\n}"),
            Err(QueueError::InvalidPayload)
        ));
    }

    #[tokio::test]
    async fn test_partial_line_not_delivered() {
        let (_dir, topic, offsets) = setup();
        topic.publish(b"{\"a\":1}").unwrap();
        {
            let mut file = OpenOptions::new().append(true).open(topic.path()).unwrap();
            file.write_all(b"{\"a\":").unwrap();
        }

        let mut consumer = topic
            .consumer("g", offsets, StartPosition::Earliest)
            .unwrap()
            .with_poll_interval(Duration::from_millis(5));
        let batch = consumer.poll(10, Duration::from_millis(30)).await.unwrap();
        assert_eq!(batch.len(), 1);

        {
            let mut file = OpenOptions::new().append(true).open(topic.path()).unwrap();
            file.write_all(b"2}\n").unwrap();
        }
        let batch = consumer.poll(10, Duration::from_millis(30)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.records[0].payload, b"{\"a\":2}".to_vec());
    }

    #[tokio::test]
    async fn test_committed_offset_survives_restart() {
        let (_dir, topic, offsets) = setup();
        for i in 0..3 {
            topic.publish(format!("{{\"n\":{}}}", i).as_bytes()).unwrap();
        }

        let mut consumer = topic
            .consumer("g", offsets.clone(), StartPosition::Earliest)
            .unwrap();
        let first = consumer.poll(2, Duration::from_millis(10)).await.unwrap();
        consumer.commit(first.next_offset).await.unwrap();
        // Polled but never committed
        let _ = consumer.poll(2, Duration::from_millis(10)).await.unwrap();
        drop(consumer);

        let mut restarted = topic
            .consumer("g", offsets, StartPosition::Latest)
            .unwrap();
        let batch = restarted.poll(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.records[0].payload, b"{\"n\":2}".to_vec());
    }

    #[tokio::test]
    async fn test_latest_skips_history() {
        let (_dir, topic, offsets) = setup();
        topic.publish(b"{\"old\":true}").unwrap();

        let mut consumer = topic
            .consumer("g", offsets, StartPosition::Latest)
            .unwrap()
            .with_poll_interval(Duration::from_millis(5));
        assert!(consumer
            .poll(10, Duration::from_millis(20))
            .await
            .unwrap()
            .is_empty());

        topic.publish(b"{\"new\":true}").unwrap();
        let batch = consumer.poll(10, Duration::from_millis(50)).await.unwrap();
        assert_eq!(batch.records[0].payload, b"{\"new\":true}".to_vec());
    }

    #[tokio::test]
    async fn test_rewind_returns_to_commit() {
        let (_dir, topic, offsets) = setup();
        topic.publish(b"{}").unwrap();
        let mut consumer = topic
            .consumer("g", offsets, StartPosition::Earliest)
            .unwrap();

        let batch = consumer.poll(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(consumer.position(), batch.next_offset);
        consumer.rewind().await.unwrap();
        assert_eq!(consumer.position(), 0);
    }

    #[test]
    fn test_last_line_boundary_ignores_partial_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        std::fs::write(&path, b"{}\n{\"x\":").unwrap();
        assert_eq!(last_line_boundary(&path).unwrap(), 3);

        std::fs::write(&path, b"").unwrap();
        assert_eq!(last_line_boundary(&path).unwrap(), 0);
    }
}
