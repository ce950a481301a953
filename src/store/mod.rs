//! Time-partitioned event store
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/meta.db                  store settings, rollups, consumer progress
//! <root>/chunks/chunk_<ms>.db     one SQLite file per chunk, named by its start
//! ```
//!
//! Chunks are `[start, start + width)` with `start` a multiple of `width` since
//! the epoch, so they partition the time axis without gaps or overlaps. A chunk
//! is created by the first write that falls inside it and removed only as a
//! whole by eviction.

mod chunk;
pub mod rollups;
mod scan;
pub mod schema;

pub use chunk::ChunkInfo;
pub use rollups::{
    DailyMaintenanceTrend, HourlyEnergyUsage, RollupColumn, RollupRow, RollupStore, RollupView,
    SourceField, DAILY_MAINTENANCE_TREND, HOURLY_ENERGY_USAGE,
};
pub use scan::EventScan;

use crate::error::StoreError;
use crate::event::{Event, EventKind};
use crate::pipeline::clock::Clock;
use crate::sqlite_pragma::apply_optimized_pragmas;
use chunk::ChunkHandle;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use schema::{run_schema_migrations, META_MIGRATIONS};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const META_DB: &str = "meta.db";
const CHUNK_DIR: &str = "chunks";
const CHUNK_WIDTH_KEY: &str = "chunk_width_ms";

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }

    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start < end && start < self.end
    }
}

/// Floors `t` to a multiple of `width` since the epoch.
pub fn time_bucket(t: DateTime<Utc>, width: ChronoDuration) -> DateTime<Utc> {
    let width_ms = width.num_milliseconds().max(1);
    let floored = t.timestamp_millis().div_euclid(width_ms) * width_ms;
    Utc.timestamp_millis_opt(floored).single().unwrap_or(t)
}

/// `t - d`, clamped to the earliest representable instant.
pub fn saturating_sub(t: DateTime<Utc>, d: ChronoDuration) -> DateTime<Utc> {
    t.checked_sub_signed(d).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    Inserted,
    DuplicateIgnored,
}

pub struct ChunkedStore {
    root: PathBuf,
    chunk_dir: PathBuf,
    chunk_width: ChronoDuration,
    clock: Arc<dyn Clock>,
    /// Keyed by chunk start in epoch ms.
    catalog: Mutex<BTreeMap<i64, Arc<ChunkHandle>>>,
}

impl ChunkedStore {
    /// Opens (or initializes) the store rooted at `root`.
    ///
    /// Fails with `StoreError::ChunkWidthMismatch` if the store was created with a
    /// different chunk width.
    pub fn open(
        root: impl AsRef<Path>,
        chunk_width: ChronoDuration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        let width_ms = chunk_width.num_milliseconds();
        if width_ms <= 0 {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("chunk width must be positive, got {}ms", width_ms),
            )));
        }

        let chunk_dir = root.join(CHUNK_DIR);
        std::fs::create_dir_all(&chunk_dir)?;

        let meta = Connection::open(root.join(META_DB))?;
        apply_optimized_pragmas(&meta)?;
        log::info!("🔧 Running schema migrations on {}", root.join(META_DB).display());
        run_schema_migrations(&meta, META_MIGRATIONS)?;
        check_chunk_width(&meta, width_ms)?;
        drop(meta);

        let mut catalog = BTreeMap::new();
        for entry in std::fs::read_dir(&chunk_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(start_ms) = name.to_str().and_then(chunk::parse_file_name) else {
                continue;
            };
            if start_ms.rem_euclid(width_ms) != 0 {
                log::warn!(
                    "⚠️  Ignoring chunk file {} not aligned to {}ms",
                    entry.path().display(),
                    width_ms
                );
                continue;
            }
            let info = chunk_info(&chunk_dir, start_ms, width_ms)?;
            catalog.insert(start_ms, Arc::new(ChunkHandle::existing(info)));
        }

        log::info!(
            "📦 Opened store at {} ({} chunk(s), chunk width {}s)",
            root.display(),
            catalog.len(),
            chunk_width.num_seconds()
        );

        Ok(Self {
            root,
            chunk_dir,
            chunk_width,
            clock,
            catalog: Mutex::new(catalog),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the metadata database shared with rollups and consumer offsets.
    pub fn meta_path(&self) -> PathBuf {
        self.root.join(META_DB)
    }

    pub fn chunk_width(&self) -> ChronoDuration {
        self.chunk_width
    }

    fn chunk_start_ms(&self, t: DateTime<Utc>) -> i64 {
        time_bucket(t, self.chunk_width).timestamp_millis()
    }

    /// Runs `f` on the writer connection of the chunk starting at `start_ms`,
    /// creating the chunk if needed.
    fn with_writer<T>(
        &self,
        start_ms: i64,
        mut f: impl FnMut(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        loop {
            let handle = self.chunk_for_write(start_ms)?;
            let mut writer = handle.writer.lock();
            if writer.retired {
                // Evicted between catalog lookup and lock; the next lookup recreates it
                continue;
            }
            let conn = writer.connection(&handle.info.path)?;
            return f(conn);
        }
    }

    fn chunk_for_write(&self, start_ms: i64) -> Result<Arc<ChunkHandle>, StoreError> {
        let mut catalog = self.catalog.lock();
        if let Some(handle) = catalog.get(&start_ms) {
            return Ok(Arc::clone(handle));
        }
        let info = chunk_info(
            &self.chunk_dir,
            start_ms,
            self.chunk_width.num_milliseconds(),
        )?;
        let handle = Arc::new(ChunkHandle::create(info)?);
        catalog.insert(start_ms, Arc::clone(&handle));
        Ok(handle)
    }

    /// Durably stores `event` unless an event with the same identity exists.
    pub fn append(&self, event: &Event) -> Result<AppendResult, StoreError> {
        let start_ms = self.chunk_start_ms(event.time);
        let inserted = self.with_writer(start_ms, |conn| Ok(chunk::insert_event(conn, event)?))?;
        Ok(if inserted {
            AppendResult::Inserted
        } else {
            AppendResult::DuplicateIgnored
        })
    }

    /// Appends a batch with one transaction per touched chunk.
    ///
    /// Outcomes are returned in input order. A chunk whose transaction fails
    /// reports `StoreError::ChunkWrite` for each of its events while the other
    /// chunks are still written.
    pub fn append_all(&self, events: &[Event]) -> Vec<Result<AppendResult, StoreError>> {
        let mut groups: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
        for (idx, event) in events.iter().enumerate() {
            groups
                .entry(self.chunk_start_ms(event.time))
                .or_default()
                .push(idx);
        }

        let mut outcomes: Vec<Option<Result<AppendResult, StoreError>>> =
            events.iter().map(|_| None).collect();

        for (start_ms, indices) in groups {
            let written = self.with_writer(start_ms, |conn| {
                // Take the write lock up front so a busy chunk waits out the busy timeout
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let mut results = Vec::with_capacity(indices.len());
                for &idx in &indices {
                    results.push(chunk::insert_event(&tx, &events[idx])?);
                }
                tx.commit()?;
                Ok(results)
            });

            match written {
                Ok(results) => {
                    for (&idx, inserted) in indices.iter().zip(results) {
                        outcomes[idx] = Some(Ok(if inserted {
                            AppendResult::Inserted
                        } else {
                            AppendResult::DuplicateIgnored
                        }));
                    }
                }
                Err(e) => {
                    log::warn!(
                        "⚠️  Chunk write failed for {} event(s) at {}ms: {}",
                        indices.len(),
                        start_ms,
                        e
                    );
                    let retryable = e.is_retryable();
                    let message = e.to_string();
                    for &idx in &indices {
                        outcomes[idx] = Some(Err(StoreError::ChunkWrite {
                            chunk_start_ms: start_ms,
                            message: message.clone(),
                            retryable,
                        }));
                    }
                }
            }
        }

        outcomes
            .into_iter()
            .map(|o| {
                o.unwrap_or_else(|| Err(StoreError::Task("event not assigned to a chunk".into())))
            })
            .collect()
    }

    /// Point lookup by identity; touches at most one chunk.
    pub fn get(
        &self,
        time: DateTime<Utc>,
        machine: &str,
        kind: EventKind,
    ) -> Result<Option<Event>, StoreError> {
        let start_ms = self.chunk_start_ms(time);
        let path = match self.catalog.lock().get(&start_ms) {
            Some(handle) => handle.info.path.clone(),
            None => return Ok(None),
        };
        match chunk::open_reader(&path)? {
            Some(conn) => chunk::find_event(&conn, time, machine, kind),
            None => Ok(None),
        }
    }

    /// Events in `range` (optionally of one kind), ordered by time then machine.
    ///
    /// Only chunks overlapping the range at the time of the call are visited.
    pub fn scan_range(&self, kind: Option<EventKind>, range: TimeRange) -> EventScan {
        let chunks = if range.is_empty() {
            Vec::new()
        } else {
            self.catalog
                .lock()
                .values()
                .filter(|h| range.overlaps(h.info.start, h.info.end))
                .map(|h| h.info.clone())
                .collect()
        };
        EventScan::new(chunks, kind, range)
    }

    /// Catalog listing in ascending start order.
    pub fn chunks(&self) -> Vec<ChunkInfo> {
        self.catalog
            .lock()
            .values()
            .map(|h| h.info.clone())
            .collect()
    }

    pub fn earliest_chunk_start(&self) -> Option<DateTime<Utc>> {
        self.catalog
            .lock()
            .values()
            .next()
            .map(|h| h.info.start)
    }

    /// Drops every chunk whose upper bound is at or before `now - horizon`.
    pub fn drop_chunks_older_than(
        &self,
        horizon: ChronoDuration,
    ) -> Result<Vec<ChunkInfo>, StoreError> {
        self.drop_chunks_ending_before(self.clock.now() - horizon)
    }

    /// Drops every chunk with `end <= cutoff`. Chunks straddling the cutoff stay.
    pub fn drop_chunks_ending_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ChunkInfo>, StoreError> {
        let mut dropped = Vec::new();
        // Held for the whole pass so a concurrent append cannot recreate a chunk
        // file while its predecessor is being deleted.
        let mut catalog = self.catalog.lock();
        let expired: Vec<i64> = catalog
            .iter()
            .filter(|(_, h)| h.info.end <= cutoff)
            .map(|(start, _)| *start)
            .collect();

        for start_ms in expired {
            let Some(handle) = catalog.remove(&start_ms) else {
                continue;
            };
            handle.writer.lock().retire();

            match remove_chunk_files(&handle.info.path) {
                Ok(()) => {
                    log::info!(
                        "🗑️  Dropped chunk [{}, {})",
                        handle.info.start,
                        handle.info.end
                    );
                    dropped.push(handle.info.clone());
                }
                Err(e) => {
                    log::warn!(
                        "⚠️  Failed to delete chunk {}: {} (will retry next pass)",
                        handle.info.path.display(),
                        e
                    );
                    catalog.insert(
                        start_ms,
                        Arc::new(ChunkHandle::existing(handle.info.clone())),
                    );
                }
            }
        }

        Ok(dropped)
    }

    /// `append_all` on the blocking pool, bounded by `deadline`.
    pub async fn append_all_within(
        self: &Arc<Self>,
        events: Vec<Event>,
        deadline: Duration,
    ) -> Result<Vec<Result<AppendResult, StoreError>>, StoreError> {
        let store = Arc::clone(self);
        run_blocking(deadline, move || Ok(store.append_all(&events))).await
    }

    /// Collects a whole scan on the blocking pool, bounded by `deadline`.
    pub async fn scan_collect_within(
        self: &Arc<Self>,
        kind: Option<EventKind>,
        range: TimeRange,
        deadline: Duration,
    ) -> Result<Vec<Event>, StoreError> {
        let store = Arc::clone(self);
        run_blocking(deadline, move || store.scan_range(kind, range).collect()).await
    }

    pub async fn drop_chunks_ending_before_within(
        self: &Arc<Self>,
        cutoff: DateTime<Utc>,
        deadline: Duration,
    ) -> Result<Vec<ChunkInfo>, StoreError> {
        let store = Arc::clone(self);
        run_blocking(deadline, move || store.drop_chunks_ending_before(cutoff)).await
    }
}

/// Runs blocking SQLite work off the async runtime.
///
/// On timeout the work itself keeps running to completion in the background;
/// the caller only stops waiting for it.
pub(crate) async fn run_blocking<T, F>(deadline: Duration, f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(deadline, tokio::task::spawn_blocking(f)).await {
        Err(_) => Err(StoreError::DeadlineExceeded(deadline)),
        Ok(Err(join_error)) => Err(StoreError::Task(join_error.to_string())),
        Ok(Ok(result)) => result,
    }
}

fn chunk_info(dir: &Path, start_ms: i64, width_ms: i64) -> Result<ChunkInfo, StoreError> {
    let start = Utc
        .timestamp_millis_opt(start_ms)
        .single()
        .ok_or_else(|| StoreError::InvalidRow(format!("chunk start {}ms", start_ms)))?;
    let end = Utc
        .timestamp_millis_opt(start_ms.saturating_add(width_ms))
        .single()
        .ok_or_else(|| StoreError::InvalidRow(format!("chunk end after {}ms", start_ms)))?;
    Ok(ChunkInfo {
        start,
        end,
        path: dir.join(chunk::file_name(start_ms)),
    })
}

fn check_chunk_width(meta: &Connection, width_ms: i64) -> Result<(), StoreError> {
    let stored: Option<i64> = meta
        .query_row(
            "SELECT value FROM store_meta WHERE key = ?1",
            params![CHUNK_WIDTH_KEY],
            |row| row.get(0),
        )
        .optional()?;

    match stored {
        Some(stored_ms) if stored_ms != width_ms => Err(StoreError::ChunkWidthMismatch {
            stored_ms,
            configured_ms: width_ms,
        }),
        Some(_) => Ok(()),
        None => {
            meta.execute(
                "INSERT INTO store_meta (key, value) VALUES (?1, ?2)",
                params![CHUNK_WIDTH_KEY, width_ms],
            )?;
            Ok(())
        }
    }
}

fn remove_chunk_files(path: &Path) -> std::io::Result<()> {
    remove_if_exists(path)?;
    for suffix in ["-wal", "-shm"] {
        let mut side = path.as_os_str().to_owned();
        side.push(suffix);
        remove_if_exists(Path::new(&side))?;
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
