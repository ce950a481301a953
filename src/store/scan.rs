use super::chunk::{open_reader, ChunkInfo, StoredRow, SELECT_COLUMNS};
use super::TimeRange;
use crate::error::StoreError;
use crate::event::{Event, EventKind};
use rusqlite::params;
use std::collections::VecDeque;

/// Lazy, time-ordered iterator over a range of the store.
///
/// The set of chunks is fixed when the scan is created. Chunks are read one at a
/// time, in ascending order, so at most one chunk's matching rows are held in
/// memory. A chunk evicted after the scan started is skipped.
pub struct EventScan {
    chunks: Vec<ChunkInfo>,
    kind: Option<EventKind>,
    range: TimeRange,
    next_chunk: usize,
    buffered: VecDeque<Event>,
    failed: bool,
}

impl EventScan {
    pub(crate) fn new(chunks: Vec<ChunkInfo>, kind: Option<EventKind>, range: TimeRange) -> Self {
        Self {
            chunks,
            kind,
            range,
            next_chunk: 0,
            buffered: VecDeque::new(),
            failed: false,
        }
    }

    /// Starts over from the first chunk of the original snapshot.
    pub fn restart(&mut self) {
        self.next_chunk = 0;
        self.buffered.clear();
        self.failed = false;
    }

    /// Chunks this scan will visit.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn range(&self) -> TimeRange {
        self.range
    }

    fn load_chunk(&self, chunk: &ChunkInfo) -> Result<VecDeque<Event>, StoreError> {
        let Some(conn) = open_reader(&chunk.path)? else {
            log::debug!("Chunk {} vanished during scan, skipping", chunk.path.display());
            return Ok(VecDeque::new());
        };

        let start = self.range.start.max(chunk.start).timestamp_millis();
        let end = self.range.end.min(chunk.end).timestamp_millis();

        let rows = match self.kind {
            Some(kind) => {
                let sql = format!(
                    "SELECT {} FROM cnc_energy_events
                     WHERE time >= ?1 AND time < ?2 AND event_type = ?3
                     ORDER BY time ASC, machine ASC",
                    SELECT_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![start, end, kind.as_str()], StoredRow::read)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM cnc_energy_events
                     WHERE time >= ?1 AND time < ?2
                     ORDER BY time ASC, machine ASC, event_type ASC",
                    SELECT_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![start, end], StoredRow::read)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };

        rows.into_iter().map(StoredRow::into_event).collect()
    }
}

impl Iterator for EventScan {
    type Item = Result<Event, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(event) = self.buffered.pop_front() {
                return Some(Ok(event));
            }
            let chunk = self.chunks.get(self.next_chunk)?.clone();
            self.next_chunk += 1;
            match self.load_chunk(&chunk) {
                Ok(events) => self.buffered = events,
                Err(e) => {
                    // Stop after the first error; `restart` clears it
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
