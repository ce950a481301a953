//! Durable consumer progress, stored in the store's `meta.db`

use crate::error::QueueError;
use crate::sqlite_pragma::apply_optimized_pragmas;
use crate::store::schema::{run_schema_migrations, META_MIGRATIONS};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

#[derive(Clone)]
pub struct OffsetStore {
    conn: Arc<Mutex<Connection>>,
}

impl OffsetStore {
    pub fn open(meta_path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let conn = Connection::open(meta_path)?;
        apply_optimized_pragmas(&conn)?;
        run_schema_migrations(&conn, META_MIGRATIONS)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn load(&self, group: &str, topic: &str) -> Result<Option<u64>, QueueError> {
        let conn = self.conn.lock();
        let offset: Option<i64> = conn
            .query_row(
                "SELECT next_offset FROM consumer_offsets WHERE consumer_group = ?1 AND topic = ?2",
                params![group, topic],
                |row| row.get(0),
            )
            .optional()?;
        Ok(offset.map(|o| u64::try_from(o).unwrap_or(0)))
    }

    pub fn save(&self, group: &str, topic: &str, next_offset: u64) -> Result<(), QueueError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO consumer_offsets (consumer_group, topic, next_offset, committed_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(consumer_group, topic) DO UPDATE SET
                 next_offset = excluded.next_offset,
                 committed_at = excluded.committed_at",
            params![
                group,
                topic,
                i64::try_from(next_offset).unwrap_or(i64::MAX),
                Utc::now().timestamp_millis()
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_offsets_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta.db");
        {
            let offsets = OffsetStore::open(&path).unwrap();
            assert_eq!(offsets.load("group-a", "cnc_data").unwrap(), None);
            offsets.save("group-a", "cnc_data", 128).unwrap();
            offsets.save("group-a", "cnc_data", 256).unwrap();
            offsets.save("group-b", "cnc_data", 7).unwrap();
        }

        let offsets = OffsetStore::open(&path).unwrap();
        assert_eq!(offsets.load("group-a", "cnc_data").unwrap(), Some(256));
        assert_eq!(offsets.load("group-b", "cnc_data").unwrap(), Some(7));
        assert_eq!(offsets.load("group-a", "other").unwrap(), None);
    }
}
