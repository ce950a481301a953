//! Connection tuning shared by every SQLite file the pipeline opens
//!
//! All databases run in WAL mode so scans and rollup reads never block the
//! ingestion writer. `synchronous=FULL` makes a committed append durable before
//! the consumer's progress marker is allowed to move past it.

use rusqlite::Connection;
use std::time::Duration;

/// How long a connection waits on a locked database before failing with SQLITE_BUSY.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub fn apply_optimized_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        log::warn!("SQLite refused WAL journal mode (got {})", mode);
    }

    conn.pragma_update(None, "synchronous", "FULL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "cache_size", -16_000i64)?;
    // These two echo the new value back as a row
    drain_pragma(conn, "PRAGMA mmap_size = 268435456")?;
    drain_pragma(conn, "PRAGMA wal_autocheckpoint = 1000")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;

    Ok(())
}

fn drain_pragma(conn: &Connection, sql: &str) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;
    while rows.next()?.is_some() {}
    Ok(())
}

/// Same tuning for a connection that must never write (scans, reports).
pub fn apply_reader_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "query_only", "ON")?;
    Ok(())
}
