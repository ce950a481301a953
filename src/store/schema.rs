//! Embedded SQL schema
//!
//! The `.sql` files under `sql/` are compiled into the binary and applied in
//! file-name order. Every statement uses `IF NOT EXISTS`, so re-running them on
//! an existing database is a no-op.

use rusqlite::Connection;

pub struct Migration {
    pub name: &'static str,
    pub sql: &'static str,
}

/// Applied to every chunk file when it is created.
pub const CHUNK_SCHEMA: Migration = Migration {
    name: "01_chunk_events.sql",
    sql: include_str!("../../sql/01_chunk_events.sql"),
};

/// Applied to `meta.db` (store settings, rollups, consumer progress).
pub const META_MIGRATIONS: &[Migration] = &[
    Migration {
        name: "02_store_meta.sql",
        sql: include_str!("../../sql/02_store_meta.sql"),
    },
    Migration {
        name: "03_rollups.sql",
        sql: include_str!("../../sql/03_rollups.sql"),
    },
    Migration {
        name: "04_consumer_offsets.sql",
        sql: include_str!("../../sql/04_consumer_offsets.sql"),
    },
];

pub fn run_schema_migrations(conn: &Connection, migrations: &[Migration]) -> rusqlite::Result<()> {
    for migration in migrations {
        log::debug!("   ├─ Executing: {}", migration.name);
        conn.execute_batch(migration.sql)?;
    }
    log::debug!("   └─ ✅ {} schema migration(s) applied", migrations.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<String>, _>>()
            .unwrap()
    }

    #[test]
    fn test_meta_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_schema_migrations(&conn, META_MIGRATIONS).unwrap();
        run_schema_migrations(&conn, META_MIGRATIONS).unwrap();

        assert_eq!(
            table_names(&conn),
            vec![
                "consumer_offsets",
                "daily_maintenance_trend",
                "hourly_energy_usage",
                "rollup_watermarks",
                "store_meta",
            ]
        );
    }

    #[test]
    fn test_chunk_schema_rejects_unknown_event_type() {
        let conn = Connection::open_in_memory().unwrap();
        run_schema_migrations(&conn, &[CHUNK_SCHEMA]).unwrap();

        let result = conn.execute(
            "INSERT INTO cnc_energy_events (time, machine, event_type) VALUES (1, 'M1', 'SPINDLE_STOP')",
            [],
        );
        assert!(result.is_err());
    }
}
