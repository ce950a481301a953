//! One chunk: a SQLite file holding every event inside a fixed time range
//!
//! Each chunk owns its own writer connection behind its own lock, so appends to
//! different chunks never contend. Readers open short-lived query-only
//! connections and never take the writer lock.

use super::schema::{run_schema_migrations, CHUNK_SCHEMA};
use crate::error::StoreError;
use crate::event::{
    AnomalyReport, Context, EnergyReading, Event, EventKind, MaintenanceReading, Payload,
};
use crate::sqlite_pragma::{apply_optimized_pragmas, apply_reader_pragmas};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::path::{Path, PathBuf};

const FILE_PREFIX: &str = "chunk_";
const FILE_SUFFIX: &str = ".db";

pub(crate) const SELECT_COLUMNS: &str = "time, machine, event_type, \
     energy_kwh, current_a, voltage_v, power_factor, \
     maintenance_due_hours, tool_usage_minutes, spindle_vibration_mm, bearing_temp, \
     anomaly_type, anomaly_value, \
     plant, energy_zone, maintenance_team, maintenance_interval, machine_category";

const INSERT_SQL: &str = "INSERT INTO cnc_energy_events (
        time, machine, event_type,
        energy_kwh, current_a, voltage_v, power_factor,
        maintenance_due_hours, tool_usage_minutes, spindle_vibration_mm, bearing_temp,
        anomaly_type, anomaly_value,
        plant, energy_zone, maintenance_team, maintenance_interval, machine_category
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
    ON CONFLICT (time, machine, event_type) DO NOTHING";

/// Catalog entry for a chunk covering `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub path: PathBuf,
}

pub(crate) fn file_name(start_ms: i64) -> String {
    format!("{}{}{}", FILE_PREFIX, start_ms, FILE_SUFFIX)
}

/// Parses `chunk_<start_ms>.db`; WAL side files and anything else yield `None`.
pub(crate) fn parse_file_name(name: &str) -> Option<i64> {
    name.strip_prefix(FILE_PREFIX)?
        .strip_suffix(FILE_SUFFIX)?
        .parse()
        .ok()
}

pub(crate) struct ChunkHandle {
    pub info: ChunkInfo,
    pub writer: Mutex<ChunkWriter>,
}

pub(crate) struct ChunkWriter {
    conn: Option<Connection>,
    /// Set once the chunk has been evicted; the handle must not be written again.
    pub retired: bool,
}

impl ChunkHandle {
    /// Creates the file and its schema immediately.
    pub fn create(info: ChunkInfo) -> Result<Self, StoreError> {
        let conn = open_writer(&info.path)?;
        log::info!(
            "🧱 Created chunk [{}, {}) at {}",
            info.start,
            info.end,
            info.path.display()
        );
        Ok(Self {
            info,
            writer: Mutex::new(ChunkWriter {
                conn: Some(conn),
                retired: false,
            }),
        })
    }

    /// A chunk found on disk; its connection is opened on first write.
    pub fn existing(info: ChunkInfo) -> Self {
        Self {
            info,
            writer: Mutex::new(ChunkWriter {
                conn: None,
                retired: false,
            }),
        }
    }
}

impl ChunkWriter {
    pub fn connection(&mut self, path: &Path) -> Result<&mut Connection, StoreError> {
        if self.conn.is_none() {
            self.conn = Some(open_writer(path)?);
        }
        self.conn
            .as_mut()
            .ok_or_else(|| StoreError::Task("chunk writer connection unavailable".to_string()))
    }

    /// Closes the connection and marks the chunk as gone.
    pub fn retire(&mut self) {
        self.retired = true;
        if let Some(conn) = self.conn.take() {
            if let Err((_, e)) = conn.close() {
                log::warn!("⚠️  Failed to close chunk connection cleanly: {}", e);
            }
        }
    }
}

fn open_writer(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    apply_optimized_pragmas(&conn)?;
    run_schema_migrations(&conn, &[CHUNK_SCHEMA])?;
    Ok(conn)
}

/// Query-only connection to an existing chunk. Returns `None` when the file is
/// gone (evicted after the caller took its catalog snapshot).
pub(crate) fn open_reader(path: &Path) -> Result<Option<Connection>, StoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX
        | OpenFlags::SQLITE_OPEN_URI;
    match Connection::open_with_flags(path, flags) {
        Ok(conn) => {
            apply_reader_pragmas(&conn)?;
            Ok(Some(conn))
        }
        Err(e) if e.sqlite_error_code() == Some(rusqlite::ErrorCode::CannotOpen) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Inserts one event; `true` when a row was written, `false` for a duplicate.
pub(crate) fn insert_event(conn: &Connection, event: &Event) -> rusqlite::Result<bool> {
    let (energy, maintenance, anomaly) = match &event.payload {
        Payload::Energy(e) => (Some(e), None, None),
        Payload::Maintenance(m) => (None, Some(m), None),
        Payload::Anomaly(a) => (None, None, Some(a)),
    };
    let ctx = &event.context;

    let changed = conn.prepare_cached(INSERT_SQL)?.execute(params![
        event.time.timestamp_millis(),
        event.machine,
        event.kind().as_str(),
        energy.and_then(|e| e.energy_kwh),
        energy.and_then(|e| e.current_a),
        energy.and_then(|e| e.voltage_v),
        energy.and_then(|e| e.power_factor),
        maintenance.and_then(|m| m.maintenance_due_hours),
        maintenance.and_then(|m| m.tool_usage_minutes),
        maintenance.and_then(|m| m.spindle_vibration_mm),
        maintenance.and_then(|m| m.bearing_temp),
        anomaly.and_then(|a| a.anomaly_type.as_deref()),
        anomaly.and_then(|a| a.anomaly_value),
        ctx.plant,
        ctx.energy_zone,
        ctx.maintenance_team,
        ctx.maintenance_interval,
        ctx.machine_category,
    ])?;
    Ok(changed > 0)
}

pub(crate) fn find_event(
    conn: &Connection,
    time: DateTime<Utc>,
    machine: &str,
    kind: EventKind,
) -> Result<Option<Event>, StoreError> {
    let sql = format!(
        "SELECT {} FROM cnc_energy_events WHERE time = ?1 AND machine = ?2 AND event_type = ?3",
        SELECT_COLUMNS
    );
    let row = conn
        .query_row(
            &sql,
            params![time.timestamp_millis(), machine, kind.as_str()],
            StoredRow::read,
        )
        .optional()?;
    row.map(StoredRow::into_event).transpose()
}

/// Raw column values of one stored row, decoded into an `Event` afterwards so
/// that schema problems surface as `StoreError::InvalidRow`.
pub(crate) struct StoredRow {
    time_ms: i64,
    machine: String,
    event_type: String,
    reals: [Option<f64>; 9],
    anomaly_type: Option<String>,
    context: Context,
}

impl StoredRow {
    /// Expects the columns in `SELECT_COLUMNS` order.
    pub fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            time_ms: row.get(0)?,
            machine: row.get(1)?,
            event_type: row.get(2)?,
            reals: [
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
                row.get(8)?,
                row.get(9)?,
                row.get(10)?,
                row.get(12)?,
            ],
            anomaly_type: row.get(11)?,
            context: Context {
                plant: row.get(13)?,
                energy_zone: row.get(14)?,
                maintenance_team: row.get(15)?,
                maintenance_interval: row.get(16)?,
                machine_category: row.get(17)?,
            },
        })
    }

    pub fn into_event(self) -> Result<Event, StoreError> {
        let kind = EventKind::from_discriminator(&self.event_type)
            .ok_or_else(|| StoreError::InvalidRow(format!("event_type {}", self.event_type)))?;
        let time = Utc
            .timestamp_millis_opt(self.time_ms)
            .single()
            .ok_or_else(|| StoreError::InvalidRow(format!("time {}", self.time_ms)))?;
        let r = self.reals;
        let payload = match kind {
            EventKind::EnergySample => Payload::Energy(EnergyReading {
                energy_kwh: r[0],
                current_a: r[1],
                voltage_v: r[2],
                power_factor: r[3],
            }),
            EventKind::MaintenanceSample => Payload::Maintenance(MaintenanceReading {
                maintenance_due_hours: r[4],
                tool_usage_minutes: r[5],
                spindle_vibration_mm: r[6],
                bearing_temp: r[7],
            }),
            EventKind::AnomalyDetected => Payload::Anomaly(AnomalyReport {
                anomaly_type: self.anomaly_type,
                anomaly_value: r[8],
            }),
        };
        Ok(Event {
            time,
            machine: self.machine,
            payload,
            context: self.context,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_name_parsing() {
        assert_eq!(parse_file_name(&file_name(86_400_000)), Some(86_400_000));
        assert_eq!(parse_file_name(&file_name(-86_400_000)), Some(-86_400_000));
        assert_eq!(parse_file_name("chunk_86400000.db-wal"), None);
        assert_eq!(parse_file_name("chunk_86400000.db-shm"), None);
        assert_eq!(parse_file_name("meta.db"), None);
    }

    #[test]
    fn test_insert_and_find_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(file_name(0));
        let conn = open_writer(&path).unwrap();

        let time = Utc.timestamp_millis_opt(1_000).unwrap();
        let event = Event::new(
            time,
            "CNC-07",
            Payload::Anomaly(AnomalyReport {
                anomaly_type: Some("POWER_SPIKE".to_string()),
                anomaly_value: Some(17.5),
            }),
        )
        .with_context(Context {
            plant: Some("Plant-B".to_string()),
            ..Context::default()
        });

        assert!(insert_event(&conn, &event).unwrap());
        assert!(!insert_event(&conn, &event).unwrap());

        let found = find_event(&conn, time, "CNC-07", EventKind::AnomalyDetected).unwrap();
        assert_eq!(found, Some(event));
        assert_eq!(
            find_event(&conn, time, "CNC-07", EventKind::EnergySample).unwrap(),
            None
        );
    }

    #[test]
    fn test_reader_on_missing_chunk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(file_name(0));
        assert!(open_reader(&path).unwrap().is_none());
        // Opening for read must not create the file
        assert!(!path.exists());
    }
}
