//! Materialized rollup tables and their refresh watermarks (in `meta.db`)

use super::schema::{run_schema_migrations, META_MIGRATIONS};
use super::TimeRange;
use crate::error::StoreError;
use crate::event::{Event, EventKind, Payload};
use crate::sqlite_pragma::{apply_optimized_pragmas, apply_reader_pragmas};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{
    params, params_from_iter, types::Value as SqlValue, Connection, OpenFlags, OptionalExtension,
};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// Numeric event field a rollup column averages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceField {
    EnergyKwh,
    CurrentA,
    VoltageV,
    PowerFactor,
    MaintenanceDueHours,
    ToolUsageMinutes,
    SpindleVibrationMm,
    BearingTemp,
    AnomalyValue,
}

impl SourceField {
    /// `None` when the event does not carry the field or it was not measured.
    pub fn value(&self, event: &Event) -> Option<f64> {
        match (&event.payload, self) {
            (Payload::Energy(e), SourceField::EnergyKwh) => e.energy_kwh,
            (Payload::Energy(e), SourceField::CurrentA) => e.current_a,
            (Payload::Energy(e), SourceField::VoltageV) => e.voltage_v,
            (Payload::Energy(e), SourceField::PowerFactor) => e.power_factor,
            (Payload::Maintenance(m), SourceField::MaintenanceDueHours) => m.maintenance_due_hours,
            (Payload::Maintenance(m), SourceField::ToolUsageMinutes) => m.tool_usage_minutes,
            (Payload::Maintenance(m), SourceField::SpindleVibrationMm) => m.spindle_vibration_mm,
            (Payload::Maintenance(m), SourceField::BearingTemp) => m.bearing_temp,
            (Payload::Anomaly(a), SourceField::AnomalyValue) => a.anomaly_value,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollupColumn {
    pub name: &'static str,
    pub source: SourceField,
}

/// Definition of one rollup: a table of per-bucket, per-machine means over a
/// fixed set of fields of one event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollupView {
    pub name: &'static str,
    pub kind: EventKind,
    pub columns: &'static [RollupColumn],
}

pub const HOURLY_ENERGY_USAGE: RollupView = RollupView {
    name: "hourly_energy_usage",
    kind: EventKind::EnergySample,
    columns: &[
        RollupColumn {
            name: "avg_kwh",
            source: SourceField::EnergyKwh,
        },
        RollupColumn {
            name: "avg_current",
            source: SourceField::CurrentA,
        },
    ],
};

pub const DAILY_MAINTENANCE_TREND: RollupView = RollupView {
    name: "daily_maintenance_trend",
    kind: EventKind::MaintenanceSample,
    columns: &[
        RollupColumn {
            name: "avg_vibration",
            source: SourceField::SpindleVibrationMm,
        },
        RollupColumn {
            name: "avg_temperature",
            source: SourceField::BearingTemp,
        },
    ],
};

/// One materialized row; `values` follows the order of `RollupView::columns`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollupRow {
    pub bucket: DateTime<Utc>,
    pub machine: String,
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourlyEnergyUsage {
    pub bucket: DateTime<Utc>,
    pub machine: String,
    pub avg_kwh: Option<f64>,
    pub avg_current: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyMaintenanceTrend {
    pub bucket: DateTime<Utc>,
    pub machine: String,
    pub avg_vibration: Option<f64>,
    pub avg_temperature: Option<f64>,
}

#[derive(Clone)]
pub struct RollupStore {
    conn: Arc<Mutex<Connection>>,
}

impl RollupStore {
    pub fn open(meta_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(meta_path)?;
        apply_optimized_pragmas(&conn)?;
        run_schema_migrations(&conn, META_MIGRATIONS)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an existing `meta.db` for queries only: no schema changes, and
    /// every write through this handle fails.
    pub fn open_read_only(meta_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_URI;
        let conn = Connection::open_with_flags(meta_path, flags)?;
        apply_reader_pragmas(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Every bucket strictly before the watermark is materialized.
    pub fn watermark(&self, view: &RollupView) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.conn.lock();
        let ms: Option<i64> = conn
            .query_row(
                "SELECT watermark FROM rollup_watermarks WHERE rollup = ?1",
                params![view.name],
                |row| row.get(0),
            )
            .optional()?;
        ms.map(from_millis).transpose()
    }

    /// Replaces the rows of `range` and moves the watermark, atomically.
    pub fn apply_refresh(
        &self,
        view: &RollupView,
        range: TimeRange,
        rows: &[RollupRow],
        new_watermark: DateTime<Utc>,
        refreshed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let column_names: Vec<&str> = view.columns.iter().map(|c| c.name).collect();
        let placeholders: Vec<String> = (0..view.columns.len())
            .map(|i| format!("?{}", i + 3))
            .collect();
        let updates: Vec<String> = column_names
            .iter()
            .map(|c| format!("{c} = excluded.{c}"))
            .collect();
        let insert_sql = format!(
            "INSERT INTO {table} (bucket, machine, {cols}) VALUES (?1, ?2, {vals})
             ON CONFLICT(bucket, machine) DO UPDATE SET {updates}",
            table = view.name,
            cols = column_names.join(", "),
            vals = placeholders.join(", "),
            updates = updates.join(", "),
        );

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            &format!(
                "DELETE FROM {} WHERE bucket >= ?1 AND bucket < ?2",
                view.name
            ),
            params![range.start.timestamp_millis(), range.end.timestamp_millis()],
        )?;
        {
            let mut stmt = tx.prepare(&insert_sql)?;
            for row in rows {
                if row.values.len() != view.columns.len() {
                    return Err(StoreError::InvalidRow(format!(
                        "{} expects {} values, got {}",
                        view.name,
                        view.columns.len(),
                        row.values.len()
                    )));
                }
                let mut values: Vec<SqlValue> = Vec::with_capacity(row.values.len() + 2);
                values.push(SqlValue::Integer(row.bucket.timestamp_millis()));
                values.push(SqlValue::Text(row.machine.clone()));
                values.extend(
                    row.values
                        .iter()
                        .map(|v| v.map(SqlValue::Real).unwrap_or(SqlValue::Null)),
                );
                stmt.execute(params_from_iter(values))?;
            }
        }
        tx.execute(
            "INSERT INTO rollup_watermarks (rollup, watermark, refreshed_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(rollup) DO UPDATE SET
                 watermark = excluded.watermark,
                 refreshed_at = excluded.refreshed_at",
            params![
                view.name,
                new_watermark.timestamp_millis(),
                refreshed_at.timestamp_millis()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Rows with `bucket` in `range`, ordered by `(bucket, machine)`.
    pub fn rows(
        &self,
        view: &RollupView,
        range: TimeRange,
        machine: Option<&str>,
    ) -> Result<Vec<RollupRow>, StoreError> {
        let cols: Vec<&str> = view.columns.iter().map(|c| c.name).collect();
        let sql = format!(
            "SELECT bucket, machine, {} FROM {}
             WHERE bucket >= ?1 AND bucket < ?2 AND (?3 IS NULL OR machine = ?3)
             ORDER BY bucket ASC, machine ASC",
            cols.join(", "),
            view.name
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let raw = stmt
            .query_map(
                params![
                    range.start.timestamp_millis(),
                    range.end.timestamp_millis(),
                    machine
                ],
                |row| {
                    let bucket: i64 = row.get(0)?;
                    let machine: String = row.get(1)?;
                    let values = (0..cols.len())
                        .map(|i| row.get::<_, Option<f64>>(i + 2))
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    Ok((bucket, machine, values))
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        raw.into_iter()
            .map(|(bucket, machine, values)| {
                Ok(RollupRow {
                    bucket: from_millis(bucket)?,
                    machine,
                    values,
                })
            })
            .collect()
    }

    pub fn hourly_energy_usage(
        &self,
        range: TimeRange,
        machine: Option<&str>,
    ) -> Result<Vec<HourlyEnergyUsage>, StoreError> {
        Ok(self
            .rows(&HOURLY_ENERGY_USAGE, range, machine)?
            .into_iter()
            .map(|row| HourlyEnergyUsage {
                avg_kwh: row.values.first().copied().flatten(),
                avg_current: row.values.get(1).copied().flatten(),
                bucket: row.bucket,
                machine: row.machine,
            })
            .collect())
    }

    pub fn daily_maintenance_trend(
        &self,
        range: TimeRange,
        machine: Option<&str>,
    ) -> Result<Vec<DailyMaintenanceTrend>, StoreError> {
        Ok(self
            .rows(&DAILY_MAINTENANCE_TREND, range, machine)?
            .into_iter()
            .map(|row| DailyMaintenanceTrend {
                avg_vibration: row.values.first().copied().flatten(),
                avg_temperature: row.values.get(1).copied().flatten(),
                bucket: row.bucket,
                machine: row.machine,
            })
            .collect())
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::InvalidRow(format!("timestamp {}ms", ms)))
}
