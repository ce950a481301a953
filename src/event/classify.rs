//! Classification of raw inbound messages
//!
//! `classify` never fails: every input becomes either a typed `Event` or a
//! `RejectedRecord` describing why it was refused. A bad record is data, not an
//! error, so one malformed message can never abort the batch it arrived in.

use super::{
    AnomalyReport, Context, EnergyReading, Event, EventKind, MaintenanceReading, Payload,
};
use chrono::{TimeZone, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

const SNIPPET_CHARS: usize = 120;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("malformed JSON: {0}")]
    MalformedJson(String),

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("unknown event discriminator `{0}`")]
    UnknownEvent(String),

    #[error("field `{field}` must be {expected}")]
    InvalidType {
        field: &'static str,
        expected: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    pub reason: RejectReason,
    pub raw_snippet: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Valid(Event),
    Rejected(RejectedRecord),
}

impl Classification {
    pub fn into_event(self) -> Option<Event> {
        match self {
            Classification::Valid(event) => Some(event),
            Classification::Rejected(_) => None,
        }
    }
}

/// Parse and classify the raw bytes of one queue message.
pub fn classify_bytes(raw: &[u8]) -> Classification {
    match serde_json::from_slice::<Value>(raw) {
        Ok(value) => classify_with_snippet(&value, || snippet(&String::from_utf8_lossy(raw))),
        Err(e) => Classification::Rejected(RejectedRecord {
            reason: RejectReason::MalformedJson(e.to_string()),
            raw_snippet: snippet(&String::from_utf8_lossy(raw)),
        }),
    }
}

/// Classify an already-parsed JSON value.
pub fn classify(raw: &Value) -> Classification {
    classify_with_snippet(raw, || snippet(&raw.to_string()))
}

fn classify_with_snippet(raw: &Value, make_snippet: impl FnOnce() -> String) -> Classification {
    match parse_event(raw) {
        Ok(event) => Classification::Valid(event),
        Err(reason) => Classification::Rejected(RejectedRecord {
            reason,
            raw_snippet: make_snippet(),
        }),
    }
}

fn parse_event(raw: &Value) -> Result<Event, RejectReason> {
    let obj = raw.as_object().ok_or(RejectReason::NotAnObject)?;

    let discriminator =
        required_string(obj, "event")?.ok_or(RejectReason::MissingField("event"))?;
    let kind = EventKind::from_discriminator(discriminator)
        .ok_or_else(|| RejectReason::UnknownEvent(discriminator.to_string()))?;

    let machine = required_string(obj, "machine")?.ok_or(RejectReason::MissingField("machine"))?;
    if machine.is_empty() {
        return Err(RejectReason::InvalidType {
            field: "machine",
            expected: "a non-empty string",
        });
    }

    let timestamp = match present(obj, "timestamp") {
        None => return Err(RejectReason::MissingField("timestamp")),
        Some(v) => v.as_i64().ok_or(RejectReason::InvalidType {
            field: "timestamp",
            expected: "an integer of milliseconds since the epoch",
        })?,
    };
    let time = Utc
        .timestamp_millis_opt(timestamp)
        .single()
        .ok_or(RejectReason::InvalidType {
            field: "timestamp",
            expected: "a representable instant",
        })?;

    let payload = match kind {
        EventKind::EnergySample => Payload::Energy(EnergyReading {
            energy_kwh: number(obj, "energyConsumptionKwh")?,
            current_a: number(obj, "currentDrawA")?,
            voltage_v: number(obj, "voltageV")?,
            power_factor: number(obj, "powerFactor")?,
        }),
        EventKind::MaintenanceSample => Payload::Maintenance(MaintenanceReading {
            maintenance_due_hours: number(obj, "maintenanceDueHours")?,
            tool_usage_minutes: number(obj, "toolUsageMinutes")?,
            spindle_vibration_mm: number(obj, "spindleVibrationMm")?,
            bearing_temp: number(obj, "bearingTemperature")?,
        }),
        EventKind::AnomalyDetected => Payload::Anomaly(AnomalyReport {
            anomaly_type: optional_string(obj, "anomalyType")?,
            anomaly_value: number(obj, "anomalyValue")?,
        }),
    };

    let context = match present(obj, "context") {
        None => Context::default(),
        Some(Value::Object(ctx)) => Context {
            plant: optional_string(ctx, "plant")?,
            energy_zone: optional_string(ctx, "energyZone")?,
            maintenance_team: optional_string(ctx, "maintenanceTeam")?,
            maintenance_interval: optional_string(ctx, "maintenanceInterval")?,
            machine_category: optional_string(ctx, "machineCategory")?,
        },
        Some(_) => {
            return Err(RejectReason::InvalidType {
                field: "context",
                expected: "an object",
            })
        }
    };

    Ok(Event {
        time,
        machine: machine.to_string(),
        payload,
        context,
    })
}

/// `null` counts as absent.
fn present<'a>(obj: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    obj.get(field).filter(|v| !v.is_null())
}

fn required_string<'a>(
    obj: &'a Map<String, Value>,
    field: &'static str,
) -> Result<Option<&'a str>, RejectReason> {
    match present(obj, field) {
        None => Ok(None),
        Some(v) => v.as_str().map(Some).ok_or(RejectReason::InvalidType {
            field,
            expected: "a string",
        }),
    }
}

fn optional_string(
    obj: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<String>, RejectReason> {
    Ok(required_string(obj, field)?.map(str::to_string))
}

fn number(obj: &Map<String, Value>, field: &'static str) -> Result<Option<f64>, RejectReason> {
    match present(obj, field) {
        None => Ok(None),
        Some(v) => v.as_f64().map(Some).ok_or(RejectReason::InvalidType {
            field,
            expected: "a number",
        }),
    }
}

fn snippet(raw: &str) -> String {
    match raw.char_indices().nth(SNIPPET_CHARS) {
        Some((idx, _)) => raw[..idx].to_string(),
        None => raw.to_string(),
    }
}
