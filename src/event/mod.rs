//! Telemetry event model
//!
//! Three kinds of events arrive from the shop floor. Each kind carries its own
//! payload; fields that do not apply to a kind simply do not exist on it, so
//! "not measured" can never be confused with "measured as zero".
//!
//! Identity of an event is `(time, machine, kind)`. The store relies on this
//! triple for idempotent writes.

pub mod classify;

pub use classify::{classify, classify_bytes, Classification, RejectReason, RejectedRecord};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Discriminator of an event, as carried in the inbound `event` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    EnergySample,
    MaintenanceSample,
    AnomalyDetected,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [
        EventKind::EnergySample,
        EventKind::MaintenanceSample,
        EventKind::AnomalyDetected,
    ];

    /// Wire and storage representation (`ENERGY_SAMPLE`, ...)
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::EnergySample => "ENERGY_SAMPLE",
            EventKind::MaintenanceSample => "MAINTENANCE_SAMPLE",
            EventKind::AnomalyDetected => "ANOMALY_DETECTED",
        }
    }

    pub fn from_discriminator(s: &str) -> Option<Self> {
        match s {
            "ENERGY_SAMPLE" => Some(EventKind::EnergySample),
            "MAINTENANCE_SAMPLE" => Some(EventKind::MaintenanceSample),
            "ANOMALY_DETECTED" => Some(EventKind::AnomalyDetected),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergyReading {
    pub energy_kwh: Option<f64>,
    pub current_a: Option<f64>,
    pub voltage_v: Option<f64>,
    pub power_factor: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceReading {
    pub maintenance_due_hours: Option<f64>,
    pub tool_usage_minutes: Option<f64>,
    pub spindle_vibration_mm: Option<f64>,
    pub bearing_temp: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnomalyReport {
    /// e.g. `VIBRATION_SPIKE`, `POWER_SPIKE`
    pub anomaly_type: Option<String>,
    pub anomaly_value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "values")]
pub enum Payload {
    Energy(EnergyReading),
    Maintenance(MaintenanceReading),
    Anomaly(AnomalyReport),
}

impl Payload {
    pub fn kind(&self) -> EventKind {
        match self {
            Payload::Energy(_) => EventKind::EnergySample,
            Payload::Maintenance(_) => EventKind::MaintenanceSample,
            Payload::Anomaly(_) => EventKind::AnomalyDetected,
        }
    }
}

/// Plant metadata attached by the producer, independent of the event kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub plant: Option<String>,
    pub energy_zone: Option<String>,
    pub maintenance_team: Option<String>,
    pub maintenance_interval: Option<String>,
    pub machine_category: Option<String>,
}

impl Context {
    pub fn is_empty(&self) -> bool {
        *self == Context::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub time: DateTime<Utc>,
    pub machine: String,
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Context::is_empty")]
    pub context: Context,
}

impl Event {
    pub fn new(time: DateTime<Utc>, machine: impl Into<String>, payload: Payload) -> Self {
        Self {
            time,
            machine: machine.into(),
            payload,
            context: Context::default(),
        }
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn key(&self) -> EventKey {
        EventKey {
            time: self.time,
            machine: self.machine.clone(),
            kind: self.kind(),
        }
    }
}

/// `(time, machine, kind)`: the identity used for duplicate detection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventKey {
    pub time: DateTime<Utc>,
    pub machine: String,
    pub kind: EventKind,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_discriminator_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_discriminator(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::from_discriminator("energy_sample"), None);
    }

    #[test]
    fn test_kind_follows_payload() {
        let time = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let event = Event::new(time, "CNC-01", Payload::Anomaly(AnomalyReport::default()));
        assert_eq!(event.kind(), EventKind::AnomalyDetected);
        assert_eq!(event.key().machine, "CNC-01");
        assert!(event.context.is_empty());
    }
}
