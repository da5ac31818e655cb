use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::alert::Alert;
use crate::orchestrator::Lifecycle;
use crate::telemetry::TelemetryRecord;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

/// Observation-only snapshot. Cycles write their own entries; nothing in the
/// control path reads it back.
pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub device_id: String,
    pub lifecycle: Lifecycle,
    pub mqtt_connected: bool,
    pub light_on: bool,
    pub pump_on: bool,
    pub last_telemetry: Option<TelemetryRecord>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Light,
    Pump,
    Telemetry,
    Alert,
    Recovery,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub device_id: String,
    pub lifecycle: Lifecycle,
    pub mqtt_connected: bool,
    pub light_on: bool,
    pub pump_on: bool,
    pub last_telemetry: Option<TelemetryRecord>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(device_id: &str) -> Self {
        Self {
            started_at: Instant::now(),
            device_id: device_id.to_string(),
            lifecycle: Lifecycle::Starting,
            mqtt_connected: false,
            light_on: false,
            pump_on: false,
            last_telemetry: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared(device_id: &str) -> SharedState {
        Arc::new(RwLock::new(Self::new(device_id)))
    }

    pub fn record_light(&mut self, on: bool) {
        self.light_on = on;
        self.push_event(EventKind::Light, format!("grow light {}", on_off(on)));
    }

    pub fn record_pump(&mut self, on: bool) {
        self.pump_on = on;
        self.push_event(EventKind::Pump, format!("air pump {}", on_off(on)));
    }

    pub fn record_telemetry(&mut self, record: TelemetryRecord) {
        let detail = format!(
            "water={:.2}C ambient={:.2}C cpu={:.2}C level={:.1}cm",
            record.water_temp, record.ambient_temp, record.cpu_temp, record.water_level
        );
        self.last_telemetry = Some(record);
        self.push_event(EventKind::Telemetry, detail);
    }

    pub fn record_alert(&mut self, alert: &Alert) {
        self.push_event(EventKind::Alert, alert.to_string());
    }

    pub fn record_recovery(&mut self, detail: String) {
        self.push_event(EventKind::Recovery, detail);
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    pub fn set_lifecycle(&mut self, lifecycle: Lifecycle) {
        if self.lifecycle != lifecycle {
            self.lifecycle = lifecycle;
            self.push_event(EventKind::System, format!("lifecycle {lifecycle:?}"));
        }
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            device_id: self.device_id.clone(),
            lifecycle: self.lifecycle,
            mqtt_connected: self.mqtt_connected,
            light_on: self.light_on,
            pump_on: self.pump_on,
            last_telemetry: self.last_telemetry.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

// ===========================================================================
// Tests
// ===========================================================================
