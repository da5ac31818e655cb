//! Fault fan-in: any cycle raises an [`Alert`]; a single monitor task
//! consumes them in arrival order and escalates.
//!
//! The channel is small and bounded. Raising never blocks: when the buffer
//! is full the newest alert is dropped and the drop itself is logged.

use serde::Serialize;
use std::fmt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::state::SharedState;

pub const ALERT_CAPACITY: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    LowWater,
    SensorTimeout,
    SensorFault,
    PublishFailed,
    GenericFault,
}

impl AlertKind {
    pub fn tag(self) -> &'static str {
        match self {
            Self::LowWater => "LOW_WATER",
            Self::SensorTimeout => "SENSOR_TIMEOUT",
            Self::SensorFault => "SENSOR_FAULT",
            Self::PublishFailed => "PUBLISH_FAILED",
            Self::GenericFault => "GENERIC_FAULT",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub kind: AlertKind,
    pub context: String,
}

impl Alert {
    pub fn new(kind: AlertKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: context.into(),
        }
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "{}", self.kind.tag())
        } else {
            write!(f, "{}: {}", self.kind.tag(), self.context)
        }
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AlertSender {
    tx: mpsc::Sender<Alert>,
}

pub fn channel() -> (AlertSender, mpsc::Receiver<Alert>) {
    let (tx, rx) = mpsc::channel(ALERT_CAPACITY);
    (AlertSender { tx }, rx)
}

impl AlertSender {
    /// Queue an alert without waiting. Returns false if it was dropped.
    pub fn raise(&self, kind: AlertKind, context: impl Into<String>) -> bool {
        match self.tx.try_send(Alert::new(kind, context)) {
            Ok(()) => true,
            Err(TrySendError::Full(alert)) => {
                warn!(alert = %alert, capacity = ALERT_CAPACITY, "alert channel full, dropping newest alert");
                false
            }
            Err(TrySendError::Closed(alert)) => {
                warn!(alert = %alert, "fault monitor gone, alert dropped");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Fault monitor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    LowWater,
    CheckSystem,
}

/// Log one alert and report how it was escalated.
pub fn dispatch(alert: &Alert) -> Escalation {
    match alert.kind {
        AlertKind::LowWater => {
            warn!(context = %alert.context, "water level is low");
            Escalation::LowWater
        }
        other => {
            warn!(tag = other.tag(), context = %alert.context, "WARNING CHECK SYSTEM");
            Escalation::CheckSystem
        }
    }
}

/// Consume alerts until shutdown or until every sender is gone.
pub async fn monitor(mut rx: mpsc::Receiver<Alert>, status: SharedState, shutdown: CancellationToken) {
    info!("fault monitor started");
    loop {
        let alert = tokio::select! {
            _ = shutdown.cancelled() => break,
            alert = rx.recv() => match alert {
                Some(a) => a,
                None => break,
            },
        };
        dispatch(&alert);
        status.write().await.record_alert(&alert);
    }
    info!("fault monitor stopped");
}

// ===========================================================================
// Tests
// ===========================================================================
