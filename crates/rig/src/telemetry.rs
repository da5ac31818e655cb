//! Sensor telemetry cycle: sample every source, publish one record, sleep.

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alert::{AlertKind, AlertSender};
use crate::mqtt::{events_topic, Publisher};
use crate::ranging::HcSr04;
use crate::sensors::{ClimateSensor, CpuTempError, CpuThermal, TemperatureSensor};
use crate::state::SharedState;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    pub water_temp: f64,
    pub ambient_temp: f64,
    pub cpu_temp: f64,
    pub water_level: f32,
    /// Grow-room relative humidity, percent. Absent without a climate sensor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    /// Barometric pressure, pascal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub taken_at: OffsetDateTime,
}

// ---------------------------------------------------------------------------
// Sampling
// ---------------------------------------------------------------------------

pub struct WaterLevel {
    ranging: HcSr04,
    low_water_cm: f32,
}

impl WaterLevel {
    pub fn new(ranging: HcSr04, low_water_cm: f32) -> Self {
        Self { ranging, low_water_cm }
    }

    fn sample(&mut self, alerts: &AlertSender) -> f32 {
        match self.ranging.measure_distance() {
            Ok(cm) => self.check(cm, alerts),
            Err(e) => {
                warn!("water level unavailable: {e}");
                alerts.raise(AlertKind::SensorTimeout, e.to_string());
                0.0
            }
        }
    }

    fn check(&self, cm: f32, alerts: &AlertSender) -> f32 {
        if cm <= self.low_water_cm {
            alerts.raise(
                AlertKind::LowWater,
                format!("distance {cm:.1}cm at or below {:.1}cm", self.low_water_cm),
            );
        }
        cm
    }
}

/// Every sensor the cycle reads, owned together so the whole set can move
/// onto a blocking thread for one sample.
pub struct SensorSuite {
    water: Box<dyn TemperatureSensor>,
    ambient: Box<dyn TemperatureSensor>,
    cpu: CpuThermal,
    water_level: Option<WaterLevel>,
    climate: Option<Box<dyn ClimateSensor>>,
    alerts: AlertSender,
}

impl SensorSuite {
    pub fn new(
        water: Box<dyn TemperatureSensor>,
        ambient: Box<dyn TemperatureSensor>,
        cpu: CpuThermal,
        alerts: AlertSender,
    ) -> Self {
        Self {
            water,
            ambient,
            cpu,
            water_level: None,
            climate: None,
            alerts,
        }
    }

    pub fn with_water_level(mut self, level: WaterLevel) -> Self {
        self.water_level = Some(level);
        self
    }

    pub fn with_climate(mut self, climate: Box<dyn ClimateSensor>) -> Self {
        self.climate = Some(climate);
        self
    }

    /// Blocking: the ranging driver busy-waits on the echo line.
    pub fn sample(&mut self) -> Result<TelemetryRecord, CpuTempError> {
        let water_temp = read_or_zero(self.water.as_mut(), "water", &self.alerts);
        let cpu_temp = self.cpu.read()?;
        let ambient_temp = read_or_zero(self.ambient.as_mut(), "ambient", &self.alerts);
        let water_level = self
            .water_level
            .as_mut()
            .map_or(0.0, |level| level.sample(&self.alerts));
        let climate = self.climate.as_mut().and_then(|sensor| match sensor.read_climate() {
            Ok(climate) => Some(climate),
            Err(e) => {
                warn!("climate read failed: {e:#}");
                self.alerts.raise(AlertKind::SensorFault, format!("climate: {e:#}"));
                None
            }
        });

        Ok(TelemetryRecord {
            water_temp,
            ambient_temp,
            cpu_temp,
            water_level,
            humidity: climate.map(|c| c.humidity),
            pressure: climate.map(|c| c.pressure),
            taken_at: OffsetDateTime::now_utc(),
        })
    }
}

fn read_or_zero(sensor: &mut dyn TemperatureSensor, name: &str, alerts: &AlertSender) -> f64 {
    match sensor.read_celsius() {
        Ok(celsius) => celsius,
        Err(e) => {
            warn!(sensor = name, "temperature read failed: {e:#}");
            alerts.raise(AlertKind::SensorFault, format!("{name} temperature: {e:#}"));
            0.0
        }
    }
}

// ---------------------------------------------------------------------------
// Cycle
// ---------------------------------------------------------------------------

pub struct TelemetryCycle {
    pub suite: SensorSuite,
    pub publisher: Arc<dyn Publisher>,
    pub alerts: AlertSender,
    pub status: SharedState,
    pub period: Duration,
}

impl TelemetryCycle {
    /// Runs until shutdown. Unparseable CPU temperature ends the cycle with
    /// an error.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Self {
            mut suite,
            publisher,
            alerts,
            status,
            period,
        } = self;
        let topic = events_topic(publisher.device_id());
        info!(%topic, ?period, "telemetry cycle started");

        loop {
            let (returned, sampled) = tokio::task::spawn_blocking(move || {
                let sampled = suite.sample();
                (suite, sampled)
            })
            .await
            .context("sensor sampling thread panicked")?;
            suite = returned;

            let record = sampled.context("telemetry cycle cannot continue")?;
            publish(publisher.as_ref(), &alerts, &topic, &record).await;
            status.write().await.record_telemetry(record);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
        }

        info!("telemetry cycle stopped");
        Ok(())
    }
}

async fn publish(publisher: &dyn Publisher, alerts: &AlertSender, topic: &str, record: &TelemetryRecord) {
    let payload = match serde_json::to_vec(record) {
        Ok(p) => p,
        Err(e) => {
            warn!("could not encode telemetry: {e}");
            alerts.raise(AlertKind::GenericFault, format!("encode telemetry: {e}"));
            return;
        }
    };

    match publisher.publish_message(topic, payload).await {
        Ok(()) => debug!(
            water = record.water_temp,
            ambient = record.ambient_temp,
            cpu = record.cpu_temp,
            level = record.water_level,
            "telemetry published"
        ),
        Err(e) => {
            warn!("telemetry publish failed: {e:#}");
            alerts.raise(AlertKind::PublishFailed, format!("{e:#}"));
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
