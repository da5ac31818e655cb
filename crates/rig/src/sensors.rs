//! Sensor sources: the DS18B20 water probe (1-Wire sysfs), the ambient
//! sensor, the grow-room climate sensor, and the SoC thermal zone.

use anyhow::{bail, Context, Result};
use std::num::ParseFloatError;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::bme280::Climate;

/// Where the kernel's w1-therm driver exposes DS18B20 probes.
const W1_DEVICES: &str = "/sys/bus/w1/devices";

pub trait TemperatureSensor: Send {
    fn read_celsius(&mut self) -> Result<f64>;
}

/// Humidity and pressure source.
pub trait ClimateSensor: Send {
    fn read_climate(&mut self) -> Result<Climate>;
}

/// Stand-in for a sensor that failed to open. Every read fails, so the
/// telemetry cycle reports it each period instead of the rig refusing to
/// start.
pub struct Unavailable {
    name: &'static str,
    reason: String,
}

impl Unavailable {
    pub fn new(name: &'static str, reason: &anyhow::Error) -> Self {
        Self {
            name,
            reason: format!("{reason:#}"),
        }
    }
}

impl TemperatureSensor for Unavailable {
    fn read_celsius(&mut self) -> Result<f64> {
        bail!("{} sensor unavailable: {}", self.name, self.reason)
    }
}

impl ClimateSensor for Unavailable {
    fn read_climate(&mut self) -> Result<Climate> {
        bail!("{} sensor unavailable: {}", self.name, self.reason)
    }
}

// ---------------------------------------------------------------------------
// DS18B20
// ---------------------------------------------------------------------------

#[cfg_attr(not(feature = "gpio"), allow(dead_code))]
pub struct Ds18b20 {
    id: String,
    path: PathBuf,
}

#[cfg_attr(not(feature = "gpio"), allow(dead_code))]
impl Ds18b20 {
    pub fn new(id: &str) -> Self {
        Self::at(id, Path::new(W1_DEVICES))
    }

    pub fn at(id: &str, devices: &Path) -> Self {
        Self {
            id: id.to_string(),
            path: devices.join(id).join("w1_slave"),
        }
    }
}

impl TemperatureSensor for Ds18b20 {
    fn read_celsius(&mut self) -> Result<f64> {
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("could not read ds18b20 {}", self.id))?;
        parse_w1_slave(&raw).with_context(|| format!("ds18b20 {}", self.id))
    }
}

/// Parse the two-line `w1_slave` report:
///
/// ```text
/// 72 01 4b 46 7f ff 0e 10 57 : crc=57 YES
/// 72 01 4b 46 7f ff 0e 10 57 t=23125
/// ```
pub fn parse_w1_slave(raw: &str) -> Result<f64> {
    let mut lines = raw.lines();
    let crc = lines.next().unwrap_or_default();
    if !crc.trim_end().ends_with("YES") {
        bail!("crc check failed: {crc:?}");
    }
    let data = lines.next().unwrap_or_default();
    let Some((_, milli)) = data.split_once("t=") else {
        bail!("no temperature field in {data:?}");
    };
    let milli: f64 = milli
        .trim()
        .parse()
        .with_context(|| format!("bad temperature field {milli:?}"))?;
    Ok(milli / 1000.0)
}

// ---------------------------------------------------------------------------
// CPU thermal zone
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CpuTempError {
    #[error("cpu temperature file holds {raw:?}, not a number")]
    Malformed {
        raw: String,
        #[source]
        source: ParseFloatError,
    },
}

pub struct CpuThermal {
    path: PathBuf,
}

impl CpuThermal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Degrees Celsius. A missing file reads as 0.0; content that is present
    /// but unparseable is an error the caller must treat as fatal.
    pub fn read(&self) -> Result<f64, CpuTempError> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => {
                let celsius = parse_millidegrees(&raw)?;
                tracing::debug!(celsius, "cpu temperature");
                Ok(celsius)
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "can't read cpu temperature: {e}");
                Ok(0.0)
            }
        }
    }
}

pub fn parse_millidegrees(raw: &str) -> Result<f64, CpuTempError> {
    let trimmed = raw.trim();
    trimmed
        .parse::<f64>()
        .map(|milli| milli / 1000.0)
        .map_err(|source| CpuTempError::Malformed {
            raw: trimmed.to_string(),
            source,
        })
}

// ---------------------------------------------------------------------------
// Backend selection
// ---------------------------------------------------------------------------

/// Water probe. On hardware builds an empty id is allowed: every read then
/// fails and is reported by the telemetry cycle.
#[cfg(feature = "gpio")]
pub fn open_water(sensor_id: &str) -> Result<Box<dyn TemperatureSensor>> {
    if sensor_id.is_empty() {
        tracing::warn!("no waterTempSensorId configured");
    }
    Ok(Box::new(Ds18b20::new(sensor_id)))
}

#[cfg(all(not(feature = "gpio"), feature = "sim"))]
pub fn open_water(sensor_id: &str) -> Result<Box<dyn TemperatureSensor>> {
    tracing::info!(sensor_id, "[sim] water probe simulated");
    Ok(Box::new(crate::sim::SimSensor::new(crate::sim::Profile::Water)))
}

#[cfg(not(any(feature = "gpio", feature = "sim")))]
pub fn open_water(_sensor_id: &str) -> Result<Box<dyn TemperatureSensor>> {
    bail!("no temperature backend compiled in: enable the `gpio` or `sim` feature")
}

#[cfg(feature = "gpio")]
pub fn open_ambient() -> Result<Box<dyn TemperatureSensor>> {
    let sensor = crate::mcp9808::Mcp9808::new(crate::mcp9808::DEFAULT_ADDR)
        .context("could not open mcp9808 ambient sensor")?;
    Ok(Box::new(sensor))
}

#[cfg(all(not(feature = "gpio"), feature = "sim"))]
pub fn open_ambient() -> Result<Box<dyn TemperatureSensor>> {
    tracing::info!("[sim] ambient sensor simulated");
    Ok(Box::new(crate::sim::SimSensor::new(crate::sim::Profile::Ambient)))
}

#[cfg(not(any(feature = "gpio", feature = "sim")))]
pub fn open_ambient() -> Result<Box<dyn TemperatureSensor>> {
    bail!("no temperature backend compiled in: enable the `gpio` or `sim` feature")
}

#[cfg(feature = "gpio")]
pub fn open_climate() -> Result<Box<dyn ClimateSensor>> {
    let sensor = crate::bme280::Bme280::new(crate::bme280::DEFAULT_ADDR)
        .context("could not open bme280 climate sensor")?;
    Ok(Box::new(sensor))
}

#[cfg(all(not(feature = "gpio"), feature = "sim"))]
pub fn open_climate() -> Result<Box<dyn ClimateSensor>> {
    tracing::info!("[sim] climate sensor simulated");
    Ok(Box::new(crate::sim::SimClimate::new()))
}

#[cfg(not(any(feature = "gpio", feature = "sim")))]
pub fn open_climate() -> Result<Box<dyn ClimateSensor>> {
    bail!("no climate backend compiled in: enable the `gpio` or `sim` feature")
}

// ===========================================================================
// Tests
// ===========================================================================
