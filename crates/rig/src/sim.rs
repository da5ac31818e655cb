//! Simulated probes for development builds without hardware.
//!
//! Each probe is a mean-reverting random walk with per-reading electronic
//! noise, so consecutive telemetry records look like a slowly drifting tank
//! rather than independent dice rolls.

#![cfg_attr(feature = "gpio", allow(dead_code))]

use std::fmt;

use crate::bme280::Climate;
use crate::sensors::{ClimateSensor, TemperatureSensor};

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Profiles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Nutrient tank: large thermal mass, slow and narrow.
    Water,
    /// Grow-room air: warmer, noisier, wider swings.
    Ambient,
    /// Grow-room relative humidity, percent.
    Humidity,
    /// Barometric pressure, pascal.
    Pressure,
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Water => write!(f, "water"),
            Self::Ambient => write!(f, "ambient"),
            Self::Humidity => write!(f, "humidity"),
            Self::Pressure => write!(f, "pressure"),
        }
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

pub struct SimSensor {
    profile: Profile,
    /// Current "true" temperature. Evolves each read.
    base: f64,
    center: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    noise_sigma: f64,
    /// Physically plausible clamp for this profile.
    range: (f64, f64),
}

impl SimSensor {
    pub fn new(profile: Profile) -> Self {
        let (center, walk_sigma, mean_reversion, noise_sigma, range) = match profile {
            Profile::Water => (20.0, 0.15, 0.10, 0.05, (10.0, 30.0)),
            Profile::Ambient => (23.0, 0.40, 0.05, 0.20, (5.0, 40.0)),
            Profile::Humidity => (60.0, 1.0, 0.05, 0.5, (30.0, 90.0)),
            Profile::Pressure => (101_325.0, 25.0, 0.05, 5.0, (98_000.0, 104_000.0)),
        };
        Self {
            profile,
            base: gaussian(center, 0.5).clamp(range.0, range.1),
            center,
            walk_sigma,
            mean_reversion,
            noise_sigma,
            range,
        }
    }

    fn next(&mut self) -> f64 {
        let pull = self.mean_reversion * (self.center - self.base);
        let walk = gaussian(0.0, self.walk_sigma);
        self.base = (self.base + pull + walk).clamp(self.range.0, self.range.1);

        let reading = self.base + gaussian(0.0, self.noise_sigma);
        tracing::trace!(profile = %self.profile, reading, "[sim] reading");
        reading
    }
}

impl TemperatureSensor for SimSensor {
    fn read_celsius(&mut self) -> anyhow::Result<f64> {
        Ok(self.next())
    }
}

/// Grow-room climate: ambient temperature, humidity and pressure walks.
pub struct SimClimate {
    temperature: SimSensor,
    humidity: SimSensor,
    pressure: SimSensor,
}

impl SimClimate {
    pub fn new() -> Self {
        Self {
            temperature: SimSensor::new(Profile::Ambient),
            humidity: SimSensor::new(Profile::Humidity),
            pressure: SimSensor::new(Profile::Pressure),
        }
    }
}

impl ClimateSensor for SimClimate {
    fn read_climate(&mut self) -> anyhow::Result<Climate> {
        Ok(Climate {
            temperature: self.temperature.next(),
            humidity: self.humidity.next().clamp(0.0, 100.0),
            pressure: self.pressure.next(),
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn std_normal_is_bounded() {
        for _ in 0..1_000 {
            let v = approx_std_normal();
            assert!((-6.0..=6.0).contains(&v));
        }
    }

    #[test]
    fn water_stays_plausible() {
        let mut sim = SimSensor::new(Profile::Water);
        for _ in 0..500 {
            let t = sim.read_celsius().unwrap();
            assert!((9.0..=31.0).contains(&t), "water {t}");
        }
    }

    #[test]
    fn ambient_stays_plausible() {
        let mut sim = SimSensor::new(Profile::Ambient);
        for _ in 0..500 {
            let t = sim.read_celsius().unwrap();
            assert!((3.0..=42.0).contains(&t), "ambient {t}");
        }
    }

    #[test]
    fn consecutive_readings_are_coherent() {
        let mut sim = SimSensor::new(Profile::Water);
        let mut prev = sim.read_celsius().unwrap();
        for _ in 0..100 {
            let next = sim.read_celsius().unwrap();
            assert!((next - prev).abs() < 3.0, "jump {prev} → {next}");
            prev = next;
        }
    }

    #[test]
    fn climate_stays_plausible() {
        let mut sim = SimClimate::new();
        for _ in 0..500 {
            let c = sim.read_climate().unwrap();
            assert!((0.0..=100.0).contains(&c.humidity), "humidity {}", c.humidity);
            assert!((97_000.0..=105_000.0).contains(&c.pressure), "pressure {}", c.pressure);
        }
    }

    #[test]
    fn profile_display() {
        assert_eq!(Profile::Water.to_string(), "water");
        assert_eq!(Profile::Ambient.to_string(), "ambient");
        assert_eq!(Profile::Pressure.to_string(), "pressure");
    }
}
