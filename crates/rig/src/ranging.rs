//! HC-SR04 ultrasonic ranging over two GPIO lines.
//!
//! A 15 µs trigger pulse on the ping line makes the module emit a burst and
//! hold the echo line high for the sound's round trip. 58 µs of echo is one
//! centimetre of distance.
//!
//! The edge waits spin on `Instant` rather than sleeping: the kernel's sleep
//! granularity is tens of microseconds, which is whole centimetres here.
//! Every wait is bounded so a disconnected sensor cannot hang the caller.
//! Call [`HcSr04::measure_distance`] from a blocking thread, never directly
//! on an async worker.

use std::time::{Duration, Instant};
use thiserror::Error;

use crate::gpio::{Handle, Level, Mode};

/// Echo duration per centimetre of distance, in nanoseconds.
const NANOS_PER_CM: f32 = 58_000.0;

const TRIGGER_PULSE: Duration = Duration::from_micros(15);
const SETTLE: Duration = Duration::from_micros(1);

/// The module gives up on its own after ~38 ms; anything beyond that is a
/// missing or unwired sensor.
pub const DEFAULT_ECHO_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangingError {
    #[error("echo line never went {edge:?} within {timeout:?}")]
    SensorTimeout { edge: Level, timeout: Duration },
}

/// Convert an echo pulse width into centimetres.
pub fn echo_to_cm(echo: Duration) -> f32 {
    echo.as_nanos() as f32 / NANOS_PER_CM
}

pub struct HcSr04 {
    ping: Handle,
    echo: Handle,
    timeout: Duration,
}

impl HcSr04 {
    pub fn new(ping: Handle, echo: Handle, timeout: Duration) -> Self {
        Self { ping, echo, timeout }
    }

    /// Fire one ping and time the echo.
    pub fn measure_distance(&mut self) -> Result<f32, RangingError> {
        self.prime();

        self.ping.write(Level::High);
        spin_for(TRIGGER_PULSE);
        self.ping.write(Level::Low);

        let rise = self.wait_for(Level::High)?;
        let fall = self.wait_for(Level::Low)?;
        Ok(echo_to_cm(fall.saturating_duration_since(rise)))
    }

    /// Pull both lines low, then hand the echo line back to the sensor.
    fn prime(&mut self) {
        self.echo.set_mode(Mode::Output);
        self.ping.set_mode(Mode::Output);
        self.echo.write(Level::Low);
        self.ping.write(Level::Low);
        spin_for(SETTLE);
        self.echo.set_mode(Mode::Input);
    }

    fn wait_for(&self, edge: Level) -> Result<Instant, RangingError> {
        let started = Instant::now();
        loop {
            if self.echo.read() == edge {
                return Ok(Instant::now());
            }
            if started.elapsed() >= self.timeout {
                return Err(RangingError::SensorTimeout {
                    edge,
                    timeout: self.timeout,
                });
            }
            std::hint::spin_loop();
        }
    }
}

fn spin_for(d: Duration) {
    let start = Instant::now();
    while start.elapsed() < d {
        std::hint::spin_loop();
    }
}

// ===========================================================================
// Tests
// ===========================================================================
