//! Digital I/O handles. The `gpio` feature gates the real rppal driver;
//! without it, a mock implementation latches levels in memory and logs state
//! changes.
//!
//! Every handle is a `Box<dyn Pin>` and is deliberately not `Clone`: each one
//! is moved into exactly one cycle, so no two tasks can ever drive the same
//! line.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::ops::Not;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, IoPin};

#[cfg(any(test, not(feature = "gpio")))]
use std::sync::{Arc, Mutex, PoisonError};

// ---------------------------------------------------------------------------
// Levels, modes, and the pin capability
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn is_high(self) -> bool {
        self == Level::High
    }
}

impl Not for Level {
    type Output = Level;

    fn not(self) -> Level {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high {
            Level::High
        } else {
            Level::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Input,
    Output,
}

/// A single addressable digital line.
pub trait Pin: Send {
    fn set_mode(&mut self, mode: Mode);
    fn write(&mut self, level: Level);
    fn read(&self) -> Level;

    fn toggle(&mut self) {
        let next = !self.read();
        self.write(next);
    }
}

/// Exclusive, owned handle to one line.
pub type Handle = Box<dyn Pin>;

// ---------------------------------------------------------------------------
// Pin map
// ---------------------------------------------------------------------------

/// BCM line numbers for every handle the rig owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PinMap {
    pub grow_light: u8,
    pub air_pump: u8,
    pub button: u8,
    pub button_led: u8,
    pub ping: u8,
    pub echo: u8,
}

impl Default for PinMap {
    fn default() -> Self {
        Self {
            grow_light: 19,
            air_pump: 21,
            button: 13,
            button_led: 14,
            ping: 16,
            echo: 17,
        }
    }
}

impl PinMap {
    /// (name, line) pairs, in a stable order for validation and logging.
    pub fn entries(&self) -> [(&'static str, u8); 6] {
        [
            ("growLight", self.grow_light),
            ("airPump", self.air_pump),
            ("button", self.button),
            ("buttonLed", self.button_led),
            ("ping", self.ping),
            ("echo", self.echo),
        ]
    }
}

/// Every handle the rig needs, opened once at startup and then split up
/// between the cycles.
pub struct Board {
    pub grow_light: Handle,
    pub air_pump: Handle,
    pub button: Handle,
    pub button_led: Handle,
    pub ping: Handle,
    pub echo: Handle,
}

// ---------------------------------------------------------------------------
// Real GPIO (production, requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
impl Pin for IoPin {
    fn set_mode(&mut self, mode: Mode) {
        IoPin::set_mode(
            self,
            match mode {
                Mode::Input => rppal::gpio::Mode::Input,
                Mode::Output => rppal::gpio::Mode::Output,
            },
        );
    }

    fn write(&mut self, level: Level) {
        IoPin::write(
            self,
            match level {
                Level::Low => rppal::gpio::Level::Low,
                Level::High => rppal::gpio::Level::High,
            },
        );
    }

    fn read(&self) -> Level {
        Level::from(IoPin::is_high(self))
    }

    fn toggle(&mut self) {
        IoPin::toggle(self);
    }
}

#[cfg(feature = "gpio")]
impl Board {
    pub fn open(pins: &PinMap) -> Result<Self> {
        use anyhow::Context;
        use rppal::gpio::Mode as RpMode;

        let gpio = Gpio::new().context("could not open gpio peripheral")?;
        let line = |bcm: u8, mode: RpMode| -> Result<Handle> {
            let pin = gpio
                .get(bcm)
                .with_context(|| format!("could not claim gpio {bcm}"))?;
            Ok(Box::new(pin.into_io(mode)))
        };

        let board = Self {
            grow_light: line(pins.grow_light, RpMode::Output)?,
            air_pump: line(pins.air_pump, RpMode::Output)?,
            button: line(pins.button, RpMode::Input)?,
            button_led: line(pins.button_led, RpMode::Output)?,
            ping: line(pins.ping, RpMode::Output)?,
            echo: line(pins.echo, RpMode::Output)?,
        };
        tracing::info!(?pins, "gpio lines claimed");
        Ok(board)
    }
}

// ---------------------------------------------------------------------------
// Mock GPIO (development and tests, no hardware)
// ---------------------------------------------------------------------------

#[cfg(any(test, not(feature = "gpio")))]
#[derive(Debug)]
struct MockLine {
    mode: Mode,
    level: Level,
    writes: Vec<(Level, tokio::time::Instant)>,
}

/// In-memory line. The owning cycle sees it as an ordinary [`Pin`]; the
/// matching [`PinProbe`] lets tests inspect writes and drive inputs.
#[cfg(any(test, not(feature = "gpio")))]
pub struct MockPin {
    name: &'static str,
    bcm: u8,
    line: Arc<Mutex<MockLine>>,
}

#[cfg(any(test, not(feature = "gpio")))]
#[cfg_attr(not(test), allow(dead_code))]
#[derive(Clone)]
pub struct PinProbe {
    line: Arc<Mutex<MockLine>>,
}

#[cfg(any(test, not(feature = "gpio")))]
impl MockPin {
    pub fn new(name: &'static str, bcm: u8, mode: Mode) -> (Self, PinProbe) {
        let line = Arc::new(Mutex::new(MockLine {
            mode,
            level: Level::Low,
            writes: Vec::new(),
        }));
        let probe = PinProbe {
            line: Arc::clone(&line),
        };
        (Self { name, bcm, line }, probe)
    }
}

#[cfg(any(test, not(feature = "gpio")))]
impl Pin for MockPin {
    fn set_mode(&mut self, mode: Mode) {
        let mut line = self.line.lock().unwrap_or_else(PoisonError::into_inner);
        line.mode = mode;
    }

    fn write(&mut self, level: Level) {
        let mut line = self.line.lock().unwrap_or_else(PoisonError::into_inner);
        if line.mode == Mode::Input {
            tracing::warn!(pin = self.name, bcm = self.bcm, "[mock-gpio] write to input line ignored");
            return;
        }
        line.level = level;
        line.writes.push((level, tokio::time::Instant::now()));
        tracing::trace!(pin = self.name, bcm = self.bcm, ?level, "[mock-gpio] write");
    }

    fn read(&self) -> Level {
        self.line
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .level
    }
}

#[cfg(test)]
impl PinProbe {
    pub fn level(&self) -> Level {
        self.line.lock().unwrap_or_else(PoisonError::into_inner).level
    }

    pub fn mode(&self) -> Mode {
        self.line.lock().unwrap_or_else(PoisonError::into_inner).mode
    }

    /// Every level written by the owner, oldest first.
    pub fn writes(&self) -> Vec<(Level, tokio::time::Instant)> {
        self.line
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .writes
            .clone()
    }

    /// Drive the line from the outside, as a button or sensor would.
    pub fn drive(&self, level: Level) {
        self.line.lock().unwrap_or_else(PoisonError::into_inner).level = level;
    }
}

#[cfg(any(test, not(feature = "gpio")))]
#[cfg_attr(not(test), allow(dead_code))]
pub struct BoardProbes {
    pub grow_light: PinProbe,
    pub air_pump: PinProbe,
    pub button: PinProbe,
    pub button_led: PinProbe,
    pub ping: PinProbe,
    pub echo: PinProbe,
}

#[cfg(any(test, not(feature = "gpio")))]
impl Board {
    pub fn mock(pins: &PinMap) -> (Self, BoardProbes) {
        let (grow_light, grow_light_probe) = MockPin::new("growLight", pins.grow_light, Mode::Output);
        let (air_pump, air_pump_probe) = MockPin::new("airPump", pins.air_pump, Mode::Output);
        let (button, button_probe) = MockPin::new("button", pins.button, Mode::Input);
        let (button_led, button_led_probe) = MockPin::new("buttonLed", pins.button_led, Mode::Output);
        let (ping, ping_probe) = MockPin::new("ping", pins.ping, Mode::Output);
        let (echo, echo_probe) = MockPin::new("echo", pins.echo, Mode::Output);

        let board = Self {
            grow_light: Box::new(grow_light),
            air_pump: Box::new(air_pump),
            button: Box::new(button),
            button_led: Box::new(button_led),
            ping: Box::new(ping),
            echo: Box::new(echo),
        };
        let probes = BoardProbes {
            grow_light: grow_light_probe,
            air_pump: air_pump_probe,
            button: button_probe,
            button_led: button_led_probe,
            ping: ping_probe,
            echo: echo_probe,
        };
        (board, probes)
    }
}

#[cfg(not(feature = "gpio"))]
impl Board {
    pub fn open(pins: &PinMap) -> Result<Self> {
        for (name, bcm) in pins.entries() {
            tracing::info!("[mock-gpio] registered {name} (gpio {bcm}, not wired)");
        }
        tracing::info!("[mock-gpio] board initialised (no hardware)");
        Ok(Self::mock(pins).0)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
