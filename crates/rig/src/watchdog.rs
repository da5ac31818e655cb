//! Connectivity watchdog: the physical button is the operator's way to put
//! the rig back on a network.
//!
//! A hold of at least [`LONG_PRESS`] hands the process over to the recovery
//! tool, which replaces this process image. When no connection can be made
//! at startup the same hand-off is tried first; if it cannot happen, the
//! button LED flashes until the operator presses and releases the button.

use anyhow::{Context, Result};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::gpio::{Handle, Level};
use crate::orchestrator::Lifecycle;
use crate::state::SharedState;

pub const LONG_PRESS: Duration = Duration::from_secs(2);
pub const FLASH_INTERVAL: Duration = Duration::from_millis(50);
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// Recovery procedure
// ---------------------------------------------------------------------------

pub trait Recovery: Send + Sync {
    /// Replace the running process with the recovery tool. Returns only when
    /// that could not happen.
    fn supersede(&self) -> anyhow::Error;
}

/// `wifi-connect` captive-portal hand-off.
pub struct WifiConnect {
    program: String,
    args: Vec<String>,
}

impl WifiConnect {
    pub fn new(program: &str, ssid: &str) -> Self {
        Self {
            program: program.to_string(),
            args: vec![format!("-s={ssid}")],
        }
    }

    /// Resolve the program on `PATH`, or as given when it names a path.
    pub fn locate(&self) -> Result<PathBuf> {
        which::which(&self.program).with_context(|| format!("{} not found", self.program))
    }
}

impl Recovery for WifiConnect {
    fn supersede(&self) -> anyhow::Error {
        let path = match self.locate() {
            Ok(p) => p,
            Err(e) => return e,
        };
        info!(program = %path.display(), args = ?self.args, "handing over to network recovery");
        let err = Command::new(&path).arg0(&self.program).args(&self.args).exec();
        anyhow::Error::new(err).context(format!("could not exec {}", path.display()))
    }
}

// ---------------------------------------------------------------------------
// Watchdog
// ---------------------------------------------------------------------------

pub struct Watchdog {
    button: Handle,
    led: Handle,
    recovery: Arc<dyn Recovery>,
    status: SharedState,
}

impl Watchdog {
    pub fn new(button: Handle, led: Handle, recovery: Arc<dyn Recovery>, status: SharedState) -> Self {
        Self {
            button,
            led,
            recovery,
            status,
        }
    }

    /// Startup path after the first connection attempt failed. Returns false
    /// if shutdown arrived while waiting for the operator.
    pub async fn recover_at_startup(&mut self, shutdown: &CancellationToken) -> bool {
        {
            let mut st = self.status.write().await;
            st.set_lifecycle(Lifecycle::Recovering);
            st.record_recovery("no connection at startup".to_string());
        }
        self.hand_off("no connection at startup").await;

        info!("waiting for operator: press and release the button to continue");
        let released = self.await_operator(shutdown).await;
        self.led.write(Level::Low);
        if released {
            self.status
                .write()
                .await
                .record_recovery("operator acknowledged, continuing startup".to_string());
        }
        released
    }

    /// Flash the LED until the button goes high and then low again.
    async fn await_operator(&mut self, shutdown: &CancellationToken) -> bool {
        let mut flash = tokio::time::interval(FLASH_INTERVAL);
        let mut pressed = false;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = flash.tick() => {}
            }
            self.led.toggle();
            if self.button.read().is_high() {
                pressed = true;
            } else if pressed {
                return true;
            }
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        info!(long_press = ?LONG_PRESS, "connectivity watchdog started");
        loop {
            if !pause(POLL_INTERVAL, &shutdown).await {
                break;
            }
            if !self.button.read().is_high() {
                continue;
            }
            let Some(held) = self.time_press(&shutdown).await else {
                break;
            };
            if held >= LONG_PRESS {
                self.hand_off("long button press").await;
            } else {
                debug!(?held, "short press ignored");
            }
        }
        self.led.write(Level::Low);
        info!("connectivity watchdog stopped");
        Ok(())
    }

    /// Time a press until release. The LED lights once the hold is long
    /// enough to count.
    async fn time_press(&mut self, shutdown: &CancellationToken) -> Option<Duration> {
        let pressed_at = Instant::now();
        let mut lit = false;
        while self.button.read().is_high() {
            if !lit && pressed_at.elapsed() >= LONG_PRESS {
                self.led.write(Level::High);
                lit = true;
                info!("long press detected, release to start network recovery");
            }
            if !pause(POLL_INTERVAL, shutdown).await {
                return None;
            }
        }
        if lit {
            self.led.write(Level::Low);
        }
        Some(pressed_at.elapsed())
    }

    /// On success the process image is gone and this never returns.
    async fn hand_off(&mut self, reason: &str) {
        warn!(reason, "starting network recovery");
        let previous = {
            let mut st = self.status.write().await;
            let previous = st.lifecycle;
            st.set_lifecycle(Lifecycle::Superseded);
            st.record_recovery(format!("network recovery: {reason}"));
            previous
        };

        let err = self.recovery.supersede();
        error!("network recovery failed: {err:#}");
        let mut st = self.status.write().await;
        st.set_lifecycle(previous);
        st.record_error(format!("network recovery failed: {err:#}"));
    }
}

async fn pause(d: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(d) => true,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
