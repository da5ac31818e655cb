//! Air pump duty cycle: high for `on`, low for `off`, forever.

use anyhow::Result;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::gpio::{Handle, Level};
use crate::state::SharedState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DutyCycle {
    pub on: Duration,
    pub off: Duration,
}

impl Default for DutyCycle {
    fn default() -> Self {
        Self {
            on: Duration::from_secs(30 * 60),
            off: Duration::from_secs(2 * 60 * 60),
        }
    }
}

pub struct AirPump {
    pin: Handle,
    status: SharedState,
}

impl AirPump {
    pub fn new(pin: Handle, status: SharedState) -> Self {
        Self { pin, status }
    }

    /// One on/off period. Returns false if shutdown cut it short.
    pub async fn run_duty_cycle(&mut self, duty: DutyCycle, shutdown: &CancellationToken) -> bool {
        self.set(Level::High).await;
        if !hold(duty.on, shutdown).await {
            return false;
        }
        self.set(Level::Low).await;
        hold(duty.off, shutdown).await
    }

    async fn set(&mut self, level: Level) {
        self.pin.write(level);
        debug!(?level, "air pump");
        self.status.write().await.record_pump(level.is_high());
    }

    pub async fn run(mut self, duty: DutyCycle, shutdown: CancellationToken) -> Result<()> {
        info!(on = ?duty.on, off = ?duty.off, "air pump cycle started");
        while self.run_duty_cycle(duty, &shutdown).await {}

        self.pin.write(Level::Low);
        self.status.write().await.record_pump(false);
        info!("air pump cycle stopped");
        Ok(())
    }
}

async fn hold(d: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(d) => true,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
