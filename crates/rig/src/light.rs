//! Grow-light cycle: edge-triggered switching between LED_ON and LED_OFF.
//!
//! ```text
//! LED_OFF ──[on < now < off]──────────▶ LED_ON
//!    ▲                                     │
//!    └────────[off < now < on + 24h]───────┘
//! ```
//!
//! The cycle keeps its own view of the light. The pin is read back once at
//! construction and afterwards only to cross-check, never to decide.

use anyhow::Result;
use std::time::Duration;
use time::Time;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::gpio::{Handle, Level};
use crate::state::SharedState;
use crate::window::{Clock, Schedule};

pub const TICK_INTERVAL: Duration = Duration::from_secs(4);

pub struct LightCycle {
    pin: Handle,
    schedule: Option<Schedule>,
    on: bool,
}

impl LightCycle {
    pub fn new(pin: Handle, schedule: Option<Schedule>) -> Self {
        let on = pin.read().is_high();
        Self { pin, schedule, on }
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    /// Evaluate the schedule at `now`. Returns the level written, if the
    /// light changed state.
    pub fn tick(&mut self, now: Time) -> Option<Level> {
        self.cross_check();
        let schedule = self.schedule?;

        if !self.on && schedule.is_on_time(now) {
            self.pin.write(Level::High);
            self.on = true;
            Some(Level::High)
        } else if self.on && schedule.is_off_time(now) {
            self.pin.write(Level::Low);
            self.on = false;
            Some(Level::Low)
        } else {
            None
        }
    }

    fn cross_check(&self) {
        let actual = self.pin.read().is_high();
        if actual != self.on {
            warn!(expected_on = self.on, actual_on = actual, "grow light read-back mismatch");
        }
    }

    pub async fn run(mut self, clock: Clock, status: SharedState, shutdown: CancellationToken) -> Result<()> {
        match self.schedule {
            Some(s) => info!(on = %s.on, off = %s.off, wraps = s.wraps_midnight(), "light cycle started"),
            None => info!("light cycle started with no schedule, light stays off"),
        }

        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let now = clock.time_of_day();
            if let Some(level) = self.tick(now) {
                info!(%now, ?level, "grow light switched");
                status.write().await.record_light(level.is_high());
            } else {
                debug!(%now, on = self.is_on(), "light tick");
            }
        }

        self.pin.write(Level::Low);
        if self.on {
            self.on = false;
            status.write().await.record_light(false);
        }
        info!("light cycle stopped");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::{MockPin, Mode, PinProbe};
    use crate::state::SystemState;
    use time::macros::time;

    fn cycle(schedule: Option<Schedule>) -> (LightCycle, PinProbe) {
        let (pin, probe) = MockPin::new("growLight", 19, Mode::Output);
        (LightCycle::new(Box::new(pin), schedule), probe)
    }

    fn day() -> Option<Schedule> {
        Some(Schedule::parse("08:00:00", "20:00:00").unwrap())
    }

    #[test]
    fn day_schedule_switches_on_then_off() {
        let (mut light, probe) = cycle(day());
        assert_eq!(light.tick(time!(09:00:00)), Some(Level::High));
        assert_eq!(probe.level(), Level::High);
        assert_eq!(light.tick(time!(21:00:00)), Some(Level::Low));
        assert_eq!(probe.level(), Level::Low);
    }

    #[test]
    fn repeated_ticks_inside_window_write_once() {
        let (mut light, probe) = cycle(day());
        light.tick(time!(09:00:00));
        for t in [time!(09:00:04), time!(12:00:00), time!(19:59:59)] {
            assert_eq!(light.tick(t), None);
        }
        assert_eq!(probe.writes().len(), 1);
        assert!(light.is_on());
    }

    #[test]
    fn boundary_instants_cause_no_transition() {
        let (mut light, probe) = cycle(day());
        assert_eq!(light.tick(time!(08:00:00)), None);
        light.tick(time!(09:00:00));
        assert_eq!(light.tick(time!(20:00:00)), None);
        assert_eq!(probe.writes().len(), 1);
    }

    #[test]
    fn overnight_schedule_stays_on_past_midnight() {
        let (mut light, _probe) = cycle(Some(Schedule::parse("20:00:00", "06:00:00").unwrap()));
        assert_eq!(light.tick(time!(22:00:00)), Some(Level::High));
        assert_eq!(light.tick(time!(00:30:00)), None);
        assert_eq!(light.tick(time!(07:00:00)), Some(Level::Low));
    }

    #[test]
    fn no_schedule_never_switches_on() {
        let (mut light, probe) = cycle(None);
        for t in [time!(00:00:01), time!(09:00:00), time!(21:00:00)] {
            assert_eq!(light.tick(t), None);
        }
        assert!(probe.writes().is_empty());
    }

    #[test]
    fn initial_state_comes_from_read_back() {
        let (pin, probe) = MockPin::new("growLight", 19, Mode::Output);
        probe.drive(Level::High);
        let mut light = LightCycle::new(Box::new(pin), day());
        assert!(light.is_on());
        // Already on: entering the window again writes nothing.
        assert_eq!(light.tick(time!(09:00:00)), None);
        assert_eq!(light.tick(time!(21:00:00)), Some(Level::Low));
    }

    #[test]
    fn in_memory_state_wins_over_read_back() {
        let (mut light, probe) = cycle(day());
        probe.drive(Level::High);
        // Still believes the light is off, so it drives it on.
        assert_eq!(light.tick(time!(09:00:00)), Some(Level::High));
    }

    #[tokio::test(start_paused = true)]
    async fn run_switches_and_drives_low_on_shutdown() {
        let (pin, probe) = MockPin::new("growLight", 19, Mode::Output);
        let light = LightCycle::new(Box::new(pin), day());
        let status = SystemState::shared("rig-1");
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(light.run(
            Clock::Fixed(time!(09:00:00)),
            status.clone(),
            shutdown.clone(),
        ));
        tokio::time::sleep(TICK_INTERVAL * 3).await;
        assert_eq!(probe.level(), Level::High);
        assert!(status.read().await.light_on);

        shutdown.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(probe.level(), Level::Low);
        assert!(!status.read().await.light_on);
        assert_eq!(probe.writes().len(), 2);
    }
}
