//! Time-of-day windows for the grow lights.
//!
//! All comparisons happen on offsets since midnight. A window whose off time
//! is earlier than its on time wraps past midnight; its end is shifted by a
//! day and every instant is tested both as-is and one day later, so an
//! instant just after midnight still lands inside the wrapped window.

use anyhow::{Context, Result};
use std::time::Duration;
use time::macros::format_description;
use time::{OffsetDateTime, Time, UtcOffset};

pub const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// True iff `start < now < end`. Boundaries are exclusive, so the instant a
/// window opens or closes belongs to neither side.
pub fn in_window(now: Duration, start: Duration, end: Duration) -> bool {
    start < now && now < end
}

pub fn since_midnight(t: Time) -> Duration {
    let (h, m, s, nanos) = t.as_hms_nano();
    Duration::new(u64::from(h) * 3600 + u64::from(m) * 60 + u64::from(s), nanos)
}

/// Parse a `HH:MM:SS` time of day.
pub fn parse_time_of_day(s: &str) -> Result<Time> {
    let fmt = format_description!("[hour]:[minute]:[second]");
    Time::parse(s.trim(), &fmt).with_context(|| format!("invalid time of day {s:?} (expected HH:MM:SS)"))
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub on: Time,
    pub off: Time,
}

impl Schedule {
    pub fn parse(on: &str, off: &str) -> Result<Self> {
        Ok(Self {
            on: parse_time_of_day(on).context("ledOnTime")?,
            off: parse_time_of_day(off).context("ledOffTime")?,
        })
    }

    pub fn wraps_midnight(&self) -> bool {
        self.off < self.on
    }

    fn on_bounds(&self) -> (Duration, Duration) {
        let start = since_midnight(self.on);
        let mut end = since_midnight(self.off);
        if end < start {
            end += DAY;
        }
        (start, end)
    }

    fn off_bounds(&self) -> (Duration, Duration) {
        let (start, end) = self.on_bounds();
        (end, start + DAY)
    }

    /// Strictly inside the lights-on window.
    pub fn is_on_time(&self, now: Time) -> bool {
        within(now, self.on_bounds())
    }

    /// Strictly inside the complementary lights-off window.
    pub fn is_off_time(&self, now: Time) -> bool {
        within(now, self.off_bounds())
    }
}

fn within(now: Time, (start, end): (Duration, Duration)) -> bool {
    let now = since_midnight(now);
    in_window(now, start, end) || in_window(now + DAY, start, end)
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of the current local time of day.
#[derive(Debug, Clone, Copy)]
pub enum Clock {
    /// Wall clock at a fixed UTC offset, captured once at startup.
    Wall(UtcOffset),
    #[cfg(test)]
    Fixed(Time),
}

impl Clock {
    pub fn time_of_day(&self) -> Time {
        match self {
            Clock::Wall(offset) => OffsetDateTime::now_utc().to_offset(*offset).time(),
            #[cfg(test)]
            Clock::Fixed(t) => *t,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
