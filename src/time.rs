//! Clock and wall-clock helpers.
//!
//! Rule evaluation and executers never call `Utc::now()` directly; they read
//! an injected [`Clock`] so time-dependent behavior is reproducible in tests.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Datelike, Duration, Local, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Source of the current instant.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current instant in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    /// Moves the clock to `at`.
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }

    /// Moves the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Timezone in which a time rule reads the wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeZoneSpec {
    /// The server's local timezone.
    #[default]
    Local,
    /// Coordinated universal time.
    Utc,
}

/// Calendar and clock fields of one instant in one timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WallFields {
    /// Day of the week, 0 = Monday.
    pub weekday: u32,
    /// Day of the month, starting at 1.
    pub monthday: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

impl WallFields {
    /// Reads the fields of `at` in timezone `tz`.
    #[must_use]
    pub fn at(at: DateTime<Utc>, tz: TimeZoneSpec) -> Self {
        match tz {
            TimeZoneSpec::Utc => Self::from_datetime(&at),
            TimeZoneSpec::Local => Self::from_datetime(&at.with_timezone(&Local)),
        }
    }

    fn from_datetime<T: Datelike + Timelike>(dt: &T) -> Self {
        Self {
            weekday: dt.weekday().num_days_from_monday(),
            monthday: dt.day(),
            hour: dt.hour(),
            minute: dt.minute(),
            second: dt.second(),
        }
    }
}

/// The "never triggered" timestamp.
#[must_use]
pub const fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Converts configured seconds to a duration, saturating instead of overflowing.
#[must_use]
pub fn secs(seconds: u64) -> Duration {
    Duration::seconds(i64::from(u32::try_from(seconds).unwrap_or(u32::MAX)))
}

/// Converts a unix timestamp to an instant, falling back to the epoch when out of range.
#[must_use]
pub fn from_unix(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(seconds, 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(from_unix(1_000));
        clock.advance(Duration::seconds(5));
        assert_eq!(clock.now(), from_unix(1_005));
        clock.set(from_unix(10));
        assert_eq!(clock.now(), from_unix(10));
    }

    #[test]
    fn test_wall_fields_utc() {
        // 2024-01-01T13:45:30Z was a Monday.
        let at = DateTime::parse_from_rfc3339("2024-01-01T13:45:30Z").unwrap().with_timezone(&Utc);
        let fields = WallFields::at(at, TimeZoneSpec::Utc);
        assert_eq!(fields.weekday, 0);
        assert_eq!(fields.monthday, 1);
        assert_eq!(fields.hour, 13);
        assert_eq!(fields.minute, 45);
        assert_eq!(fields.second, 30);
    }

    #[test]
    fn test_secs_saturates() {
        assert_eq!(secs(5), Duration::seconds(5));
        assert_eq!(secs(u64::MAX), Duration::seconds(i64::from(u32::MAX)));
    }

    #[test]
    fn test_timezone_serde() {
        let tz: TimeZoneSpec = serde_json::from_str("\"utc\"").unwrap();
        assert_eq!(tz, TimeZoneSpec::Utc);
        assert_eq!(TimeZoneSpec::default(), TimeZoneSpec::Local);
    }
}
