//! Reset cadence and boundary computation.
//!
//! Boundaries are wall-clock instants in a fixed UTC offset: every quarter
//! hour (`:00`, `:15`, `:30`, `:45`) or every local midnight. The returned
//! boundary is always strictly after the input instant.

use std::{fmt, str::FromStr};

use chrono::{DateTime, FixedOffset, NaiveTime, TimeDelta, Timelike, Utc};

const QUARTER_HOUR_SECS: i64 = 15 * 60;

/// How often the full reshuffle runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResetCadence {
    /// On every quarter-hour mark.
    #[default]
    QuarterHour,
    /// At local midnight.
    Midnight,
}

impl fmt::Display for ResetCadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QuarterHour => f.write_str("quarter-hour"),
            Self::Midnight => f.write_str("midnight"),
        }
    }
}

/// Unknown cadence name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown reset cadence {0:?} (expected \"quarter-hour\" or \"midnight\")")]
pub struct ParseCadenceError(String);

impl FromStr for ResetCadence {
    type Err = ParseCadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quarter-hour" | "quarter_hour" | "15m" => Ok(Self::QuarterHour),
            "midnight" | "daily" => Ok(Self::Midnight),
            _ => Err(ParseCadenceError(s.to_string())),
        }
    }
}

/// The first `cadence` boundary strictly after `now`, evaluated in `offset`.
pub fn next_boundary(
    now: DateTime<Utc>,
    cadence: ResetCadence,
    offset: FixedOffset,
) -> DateTime<Utc> {
    let local = now.with_timezone(&offset);
    let local_midnight = local.date_naive().and_time(NaiveTime::MIN);

    let next_local = match cadence {
        ResetCadence::QuarterHour => {
            let elapsed = i64::from(local.num_seconds_from_midnight());
            let next = (elapsed / QUARTER_HOUR_SECS + 1) * QUARTER_HOUR_SECS;
            local_midnight + TimeDelta::seconds(next)
        },
        ResetCadence::Midnight => local_midnight + TimeDelta::days(1),
    };

    let utc = next_local - TimeDelta::seconds(i64::from(offset.local_minus_utc()));
    DateTime::from_naive_utc_and_offset(utc, Utc)
}
