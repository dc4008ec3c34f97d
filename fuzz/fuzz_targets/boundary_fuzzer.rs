//! Fuzz target for [`next_boundary`]
//!
//! Catch drift or skipped resets in the boundary arithmetic.
//!
//! # Strategy
//!
//! - Instants: arbitrary seconds across several centuries
//! - Offsets: every whole-minute offset chrono accepts
//! - Cadences: both quarter-hour and midnight
//!
//! # Invariants
//!
//! - The boundary is strictly after the input instant
//! - Quarter-hour boundaries are at most 15 minutes away and land on a local
//!   `:00`, `:15`, `:30` or `:45` with zero seconds
//! - Midnight boundaries are at most 24 hours away and land on local 00:00:00
//! - NEVER panic

#![no_main]

use arbitrary::Arbitrary;
use chrono::{DateTime, FixedOffset, TimeDelta, Timelike};
use libfuzzer_sys::fuzz_target;
use pairchat_core::{ResetCadence, next_boundary};

/// 1900-01-01 to 2300-01-01, in seconds since the epoch.
const MIN_SECS: i64 = -2_208_988_800;
const MAX_SECS: i64 = 10_413_792_000;

#[derive(Debug, Arbitrary)]
struct Input {
    secs: i64,
    nanos: u32,
    offset_minutes: i16,
    midnight: bool,
}

fuzz_target!(|input: Input| {
    let secs = MIN_SECS + input.secs.rem_euclid(MAX_SECS - MIN_SECS);
    let Some(now) = DateTime::from_timestamp(secs, input.nanos % 1_000_000_000) else {
        return;
    };
    let Some(offset) = FixedOffset::east_opt(i32::from(input.offset_minutes) * 60) else {
        return;
    };
    let cadence = if input.midnight { ResetCadence::Midnight } else { ResetCadence::QuarterHour };

    let boundary = next_boundary(now, cadence, offset);
    assert!(boundary > now, "{boundary} not after {now}");

    let local = boundary.with_timezone(&offset);
    assert_eq!(local.second(), 0);
    assert_eq!(local.nanosecond(), 0);

    match cadence {
        ResetCadence::QuarterHour => {
            assert!(boundary - now <= TimeDelta::minutes(15));
            assert_eq!(local.minute() % 15, 0);
        },
        ResetCadence::Midnight => {
            assert!(boundary - now <= TimeDelta::days(1));
            assert_eq!((local.hour(), local.minute()), (0, 0));
        },
    }
});
