//! Fuzz target for [`sort_turns`]
//!
//! Replay order must be total and stable whatever timestamps the store holds.
//!
//! # Invariants
//!
//! - Undated turns come first
//! - Dated turns are non-decreasing in creation time
//! - Turns with equal timestamps keep their store order
//! - Sorting is a permutation: no turn is lost or duplicated

#![no_main]

use chrono::{DateTime, TimeDelta};
use libfuzzer_sys::fuzz_target;
use pairchat_core::{RoomId, Turn, TurnId, UserId, sort_turns};

fuzz_target!(|stamps: Vec<Option<i32>>| {
    let room = RoomId::from("room_fuzz");
    let mut turns: Vec<Turn> = stamps
        .iter()
        .enumerate()
        .map(|(i, stamp)| {
            let created_at =
                stamp.map(|s| DateTime::UNIX_EPOCH + TimeDelta::seconds(i64::from(s)));
            Turn {
                id: TurnId::new(format!("{i:010}")),
                room_id: room.clone(),
                original_sender_id: UserId::from("fuzz"),
                original_text: String::new(),
                processed_text: String::new(),
                created_at,
                processed_at: None,
            }
        })
        .collect();

    sort_turns(&mut turns);

    assert_eq!(turns.len(), stamps.len());
    let undated = stamps.iter().filter(|s| s.is_none()).count();
    assert!(turns[..undated].iter().all(|t| t.created_at.is_none()));
    for pair in turns.windows(2) {
        assert!(pair[0].created_at <= pair[1].created_at);
        if pair[0].created_at == pair[1].created_at {
            assert!(pair[0].id < pair[1].id);
        }
    }

    let mut ids: Vec<_> = turns.iter().map(|t| t.id.as_str().to_string()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), stamps.len());
});
