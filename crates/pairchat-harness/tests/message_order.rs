//! Replay order of stored turns.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use pairchat_core::{MemoryStore, MessageRelay, Passthrough, RoomId, Store, Turn, TurnId, UserId};
use pairchat_harness::SimEnv;
use proptest::prelude::*;

fn turn(index: usize, room: &RoomId, created_at: Option<DateTime<Utc>>) -> Turn {
    Turn {
        id: TurnId::new(format!("turn-{index:03}")),
        room_id: room.clone(),
        original_sender_id: UserId::from("user-000"),
        original_text: format!("m{index}"),
        processed_text: format!("m{index}"),
        created_at,
        processed_at: created_at,
    }
}

#[test]
fn prop_replay_is_ordered_with_undated_first() {
    let base = DateTime::<Utc>::UNIX_EPOCH;
    proptest!(|(offsets in prop::collection::vec(prop::option::of(0i64..20), 0..30))| {
        let result: Result<Vec<Turn>, String> = tokio::runtime::Builder::new_current_thread()
            .build()
            .map_err(|e| TestCaseError::fail(e.to_string()))?
            .block_on(async {
                let store = Arc::new(MemoryStore::new());
                let room = RoomId::from("room_a");
                let other = RoomId::from("room_b");
                for (i, offset) in offsets.iter().enumerate() {
                    let at = offset.map(|s| base + TimeDelta::seconds(s));
                    store.put_turn(&turn(i, &room, at)).await.map_err(|e| e.to_string())?;
                    store.put_turn(&turn(i, &other, at)).await.map_err(|e| e.to_string())?;
                }
                let relay = MessageRelay::new(store, Arc::new(Passthrough), SimEnv::with_seed(0));
                relay.get_messages(&room).await.map_err(|e| e.to_string())
            });
        let turns = result.map_err(TestCaseError::fail)?;

        prop_assert_eq!(turns.len(), offsets.len());
        prop_assert!(turns.iter().all(|t| t.room_id.as_str() == "room_a"));
        prop_assert!(turns.windows(2).all(|w| w[0].created_at <= w[1].created_at));

        let undated = offsets.iter().filter(|o| o.is_none()).count();
        prop_assert!(turns[..undated].iter().all(|t| t.created_at.is_none()));

        // Equal timestamps keep insertion order.
        for w in turns.windows(2) {
            if w[0].created_at == w[1].created_at {
                prop_assert!(w[0].id < w[1].id);
            }
        }
    });
}

#[tokio::test]
async fn sent_messages_replay_in_send_order() {
    let env = SimEnv::with_seed(3);
    let store = Arc::new(MemoryStore::new());
    let relay = MessageRelay::new(store, Arc::new(Passthrough), env.clone());
    let room = RoomId::from("room_a");
    let sender = UserId::from("user-000");

    for text in ["first", "second", "third"] {
        relay.send_message(&room, &sender, text).await.unwrap();
        env.advance(std::time::Duration::from_secs(1));
    }

    let texts: Vec<_> = relay
        .get_messages(&room)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.processed_text)
        .collect();
    assert_eq!(texts, ["first", "second", "third"]);
}
