//! Deterministic simulation harness for pairchat.
//!
//! This crate provides a seeded, virtual-clock implementation of the
//! `Environment` trait plus oracles for the pairing invariants, so pairing
//! and scheduler behaviour can be replayed exactly from a seed.
//!
//! # Why a virtual clock?
//!
//! The reset scheduler sleeps until quarter-hour or midnight boundaries.
//! With a real clock a test would wait up to a day; with [`SimEnv`] a sleep
//! advances virtual time instantly and records the wake-up, so boundary
//! alignment and failure backoff are directly observable.
//!
//! # Example
//!
//! ```rust,ignore
//! use pairchat_harness::{SimEnv, seed_users};
//!
//! let env = SimEnv::with_seed(7);
//! let store = Arc::new(MemoryStore::new());
//! seed_users(&*store, &env, 5).await?;
//! let engine = PairingEngine::new(store.clone(), env.clone());
//! let report = engine.full_reshuffle().await?;
//! check_partition(&report.rooms, report.unpaired.as_ref(), 5)?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod sim_env;

use std::collections::HashSet;

use pairchat_core::{Environment, Room, Store, StoreError, User, UserFilter, UserId};
pub use sim_env::SimEnv;

/// Insert `count` unpaired users named `user-000`, `user-001`, ...
///
/// Returns their identities in insertion order.
pub async fn seed_users(
    store: &dyn Store,
    env: &impl Environment,
    count: usize,
) -> Result<Vec<UserId>, StoreError> {
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        let id = UserId::new(format!("user-{i:03}"));
        store.insert_user(&User::new(id.clone(), env.now())).await?;
        ids.push(id);
    }
    Ok(ids)
}

/// Oracle: `rooms` partition `population` users into disjoint pairs, with
/// exactly one `unpaired` leftover iff the population is odd.
pub fn check_partition(
    rooms: &[Room],
    unpaired: Option<&UserId>,
    population: usize,
) -> Result<(), String> {
    let mut seen = HashSet::new();
    for room in rooms {
        if room.users.len() != 2 {
            return Err(format!("room {} has {} members", room.id, room.users.len()));
        }
        for user in &room.users {
            if !seen.insert(user.clone()) {
                return Err(format!("user {user} appears in two rooms"));
            }
        }
    }

    match (population % 2, unpaired) {
        (0, Some(user)) => return Err(format!("even population left {user} unpaired")),
        (1, None) => return Err("odd population left nobody unpaired".to_string()),
        (_, Some(user)) if seen.contains(user) => {
            return Err(format!("unpaired user {user} is also in a room"));
        },
        _ => {},
    }

    let covered = seen.len() + usize::from(unpaired.is_some());
    if covered == population {
        Ok(())
    } else {
        Err(format!("{covered} of {population} users accounted for"))
    }
}

/// Oracle: every stored user's room reference agrees with room membership.
pub async fn check_references(store: &dyn Store) -> Result<(), String> {
    let rooms = store.list_rooms().await.map_err(|e| e.to_string())?;
    let users = store
        .query_users(UserFilter::All, None)
        .await
        .map_err(|e| e.to_string())?;

    for user in &users {
        let Some(room_id) = &user.room_id else {
            continue;
        };
        let Some(room) = rooms.iter().find(|r| &r.id == room_id) else {
            return Err(format!("user {} references missing room {room_id}", user.id));
        };
        if !room.has_member(&user.id) {
            return Err(format!("user {} references room {room_id} without membership", user.id));
        }
    }

    for room in &rooms {
        for member in &room.users {
            let referenced =
                users.iter().any(|u| &u.id == member && u.room_id.as_ref() == Some(&room.id));
            if !referenced {
                return Err(format!("member {member} of {} does not reference it", room.id));
            }
        }
    }
    Ok(())
}
