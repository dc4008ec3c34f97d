//! Document store abstraction.
//!
//! The production deployment talks to an external document store. The only
//! capabilities relied on are get/set/delete by key and query by
//! field-equality filter, so that is all [`Store`] exposes. There are no
//! multi-document transactions: every method is an independent write.
//!
//! Two implementations live here:
//!
//! - [`MemoryStore`]: in-process collections, used by single-node
//!   deployments and tests
//! - [`ChaoticStore`]: wraps another store and injects failures, used to
//!   exercise the partial-failure paths of pairing and reshuffling

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::model::{Room, RoomId, Turn, User, UserId};

/// Errors from store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached or rejected the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A keyed update targeted a document that does not exist.
    #[error("{collection} document not found: {key}")]
    NotFound {
        /// Collection name
        collection: &'static str,
        /// Document key
        key: String,
    },
}

/// Field-equality filter over the Users collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserFilter {
    /// Every user.
    All,
    /// Users whose room reference is null.
    Unpaired,
    /// Users whose room reference equals the given room.
    InRoom(RoomId),
}

impl UserFilter {
    fn matches(&self, user: &User) -> bool {
        match self {
            Self::All => true,
            Self::Unpaired => user.room_id.is_none(),
            Self::InRoom(room_id) => user.room_id.as_ref() == Some(room_id),
        }
    }
}

/// Field-equality filter over the Turns collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnFilter {
    /// Every turn in every room.
    All,
    /// Turns owned by the given room.
    Room(RoomId),
}

/// Store operation names, used for fault injection and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    /// [`Store::get_user`]
    GetUser,
    /// [`Store::insert_user`]
    InsertUser,
    /// [`Store::set_user_room`]
    SetUserRoom,
    /// [`Store::query_users`]
    QueryUsers,
    /// [`Store::get_room`]
    GetRoom,
    /// [`Store::put_room`]
    PutRoom,
    /// [`Store::list_rooms`]
    ListRooms,
    /// [`Store::delete_room`]
    DeleteRoom,
    /// [`Store::put_turn`]
    PutTurn,
    /// [`Store::query_turns`]
    QueryTurns,
    /// [`Store::delete_turns`]
    DeleteTurns,
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Keyed and filtered access to the Users, Rooms and Turns collections.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Fetch a user by identity.
    async fn get_user(&self, id: &UserId) -> Result<Option<User>, StoreError>;

    /// Create a user unless one with the same identity exists.
    ///
    /// Returns `true` if the user was created, `false` if it already existed
    /// (the existing document is left untouched).
    async fn insert_user(&self, user: &User) -> Result<bool, StoreError>;

    /// Set or clear a user's room reference.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the user does not exist.
    async fn set_user_room(&self, id: &UserId, room_id: Option<&RoomId>)
    -> Result<(), StoreError>;

    /// Query users matching `filter`, returning at most `limit` of them.
    async fn query_users(
        &self,
        filter: UserFilter,
        limit: Option<usize>,
    ) -> Result<Vec<User>, StoreError>;

    /// Fetch a room by id.
    async fn get_room(&self, id: &RoomId) -> Result<Option<Room>, StoreError>;

    /// Create or replace a room document.
    async fn put_room(&self, room: &Room) -> Result<(), StoreError>;

    /// All rooms.
    async fn list_rooms(&self) -> Result<Vec<Room>, StoreError>;

    /// Delete a room. Deleting a missing room is not an error.
    async fn delete_room(&self, id: &RoomId) -> Result<(), StoreError>;

    /// Append a turn.
    async fn put_turn(&self, turn: &Turn) -> Result<(), StoreError>;

    /// Turns owned by a room, in store order.
    async fn query_turns(&self, room_id: &RoomId) -> Result<Vec<Turn>, StoreError>;

    /// Delete turns matching `filter`, returning how many were removed.
    async fn delete_turns(&self, filter: TurnFilter) -> Result<usize, StoreError>;
}

#[derive(Debug, Default)]
struct Collections {
    users: BTreeMap<UserId, User>,
    rooms: BTreeMap<RoomId, Room>,
    turns: Vec<Turn>,
}

/// In-process store.
///
/// Users are returned in identity order, turns in insertion order.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Collections>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Collections> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_user(&self, id: &UserId) -> Result<Option<User>, StoreError> {
        Ok(self.lock().users.get(id).cloned())
    }

    async fn insert_user(&self, user: &User) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        if inner.users.contains_key(&user.id) {
            return Ok(false);
        }
        inner.users.insert(user.id.clone(), user.clone());
        Ok(true)
    }

    async fn set_user_room(
        &self,
        id: &UserId,
        room_id: Option<&RoomId>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let user = inner
            .users
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound { collection: "users", key: id.to_string() })?;
        user.room_id = room_id.cloned();
        Ok(())
    }

    async fn query_users(
        &self,
        filter: UserFilter,
        limit: Option<usize>,
    ) -> Result<Vec<User>, StoreError> {
        let inner = self.lock();
        let matching = inner.users.values().filter(|u| filter.matches(u)).cloned();
        Ok(match limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }

    async fn get_room(&self, id: &RoomId) -> Result<Option<Room>, StoreError> {
        Ok(self.lock().rooms.get(id).cloned())
    }

    async fn put_room(&self, room: &Room) -> Result<(), StoreError> {
        self.lock().rooms.insert(room.id.clone(), room.clone());
        Ok(())
    }

    async fn list_rooms(&self) -> Result<Vec<Room>, StoreError> {
        Ok(self.lock().rooms.values().cloned().collect())
    }

    async fn delete_room(&self, id: &RoomId) -> Result<(), StoreError> {
        self.lock().rooms.remove(id);
        Ok(())
    }

    async fn put_turn(&self, turn: &Turn) -> Result<(), StoreError> {
        self.lock().turns.push(turn.clone());
        Ok(())
    }

    async fn query_turns(&self, room_id: &RoomId) -> Result<Vec<Turn>, StoreError> {
        Ok(self.lock().turns.iter().filter(|t| &t.room_id == room_id).cloned().collect())
    }

    async fn delete_turns(&self, filter: TurnFilter) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        let before = inner.turns.len();
        match filter {
            TurnFilter::All => inner.turns.clear(),
            TurnFilter::Room(room_id) => inner.turns.retain(|t| t.room_id != room_id),
        }
        Ok(before - inner.turns.len())
    }
}

/// Store wrapper that injects failures.
///
/// Two kinds of fault are supported and may be combined:
///
/// - a random failure rate applied to every operation, drawn from a seeded
///   RNG so runs are reproducible
/// - targeted faults: the next `n` calls of a given [`StoreOp`] fail
#[derive(Debug)]
pub struct ChaoticStore<S> {
    inner: S,
    failure_rate: f64,
    rng: Mutex<StdRng>,
    injected: Mutex<HashMap<StoreOp, u32>>,
}

impl<S: Store> ChaoticStore<S> {
    /// Wrap `inner` with a random failure rate in `[0.0, 1.0]`.
    pub fn new(inner: S, failure_rate: f64, seed: u64) -> Self {
        Self {
            inner,
            failure_rate: failure_rate.clamp(0.0, 1.0),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            injected: Mutex::new(HashMap::new()),
        }
    }

    /// Wrap `inner` without random failures; only injected faults apply.
    pub fn reliable(inner: S) -> Self {
        Self::new(inner, 0.0, 0)
    }

    /// Make the next `count` calls of `op` fail.
    pub fn inject(&self, op: StoreOp, count: u32) {
        *self.injected.lock().unwrap_or_else(PoisonError::into_inner).entry(op).or_default() +=
            count;
    }

    /// The wrapped store, bypassing fault injection.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn check(&self, op: StoreOp) -> Result<(), StoreError> {
        {
            let mut injected = self.injected.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(remaining) = injected.get_mut(&op).filter(|n| **n > 0) {
                *remaining -= 1;
                return Err(StoreError::Unavailable(format!("injected fault on {op}")));
            }
        }

        if self.failure_rate > 0.0 {
            let roll: f64 = self.rng.lock().unwrap_or_else(PoisonError::into_inner).r#gen();
            if roll < self.failure_rate {
                return Err(StoreError::Unavailable(format!("random fault on {op}")));
            }
        }

        Ok(())
    }
}

#[async_trait]
impl<S: Store> Store for ChaoticStore<S> {
    async fn get_user(&self, id: &UserId) -> Result<Option<User>, StoreError> {
        self.check(StoreOp::GetUser)?;
        self.inner.get_user(id).await
    }

    async fn insert_user(&self, user: &User) -> Result<bool, StoreError> {
        self.check(StoreOp::InsertUser)?;
        self.inner.insert_user(user).await
    }

    async fn set_user_room(
        &self,
        id: &UserId,
        room_id: Option<&RoomId>,
    ) -> Result<(), StoreError> {
        self.check(StoreOp::SetUserRoom)?;
        self.inner.set_user_room(id, room_id).await
    }

    async fn query_users(
        &self,
        filter: UserFilter,
        limit: Option<usize>,
    ) -> Result<Vec<User>, StoreError> {
        self.check(StoreOp::QueryUsers)?;
        self.inner.query_users(filter, limit).await
    }

    async fn get_room(&self, id: &RoomId) -> Result<Option<Room>, StoreError> {
        self.check(StoreOp::GetRoom)?;
        self.inner.get_room(id).await
    }

    async fn put_room(&self, room: &Room) -> Result<(), StoreError> {
        self.check(StoreOp::PutRoom)?;
        self.inner.put_room(room).await
    }

    async fn list_rooms(&self) -> Result<Vec<Room>, StoreError> {
        self.check(StoreOp::ListRooms)?;
        self.inner.list_rooms().await
    }

    async fn delete_room(&self, id: &RoomId) -> Result<(), StoreError> {
        self.check(StoreOp::DeleteRoom)?;
        self.inner.delete_room(id).await
    }

    async fn put_turn(&self, turn: &Turn) -> Result<(), StoreError> {
        self.check(StoreOp::PutTurn)?;
        self.inner.put_turn(turn).await
    }

    async fn query_turns(&self, room_id: &RoomId) -> Result<Vec<Turn>, StoreError> {
        self.check(StoreOp::QueryTurns)?;
        self.inner.query_turns(room_id).await
    }

    async fn delete_turns(&self, filter: TurnFilter) -> Result<usize, StoreError> {
        self.check(StoreOp::DeleteTurns)?;
        self.inner.delete_turns(filter).await
    }
}
