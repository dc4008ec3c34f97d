//! Pairing Engine
//!
//! Assigns users to two-person rooms.
//!
//! ## Operations
//!
//! - `try_pair_one`: on-demand, best-effort. Pairs two random users out of a
//!   bounded candidate set of unpaired users.
//! - `full_reshuffle`: stop-the-world. Deletes every room and turn, clears
//!   every room reference and re-partitions the whole user population.
//!
//! ## Design
//!
//! - No transactions: each step is an independent store write, so a failure
//!   can leave a room whose members' references lag behind. Callers re-read
//!   users instead of trusting the returned room.
//! - Pairing lease: both operations hold the same async mutex for their whole
//!   duration, so within one process they never interleave.
//! - Odd user out: the last user of an odd population stays unpaired until
//!   the next epoch. Three-person rooms are not formed.

use std::sync::Arc;

use rand::seq::SliceRandom;
use tokio::sync::Mutex;

use crate::{
    env::Environment,
    model::{Room, RoomId, User, UserId},
    store::{Store, StoreError, TurnFilter, UserFilter},
};

/// Default cap on the candidate set read by [`PairingEngine::try_pair_one`].
pub const DEFAULT_CANDIDATE_LIMIT: usize = 10;

/// Result of an on-demand pairing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairOutcome {
    /// A room was created and both members were assigned to it.
    Paired(Room),

    /// The room was created but some members' room references could not be
    /// written. The room persists; the listed users remain unpaired until a
    /// later attempt or reshuffle.
    PartiallyAssigned {
        /// The persisted room
        room: Room,
        /// Members whose room reference update failed
        unassigned: Vec<UserId>,
    },

    /// Fewer than two unpaired users were available.
    NotEnoughUsers {
        /// How many unpaired candidates were found
        available: usize,
    },
}

impl PairOutcome {
    /// The room that was created, if any.
    pub fn room(&self) -> Option<&Room> {
        match self {
            Self::Paired(room) | Self::PartiallyAssigned { room, .. } => Some(room),
            Self::NotEnoughUsers { .. } => None,
        }
    }
}

/// Summary of a full reshuffle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReshuffleReport {
    /// Rooms removed from the previous epoch
    pub rooms_deleted: usize,
    /// Turns removed from the previous epoch
    pub turns_deleted: usize,
    /// Rooms created for the new epoch
    pub rooms: Vec<Room>,
    /// The odd user out, if the population was odd
    pub unpaired: Option<UserId>,
}

/// Errors from pairing operations.
#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    /// A store operation failed before any room was created.
    #[error("store error during {stage}: {source}")]
    Store {
        /// Which step failed
        stage: &'static str,
        /// Underlying store error
        #[source]
        source: StoreError,
    },
}

impl PairingError {
    fn store(stage: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| Self::Store { stage, source }
    }
}

/// Assigns users to rooms.
pub struct PairingEngine<E>
where
    E: Environment,
{
    store: Arc<dyn Store>,
    env: E,
    candidate_limit: usize,
    /// Held by both operations for their whole duration
    lease: Mutex<()>,
}

impl<E> PairingEngine<E>
where
    E: Environment,
{
    /// Create an engine with the default candidate limit.
    pub fn new(store: Arc<dyn Store>, env: E) -> Self {
        Self::with_candidate_limit(store, env, DEFAULT_CANDIDATE_LIMIT)
    }

    /// Create an engine reading at most `candidate_limit` unpaired users per
    /// `try_pair_one` call. Limits below 2 are raised to 2.
    pub fn with_candidate_limit(store: Arc<dyn Store>, env: E, candidate_limit: usize) -> Self {
        Self { store, env, candidate_limit: candidate_limit.max(2), lease: Mutex::new(()) }
    }

    /// The configured candidate limit.
    pub fn candidate_limit(&self) -> usize {
        self.candidate_limit
    }

    /// Pair two random users drawn from a bounded set of unpaired users.
    ///
    /// Randomness is uniform over the fetched candidates, not the whole
    /// population.
    ///
    /// # Errors
    ///
    /// Returns `PairingError::Store` if reading candidates or creating the
    /// room fails. Failures assigning members after the room exists are
    /// reported as [`PairOutcome::PartiallyAssigned`] instead.
    pub async fn try_pair_one(&self) -> Result<PairOutcome, PairingError> {
        let _lease = self.lease.lock().await;

        let candidates: Vec<User> = self
            .store
            .query_users(UserFilter::Unpaired, Some(self.candidate_limit))
            .await
            .map_err(PairingError::store("query unpaired users"))?
            .into_iter()
            .filter(|u| !u.is_paired())
            .collect();

        if candidates.len() < 2 {
            tracing::debug!(available = candidates.len(), "not enough unpaired users to pair");
            return Ok(PairOutcome::NotEnoughUsers { available: candidates.len() });
        }

        let mut rng = self.env.rng();
        let members: Vec<UserId> =
            candidates.choose_multiple(&mut rng, 2).map(|u| u.id.clone()).collect();

        let room = self.new_room(members);
        self.store.put_room(&room).await.map_err(PairingError::store("create room"))?;

        let unassigned = self.assign_members(&room).await;
        if unassigned.is_empty() {
            tracing::info!(room_id = %room.id, "paired users on demand");
            Ok(PairOutcome::Paired(room))
        } else {
            tracing::warn!(
                room_id = %room.id,
                unassigned = unassigned.len(),
                "room created but member assignment incomplete"
            );
            Ok(PairOutcome::PartiallyAssigned { room, unassigned })
        }
    }

    /// Delete every room and turn, then re-pair the entire user population.
    ///
    /// Users are shuffled uniformly and partitioned into consecutive pairs.
    /// With an odd population the last user stays unpaired.
    ///
    /// # Errors
    ///
    /// Returns `PairingError::Store` on the first failed write. The sequence
    /// is not atomic: earlier steps are not rolled back.
    pub async fn full_reshuffle(&self) -> Result<ReshuffleReport, PairingError> {
        let _lease = self.lease.lock().await;

        let old_rooms =
            self.store.list_rooms().await.map_err(PairingError::store("list rooms"))?;
        for room in &old_rooms {
            self.store.delete_room(&room.id).await.map_err(PairingError::store("delete room"))?;
        }

        let turns_deleted = self
            .store
            .delete_turns(TurnFilter::All)
            .await
            .map_err(PairingError::store("delete turns"))?;

        let mut users = self
            .store
            .query_users(UserFilter::All, None)
            .await
            .map_err(PairingError::store("query users"))?;

        for user in users.iter().filter(|u| u.is_paired()) {
            self.store
                .set_user_room(&user.id, None)
                .await
                .map_err(PairingError::store("clear room reference"))?;
        }

        users.shuffle(&mut self.env.rng());

        let mut rooms = Vec::with_capacity(users.len() / 2);
        let pairs = users.chunks_exact(2);
        let unpaired = pairs.remainder().first().map(|u| u.id.clone());

        for pair in pairs {
            let room = self.new_room(pair.iter().map(|u| u.id.clone()).collect());
            self.store.put_room(&room).await.map_err(PairingError::store("create room"))?;
            for member in &room.users {
                self.store
                    .set_user_room(member, Some(&room.id))
                    .await
                    .map_err(PairingError::store("assign room"))?;
            }
            rooms.push(room);
        }

        tracing::info!(
            rooms_deleted = old_rooms.len(),
            turns_deleted,
            rooms_created = rooms.len(),
            odd_user_out = unpaired.is_some(),
            "full reshuffle complete"
        );

        Ok(ReshuffleReport { rooms_deleted: old_rooms.len(), turns_deleted, rooms, unpaired })
    }

    fn new_room(&self, users: Vec<UserId>) -> Room {
        Room { id: RoomId::from_uuid(self.env.random_uuid()), created_at: self.env.now(), users }
    }

    /// Point every member at `room`, returning the members whose update
    /// failed.
    async fn assign_members(&self, room: &Room) -> Vec<UserId> {
        let mut unassigned = Vec::new();
        for member in &room.users {
            if let Err(e) = self.store.set_user_room(member, Some(&room.id)).await {
                tracing::warn!(
                    room_id = %room.id,
                    user_id = %member,
                    "room assignment failed: {e}"
                );
                unassigned.push(member.clone());
            }
        }
        unassigned
    }
}

impl<E> std::fmt::Debug for PairingEngine<E>
where
    E: Environment,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingEngine").field("candidate_limit", &self.candidate_limit).finish()
    }
}
