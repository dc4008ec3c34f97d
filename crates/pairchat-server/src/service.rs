//! Per-process service object.
//!
//! `Service` owns everything a request handler touches: the store, the
//! pairing engine, the relay, the fan-out and the reset scheduler. It is
//! built once at startup, shared as `Arc<Service<E>>` through the router
//! state, started by [`Server::run`](crate::Server::run) and torn down on
//! shutdown. Nothing lives in globals.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use axum::http::HeaderMap;
use pairchat_core::{
    Environment, MemoryStore, MessageRelay, PairOutcome, PairingEngine, PairingError, Passthrough,
    RelayError, ReshuffleReport, Room, RoomId, Store, StoreError, TextTransform, Turn, User, UserId,
};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    auth::{self, AuthError, IdentityVerifier},
    config::{MAX_IDENTITY_LEN, ServiceConfig},
    fanout::{Fanout, FanoutBus, MemoryBus},
    registry::ConnectionRegistry,
    scheduler::ResetScheduler,
};

/// Errors from service operations.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Identity failed validation.
    #[error("invalid user id: {0}")]
    InvalidUserId(String),

    /// A request field failed validation.
    #[error("invalid {field}: {reason}")]
    InvalidInput {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },

    /// No such user.
    #[error("user not found: {0}")]
    UserNotFound(UserId),

    /// No such room.
    #[error("room not found: {0}")]
    RoomNotFound(RoomId),

    /// Fewer than two unpaired users.
    #[error("not enough unpaired users to create a room ({available} available)")]
    NotEnoughUsers {
        /// Unpaired users found
        available: usize,
    },

    /// Identity verification failed.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Store failure with no safe fallback.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Pairing failure.
    #[error(transparent)]
    Pairing(#[from] PairingError),

    /// Relay failure.
    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// External collaborators wired into a [`Service`].
pub struct Collaborators {
    /// Document store
    pub store: Arc<dyn Store>,
    /// Cross-process fan-out bus
    pub bus: Arc<dyn FanoutBus>,
    /// Text transform applied to every message
    pub transform: Arc<dyn TextTransform>,
    /// Identity verifier; `None` trusts claimed identities
    pub verifier: Option<Arc<dyn IdentityVerifier>>,
}

impl Collaborators {
    /// In-memory store and bus, passthrough transform, no verifier.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            bus: Arc::new(MemoryBus::default()),
            transform: Arc::new(Passthrough),
            verifier: None,
        }
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("verifier", &self.verifier.is_some())
            .finish_non_exhaustive()
    }
}

/// Live notification published after a message is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewMessageNotification<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    room_id: &'a RoomId,
    message_id: &'a str,
    sender_id: &'a UserId,
}

impl<'a> NewMessageNotification<'a> {
    /// Notification for `turn`.
    pub fn for_turn(turn: &'a Turn) -> Self {
        Self {
            kind: "new_message",
            room_id: &turn.room_id,
            message_id: turn.id.as_str(),
            sender_id: &turn.original_sender_id,
        }
    }
}

/// Result of a create-or-fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserUpsert {
    /// The user as re-read after any pairing
    pub user: User,
    /// Whether this request created the user
    pub created: bool,
}

struct Subscriber {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Everything one process needs to serve requests.
pub struct Service<E>
where
    E: Environment,
{
    config: ServiceConfig,
    env: E,
    store: Arc<dyn Store>,
    engine: Arc<PairingEngine<E>>,
    relay: MessageRelay<E>,
    fanout: Arc<Fanout>,
    scheduler: ResetScheduler<E>,
    verifier: Option<Arc<dyn IdentityVerifier>>,
    subscriber: Mutex<Option<Subscriber>>,
}

impl<E> Service<E>
where
    E: Environment,
{
    /// Wire a service from its collaborators. Nothing runs until
    /// [`Service::start`].
    pub fn new(env: E, collaborators: Collaborators, config: ServiceConfig) -> Self {
        let Collaborators { store, bus, transform, verifier } = collaborators;

        let engine = Arc::new(PairingEngine::with_candidate_limit(
            Arc::clone(&store),
            env.clone(),
            config.candidate_limit,
        ));
        let relay = MessageRelay::new(Arc::clone(&store), transform, env.clone())
            .with_transform_timeout(config.transform_timeout);
        let process_id = env.random_uuid().to_string();
        let fanout = Arc::new(Fanout::new(bus, Arc::new(ConnectionRegistry::new()), process_id));
        let scheduler = ResetScheduler::new(Arc::clone(&engine), env.clone(), config.scheduler);

        Self {
            config,
            env,
            store,
            engine,
            relay,
            fanout,
            scheduler,
            verifier,
            subscriber: Mutex::new(None),
        }
    }

    /// Start the fan-out subscriber and, if enabled, the reset scheduler.
    ///
    /// Calling it again while running does nothing.
    pub async fn start(&self) {
        if self.lock_subscriber().is_none() {
            let cancel = CancellationToken::new();
            let handle = self.fanout.start(cancel.clone()).await;
            let previous = self.lock_subscriber().replace(Subscriber { cancel, handle });
            if let Some(previous) = previous {
                previous.cancel.cancel();
            }
        }

        if self.config.scheduler_enabled {
            self.scheduler.start();
        } else {
            tracing::info!("reset scheduler disabled on this process");
        }
    }

    /// Stop the scheduler and the fan-out subscriber, waiting for both.
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;

        let subscriber = self.lock_subscriber().take();
        if let Some(subscriber) = subscriber {
            subscriber.cancel.cancel();
            if let Err(e) = subscriber.handle.await {
                tracing::error!("fan-out subscriber task failed: {e}");
            }
        }
        tracing::info!("service stopped");
    }

    /// Validate a claimed identity.
    pub fn parse_identity(&self, raw: &str) -> Result<UserId, ServiceError> {
        let id = raw.trim();
        if id.chars().count() < self.config.min_identity_len {
            return Err(ServiceError::InvalidUserId(format!(
                "must be at least {} characters",
                self.config.min_identity_len
            )));
        }
        if id.len() > MAX_IDENTITY_LEN {
            return Err(ServiceError::InvalidUserId(format!(
                "must be at most {MAX_IDENTITY_LEN} bytes"
            )));
        }
        if id.chars().any(char::is_control) {
            return Err(ServiceError::InvalidUserId("contains control characters".to_string()));
        }
        Ok(UserId::from(id))
    }

    /// Check the request may act as `claimed`.
    pub async fn authorize(
        &self,
        headers: &HeaderMap,
        claimed: &UserId,
    ) -> Result<(), ServiceError> {
        auth::authorize(self.verifier.as_deref(), headers, claimed).await?;
        Ok(())
    }

    /// Create the user if new, attempt pairing if unpaired, and return the
    /// freshly re-read record.
    pub async fn create_or_fetch_user(&self, id: UserId) -> Result<UserUpsert, ServiceError> {
        let created = self.store.insert_user(&User::new(id.clone(), self.env.now())).await?;
        if created {
            tracing::info!(user_id = %id, "user created");
        }

        let user =
            self.store.get_user(&id).await?.ok_or_else(|| ServiceError::UserNotFound(id.clone()))?;
        let user = self.pair_if_unpaired(user).await?;
        Ok(UserUpsert { user, created })
    }

    /// Fetch a user, attempting pairing first if unpaired.
    pub async fn fetch_user(&self, id: &UserId) -> Result<User, ServiceError> {
        let user =
            self.store.get_user(id).await?.ok_or_else(|| ServiceError::UserNotFound(id.clone()))?;
        self.pair_if_unpaired(user).await
    }

    /// Force one pairing from the unpaired pool.
    pub async fn pair_now(&self) -> Result<Room, ServiceError> {
        match self.engine.try_pair_one().await? {
            PairOutcome::Paired(room) | PairOutcome::PartiallyAssigned { room, .. } => Ok(room),
            PairOutcome::NotEnoughUsers { available } => {
                Err(ServiceError::NotEnoughUsers { available })
            },
        }
    }

    /// One room by id.
    pub async fn get_room(&self, id: &RoomId) -> Result<Room, ServiceError> {
        self.store.get_room(id).await?.ok_or_else(|| ServiceError::RoomNotFound(id.clone()))
    }

    /// Every room.
    pub async fn list_rooms(&self) -> Result<Vec<Room>, ServiceError> {
        Ok(self.store.list_rooms().await?)
    }

    /// Run a full reshuffle now.
    pub async fn refresh(&self) -> Result<ReshuffleReport, ServiceError> {
        Ok(self.engine.full_reshuffle().await?)
    }

    /// Persist a message and notify the room's live connections.
    pub async fn send_message(
        &self,
        room_id: &RoomId,
        sender_id: &UserId,
        text: &str,
    ) -> Result<Turn, ServiceError> {
        if text.trim().is_empty() {
            return Err(ServiceError::InvalidInput {
                field: "original_text",
                reason: "must not be blank".to_string(),
            });
        }
        self.get_room(room_id).await?;

        let turn = self.relay.send_message(room_id, sender_id, text).await?;

        match serde_json::to_string(&NewMessageNotification::for_turn(&turn)) {
            Ok(payload) => {
                self.fanout.broadcast(room_id, payload, None).await;
            },
            Err(e) => tracing::warn!(room_id = %room_id, "could not encode notification: {e}"),
        }
        Ok(turn)
    }

    /// A room's turns, oldest first.
    pub async fn get_messages(&self, room_id: &RoomId) -> Result<Vec<Turn>, ServiceError> {
        self.get_room(room_id).await?;
        Ok(self.relay.get_messages(room_id).await?)
    }

    /// The fan-out used by live connections.
    pub fn fanout(&self) -> &Arc<Fanout> {
        &self.fanout
    }

    /// The reset scheduler.
    pub fn scheduler(&self) -> &ResetScheduler<E> {
        &self.scheduler
    }

    /// Best-effort pairing. Pairing failures are logged and the user is
    /// returned as stored.
    async fn pair_if_unpaired(&self, user: User) -> Result<User, ServiceError> {
        if user.is_paired() {
            return Ok(user);
        }

        match self.engine.try_pair_one().await {
            Ok(PairOutcome::NotEnoughUsers { .. }) => return Ok(user),
            Ok(_) => {},
            Err(e) => {
                tracing::warn!(user_id = %user.id, "on-demand pairing failed: {e}");
                return Ok(user);
            },
        }

        // Pairing may have picked other candidates; re-read either way.
        self.store.get_user(&user.id).await?.ok_or(ServiceError::UserNotFound(user.id))
    }

    fn lock_subscriber(&self) -> MutexGuard<'_, Option<Subscriber>> {
        self.subscriber.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<E> fmt::Debug for Service<E>
where
    E: Environment,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("process_id", &self.fanout.process_id())
            .field("config", &self.config)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{scheduler::SchedulerState, system_env::SystemEnv};

    fn service() -> Service<SystemEnv> {
        let config = ServiceConfig { scheduler_enabled: false, ..ServiceConfig::default() };
        Service::new(SystemEnv::new(), Collaborators::in_memory(), config)
    }

    #[test]
    fn identity_validation() {
        let service = service();
        assert!(matches!(service.parse_identity("abc"), Err(ServiceError::InvalidUserId(_))));
        assert!(matches!(service.parse_identity("ab\u{7}cd"), Err(ServiceError::InvalidUserId(_))));
        assert!(matches!(
            service.parse_identity(&"x".repeat(MAX_IDENTITY_LEN + 1)),
            Err(ServiceError::InvalidUserId(_))
        ));
        assert_eq!(service.parse_identity("  abcd ").unwrap(), UserId::from("abcd"));
    }

    #[tokio::test]
    async fn second_user_triggers_pairing() {
        let service = service();

        let first = service.create_or_fetch_user(UserId::from("user1")).await.unwrap();
        assert!(first.created);
        assert_eq!(first.user.room_id, None);

        let second = service.create_or_fetch_user(UserId::from("user2")).await.unwrap();
        let room_id = second.user.room_id.clone().unwrap();

        let first = service.fetch_user(&UserId::from("user1")).await.unwrap();
        assert_eq!(first.room_id, Some(room_id));
    }

    #[tokio::test]
    async fn start_and_shutdown_drive_the_scheduler() {
        let config = ServiceConfig { scheduler_enabled: true, ..ServiceConfig::default() };
        let service = Service::new(SystemEnv::new(), Collaborators::in_memory(), config);

        service.start().await;
        assert_eq!(service.scheduler().state(), SchedulerState::Running);

        service.shutdown().await;
        assert_eq!(service.scheduler().state(), SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn disabled_scheduler_stays_stopped() {
        let service = service();
        service.start().await;
        assert_eq!(service.scheduler().state(), SchedulerState::Stopped);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn existing_user_is_not_recreated() {
        let service = service();
        service.create_or_fetch_user(UserId::from("user1")).await.unwrap();
        let again = service.create_or_fetch_user(UserId::from("user1")).await.unwrap();
        assert!(!again.created);
    }

    #[tokio::test]
    async fn send_to_unknown_room_is_not_found() {
        let service = service();
        let err = service
            .send_message(&RoomId::from("room_missing"), &UserId::from("user1"), "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::RoomNotFound(_)));
    }

    #[tokio::test]
    async fn blank_message_is_rejected() {
        let service = service();
        let err = service
            .send_message(&RoomId::from("room_1"), &UserId::from("user1"), "   ")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput { field: "original_text", .. }));
    }

    #[test]
    fn notification_shape() {
        let turn = Turn {
            id: pairchat_core::TurnId::from("t1"),
            room_id: RoomId::from("room_1"),
            original_sender_id: UserId::from("user1"),
            original_text: "hi".to_string(),
            processed_text: "hi".to_string(),
            created_at: None,
            processed_at: None,
        };
        let json = serde_json::to_value(NewMessageNotification::for_turn(&turn)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "new_message",
                "room_id": "room_1",
                "message_id": "t1",
                "sender_id": "user1",
            })
        );
    }
}
