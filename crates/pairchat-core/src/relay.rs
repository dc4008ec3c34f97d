//! Message Relay
//!
//! Accepts a message for a room, runs it through the external text transform,
//! persists it as a [`Turn`] and replays a room's turns in creation order.
//!
//! The transform never blocks delivery: an error, a timeout or a blank
//! result all fall back to the original text.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    env::Environment,
    model::{RoomId, Turn, TurnId, UserId},
    store::{Store, StoreError},
};

/// Default bound on a single transform call.
pub const DEFAULT_TRANSFORM_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors reported by a [`TextTransform`].
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    /// The transform service could not be reached or answered with an error.
    #[error("transform service failed: {0}")]
    Service(String),

    /// The service answered with something that is not a transform result.
    #[error("malformed transform response: {0}")]
    Malformed(String),
}

/// External text-processing step.
#[async_trait]
pub trait TextTransform: Send + Sync + 'static {
    /// Transform `text`. Implementations may be slow; the relay bounds them
    /// with a timeout.
    async fn transform(&self, text: &str) -> Result<String, TransformError>;
}

/// Transform that returns its input unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

#[async_trait]
impl TextTransform for Passthrough {
    async fn transform(&self, text: &str) -> Result<String, TransformError> {
        Ok(text.to_string())
    }
}

/// Errors from relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Persisting or loading turns failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Sort turns ascending by creation time.
///
/// Turns with a missing timestamp sort first. The sort is stable, so turns
/// with equal timestamps keep their store order.
pub fn sort_turns(turns: &mut [Turn]) {
    turns.sort_by_key(|t| t.created_at);
}

/// Transforms, persists and replays room messages.
pub struct MessageRelay<E>
where
    E: Environment,
{
    store: Arc<dyn Store>,
    transform: Arc<dyn TextTransform>,
    env: E,
    transform_timeout: Duration,
}

impl<E> MessageRelay<E>
where
    E: Environment,
{
    /// Create a relay with the default transform timeout.
    pub fn new(store: Arc<dyn Store>, transform: Arc<dyn TextTransform>, env: E) -> Self {
        Self { store, transform, env, transform_timeout: DEFAULT_TRANSFORM_TIMEOUT }
    }

    /// Override the transform timeout.
    #[must_use]
    pub fn with_transform_timeout(mut self, timeout: Duration) -> Self {
        self.transform_timeout = timeout;
        self
    }

    /// Transform, persist and return a new turn.
    ///
    /// `created_at` is taken when the message arrives and `processed_at` once
    /// the transform step finishes, so the gap reflects real transform
    /// latency.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Store` if the turn cannot be persisted. Transform
    /// failures never surface here.
    pub async fn send_message(
        &self,
        room_id: &RoomId,
        sender_id: &UserId,
        text: &str,
    ) -> Result<Turn, RelayError> {
        let created_at = self.env.now();
        let processed_text = self.transform_or_original(room_id, text).await;
        let processed_at = self.env.now();

        let turn = Turn {
            id: TurnId::new(self.env.random_uuid().to_string()),
            room_id: room_id.clone(),
            original_sender_id: sender_id.clone(),
            original_text: text.to_string(),
            processed_text,
            created_at: Some(created_at),
            processed_at: Some(processed_at),
        };

        self.store.put_turn(&turn).await?;
        tracing::debug!(room_id = %room_id, turn_id = %turn.id, "turn persisted");

        Ok(turn)
    }

    /// All turns of a room, ascending by creation time.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Store` if the turns cannot be loaded.
    pub async fn get_messages(&self, room_id: &RoomId) -> Result<Vec<Turn>, RelayError> {
        let mut turns = self.store.query_turns(room_id).await?;
        let undated = turns.iter().filter(|t| t.created_at.is_none()).count();
        if undated > 0 {
            tracing::warn!(room_id = %room_id, undated, "turns without creation time sort first");
        }
        sort_turns(&mut turns);
        Ok(turns)
    }

    async fn transform_or_original(&self, room_id: &RoomId, text: &str) -> String {
        match tokio::time::timeout(self.transform_timeout, self.transform.transform(text)).await {
            Ok(Ok(out)) if !out.trim().is_empty() => out,
            Ok(Ok(_)) => {
                tracing::warn!(room_id = %room_id, "transform returned blank text, using original");
                text.to_string()
            },
            Ok(Err(e)) => {
                tracing::warn!(room_id = %room_id, "transform failed, using original: {e}");
                text.to_string()
            },
            Err(_) => {
                tracing::warn!(
                    room_id = %room_id,
                    timeout = ?self.transform_timeout,
                    "transform timed out, using original"
                );
                text.to_string()
            },
        }
    }
}

impl<E> std::fmt::Debug for MessageRelay<E>
where
    E: Environment,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRelay").field("transform_timeout", &self.transform_timeout).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicI64, Ordering},
    };

    use chrono::{DateTime, TimeDelta, Utc};
    use rand::{RngCore, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    use super::*;
    use crate::store::{ChaoticStore, MemoryStore, StoreOp};

    /// Clock that ticks one second per `now()` call.
    #[derive(Clone)]
    struct TickingEnv {
        ticks: Arc<AtomicI64>,
        rng: Arc<Mutex<ChaCha8Rng>>,
    }

    impl TickingEnv {
        fn new() -> Self {
            Self {
                ticks: Arc::new(AtomicI64::new(0)),
                rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(5))),
            }
        }
    }

    impl Environment for TickingEnv {
        fn now(&self) -> DateTime<Utc> {
            let tick = self.ticks.fetch_add(1, Ordering::SeqCst);
            DateTime::<Utc>::UNIX_EPOCH + TimeDelta::seconds(tick)
        }

        fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            tokio::time::sleep(duration)
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            self.rng.lock().unwrap().fill_bytes(buffer);
        }
    }

    struct Upper;

    #[async_trait]
    impl TextTransform for Upper {
        async fn transform(&self, text: &str) -> Result<String, TransformError> {
            Ok(text.to_uppercase())
        }
    }

    struct Failing;

    #[async_trait]
    impl TextTransform for Failing {
        async fn transform(&self, _text: &str) -> Result<String, TransformError> {
            Err(TransformError::Service("boom".into()))
        }
    }

    struct Blank;

    #[async_trait]
    impl TextTransform for Blank {
        async fn transform(&self, _text: &str) -> Result<String, TransformError> {
            Ok("  \n".into())
        }
    }

    struct Stalled;

    #[async_trait]
    impl TextTransform for Stalled {
        async fn transform(&self, text: &str) -> Result<String, TransformError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(text.to_string())
        }
    }

    fn relay(transform: Arc<dyn TextTransform>) -> (Arc<MemoryStore>, MessageRelay<TickingEnv>) {
        let store = Arc::new(MemoryStore::new());
        let relay = MessageRelay::new(store.clone(), transform, TickingEnv::new());
        (store, relay)
    }

    #[tokio::test]
    async fn send_message_stores_both_texts_and_timestamps() {
        let (store, relay) = relay(Arc::new(Upper));
        let room = RoomId::from("room_a");

        let turn = relay.send_message(&room, &"u1".into(), "hello").await.unwrap();

        assert_eq!(turn.original_text, "hello");
        assert_eq!(turn.processed_text, "HELLO");
        assert!(turn.processed_at > turn.created_at);
        assert_eq!(store.query_turns(&room).await.unwrap(), vec![turn]);
    }

    #[tokio::test]
    async fn transform_error_falls_back_to_original() {
        let (_, relay) = relay(Arc::new(Failing));
        let turn = relay.send_message(&"room_a".into(), &"u1".into(), "hello").await.unwrap();
        assert_eq!(turn.processed_text, "hello");
    }

    #[tokio::test]
    async fn blank_transform_falls_back_to_original() {
        let (_, relay) = relay(Arc::new(Blank));
        let turn = relay.send_message(&"room_a".into(), &"u1".into(), "hello").await.unwrap();
        assert_eq!(turn.processed_text, "hello");
    }

    #[tokio::test(start_paused = true)]
    async fn transform_timeout_falls_back_to_original() {
        let (_, relay) = relay(Arc::new(Stalled));
        let relay = relay.with_transform_timeout(Duration::from_secs(2));
        let turn = relay.send_message(&"room_a".into(), &"u1".into(), "hello").await.unwrap();
        assert_eq!(turn.processed_text, "hello");
    }

    #[tokio::test]
    async fn store_failure_surfaces() {
        let store = Arc::new(ChaoticStore::reliable(MemoryStore::new()));
        store.inject(StoreOp::PutTurn, 1);
        let relay = MessageRelay::new(store, Arc::new(Passthrough), TickingEnv::new());

        let result = relay.send_message(&"room_a".into(), &"u1".into(), "hello").await;
        assert!(matches!(result, Err(RelayError::Store(StoreError::Unavailable(_)))));
    }

    #[tokio::test]
    async fn get_messages_orders_by_creation_with_undated_first() {
        let (store, relay) = relay(Arc::new(Passthrough));
        let room = RoomId::from("room_a");

        let first = relay.send_message(&room, &"u1".into(), "one").await.unwrap();
        let second = relay.send_message(&room, &"u2".into(), "two").await.unwrap();

        let mut undated = first.clone();
        undated.id = TurnId::from("legacy");
        undated.created_at = None;

        // Store order: second, undated, first
        store.delete_turns(crate::store::TurnFilter::All).await.unwrap();
        for turn in [&second, &undated, &first] {
            store.put_turn(turn).await.unwrap();
        }

        let ids: Vec<_> =
            relay.get_messages(&room).await.unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![undated.id, first.id, second.id]);
    }
}
