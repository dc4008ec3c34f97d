//! On-demand pairing racing full reshuffles on one engine.
//!
//! The store yields to the scheduler around every write, so without the
//! engine's lease a pairing could interleave with a reshuffle's delete and
//! reassign phases and leave users pointing at deleted rooms.

use std::sync::Arc;

use async_trait::async_trait;
use pairchat_core::{
    Environment, MemoryStore, PairOutcome, PairingEngine, Room, RoomId, Store, StoreError, Turn,
    TurnFilter, User, UserFilter, UserId,
};
use pairchat_harness::{SimEnv, check_partition, check_references, seed_users};

/// Memory store that yields before every write and user query.
struct YieldingStore(MemoryStore);

#[async_trait]
impl Store for YieldingStore {
    async fn get_user(&self, id: &UserId) -> Result<Option<User>, StoreError> {
        self.0.get_user(id).await
    }

    async fn insert_user(&self, user: &User) -> Result<bool, StoreError> {
        tokio::task::yield_now().await;
        self.0.insert_user(user).await
    }

    async fn set_user_room(&self, id: &UserId, room_id: Option<&RoomId>) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.0.set_user_room(id, room_id).await
    }

    async fn query_users(
        &self,
        filter: UserFilter,
        limit: Option<usize>,
    ) -> Result<Vec<User>, StoreError> {
        tokio::task::yield_now().await;
        self.0.query_users(filter, limit).await
    }

    async fn get_room(&self, id: &RoomId) -> Result<Option<Room>, StoreError> {
        self.0.get_room(id).await
    }

    async fn put_room(&self, room: &Room) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.0.put_room(room).await
    }

    async fn list_rooms(&self) -> Result<Vec<Room>, StoreError> {
        self.0.list_rooms().await
    }

    async fn delete_room(&self, id: &RoomId) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.0.delete_room(id).await
    }

    async fn put_turn(&self, turn: &Turn) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.0.put_turn(turn).await
    }

    async fn query_turns(&self, room_id: &RoomId) -> Result<Vec<Turn>, StoreError> {
        self.0.query_turns(room_id).await
    }

    async fn delete_turns(&self, filter: TurnFilter) -> Result<usize, StoreError> {
        tokio::task::yield_now().await;
        self.0.delete_turns(filter).await
    }
}

/// Users with no room after the store has settled.
async fn unpaired(store: &dyn Store) -> Vec<UserId> {
    let users = store.query_users(UserFilter::All, None).await.unwrap();
    users.into_iter().filter(|u| u.room_id.is_none()).map(|u| u.id).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pairing_and_reshuffle_never_interleave() {
    const SEEDED: usize = 20;
    const JOINERS: usize = 21;

    let env = SimEnv::with_seed(11);
    let store = Arc::new(YieldingStore(MemoryStore::new()));
    seed_users(&*store, &env, SEEDED).await.unwrap();
    let engine = PairingEngine::new(store.clone(), env.clone());
    engine.full_reshuffle().await.unwrap();

    let joining = async {
        for i in 0..JOINERS {
            let id = UserId::new(format!("joiner-{i:03}"));
            store.insert_user(&User::new(id, env.now())).await.unwrap();
        }
    };
    let pairing = |rounds: usize| {
        let engine = &engine;
        async move {
            for _ in 0..rounds {
                let outcome = engine.try_pair_one().await.unwrap();
                assert!(
                    !matches!(outcome, PairOutcome::PartiallyAssigned { .. }),
                    "{outcome:?}"
                );
            }
        }
    };
    let reshuffling = async {
        for _ in 0..5 {
            engine.full_reshuffle().await.unwrap();
            tokio::task::yield_now().await;
        }
    };

    tokio::join!(joining, pairing(30), pairing(30), pairing(30), reshuffling);
    check_references(&*store).await.unwrap();

    // Drain whatever joined after the last pairing attempt.
    while matches!(engine.try_pair_one().await.unwrap(), PairOutcome::Paired(_)) {}
    check_references(&*store).await.unwrap();

    let population = SEEDED + JOINERS;
    let leftover = unpaired(&*store).await;
    assert_eq!(leftover.len(), 1, "{leftover:?}");
    let rooms = store.list_rooms().await.unwrap();
    check_partition(&rooms, leftover.first(), population).unwrap();

    let report = engine.full_reshuffle().await.unwrap();
    check_partition(&report.rooms, report.unpaired.as_ref(), population).unwrap();
    check_references(&*store).await.unwrap();
}
