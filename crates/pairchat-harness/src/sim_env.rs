//! Seeded environment with a virtual wall clock.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use pairchat_core::Environment;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Default simulation start: 2025-06-01T00:00:00Z.
const DEFAULT_START_SECS: i64 = 1_748_736_000;

struct SimState {
    now: DateTime<Utc>,
    rng: ChaCha8Rng,
    wakes: Vec<DateTime<Utc>>,
}

/// Simulation environment.
///
/// - `now()` returns virtual time, which only moves through `sleep` or
///   [`SimEnv::advance`]
/// - `sleep(d)` advances virtual time by `d`, records the wake-up instant and
///   yields once to the runtime
/// - randomness comes from a `ChaCha8Rng` seeded at construction
///
/// Clones share the clock and RNG.
#[derive(Clone)]
pub struct SimEnv {
    state: Arc<Mutex<SimState>>,
}

impl SimEnv {
    /// Start at the default instant with the given seed.
    pub fn with_seed(seed: u64) -> Self {
        let start = DateTime::from_timestamp(DEFAULT_START_SECS, 0).unwrap_or(DateTime::UNIX_EPOCH);
        Self::starting_at(seed, start)
    }

    /// Start at `start` with the given seed.
    pub fn starting_at(seed: u64, start: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                now: start,
                rng: ChaCha8Rng::seed_from_u64(seed),
                wakes: Vec::new(),
            })),
        }
    }

    /// Move virtual time forward without recording a wake-up.
    pub fn advance(&self, duration: Duration) {
        let mut state = self.lock();
        state.now = later(state.now, duration);
    }

    /// Every instant a `sleep` woke at, in order.
    pub fn wake_log(&self) -> Vec<DateTime<Utc>> {
        self.lock().wakes.clone()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::with_seed(0)
    }
}

impl std::fmt::Debug for SimEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("SimEnv")
            .field("now", &state.now)
            .field("wakes", &state.wakes.len())
            .finish()
    }
}

/// `now + duration`, saturating at the end of representable time.
fn later(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl Environment for SimEnv {
    fn now(&self) -> DateTime<Utc> {
        self.lock().now
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        let env = self.clone();
        async move {
            {
                let mut state = env.lock();
                state.now = later(state.now, duration);
                let now = state.now;
                state.wakes.push(now);
            }
            tokio::task::yield_now().await;
        }
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.lock().rng.fill_bytes(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sleep_advances_virtual_time() {
        let env = SimEnv::with_seed(1);
        let start = env.now();

        env.sleep(Duration::from_secs(900)).await;

        assert_eq!(env.now() - start, TimeDelta::seconds(900));
        assert_eq!(env.wake_log(), vec![start + TimeDelta::seconds(900)]);
    }

    #[test]
    fn same_seed_same_bytes() {
        let (a, b) = (SimEnv::with_seed(42), SimEnv::with_seed(42));
        assert_eq!(a.random_u64(), b.random_u64());
        assert_eq!(a.random_uuid(), b.random_uuid());
    }

    #[test]
    fn clones_share_the_clock() {
        let env = SimEnv::with_seed(1);
        let clone = env.clone();
        env.advance(Duration::from_secs(5));
        assert_eq!(env.now(), clone.now());
        assert!(env.wake_log().is_empty());
    }
}
