//! Clock, randomness and sleeping behind one trait.
//!
//! Pairing, relay and the reset scheduler take an `E: Environment` instead of
//! calling `Utc::now()` or an OS RNG directly. The server plugs in the real
//! clock; the harness plugs in a seeded RNG and a virtual clock whose `sleep`
//! returns immediately, so a day of quarter-hour resets replays in
//! milliseconds and a given seed always yields the same pairings.
//!
//! Implementations must keep `now()` non-decreasing and must not share state
//! with other instances except through explicit clones.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::{SeedableRng, rngs::StdRng};

/// Abstract environment providing wall-clock time, randomness and sleeping.
///
/// Unlike a monotonic `Instant`, `now()` is wall-clock time: reset boundaries
/// are defined on the calendar ("every quarter hour", "local midnight") and
/// every persisted record carries a UTC timestamp.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Current wall-clock time.
    ///
    /// Follows the host clock, which may step backwards. Simulated
    /// environments keep it non-decreasing.
    fn now(&self) -> DateTime<Utc>;

    /// Sleeps for the specified duration.
    ///
    /// Only the reset scheduler sleeps. Pairing and relay logic never do.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fill `buffer` with random bytes: OS entropy in production, a fixed
    /// sequence per seed in simulation.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// A random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generates a random version-4 UUID from this environment's entropy.
    fn random_uuid(&self) -> uuid::Uuid {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        uuid::Builder::from_random_bytes(bytes).into_uuid()
    }

    /// Returns a fresh RNG seeded from this environment.
    ///
    /// Used for shuffles and candidate selection, so a seeded simulation
    /// produces identical pairings on every run.
    fn rng(&self) -> StdRng {
        let mut seed = [0u8; 32];
        self.random_bytes(&mut seed);
        StdRng::from_seed(seed)
    }
}
