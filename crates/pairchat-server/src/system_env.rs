//! Wall-clock [`Environment`] for the running server.

use std::{
    future::Future,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use chrono::{DateTime, Utc};
use pairchat_core::Environment;

/// Real time and OS entropy.
///
/// Reset boundaries are computed from `Utc::now()`, so the host clock must be
/// kept in sync (NTP) for resets to land on the quarter hour. `now()` follows
/// the host clock and can step backwards when it is corrected.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// The production environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        if let Err(e) = getrandom::fill(buffer) {
            tracing::error!(len = buffer.len(), "OS randomness unavailable: {e}");
            fallback_fill(buffer);
        }
    }
}

static FALLBACK_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Predictable but distinct bytes for hosts without OS entropy.
///
/// Each call mixes a process-wide counter with the current time, so ids
/// minted from successive calls never collide.
fn fallback_fill(buffer: &mut [u8]) {
    let count = FALLBACK_COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;

    let mut state = count ^ nanos.rotate_left(32);
    for chunk in buffer.chunks_mut(8) {
        // splitmix64
        state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;
        chunk.copy_from_slice(&z.to_le_bytes()[..chunk.len()]);
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    #[test]
    fn now_tracks_the_host_clock() {
        let before = Utc::now();
        let now = SystemEnv::new().now();
        assert!(now >= before);
        assert!(now - before < TimeDelta::seconds(5));
    }

    #[test]
    fn room_ids_are_unique() {
        let env = SystemEnv::new();
        assert_ne!(env.random_uuid(), env.random_uuid());
    }

    #[test]
    fn fallback_bytes_differ_between_calls() {
        let mut first = [0u8; 16];
        let mut second = [0u8; 16];
        fallback_fill(&mut first);
        fallback_fill(&mut second);
        assert_ne!(first, second);
        assert_ne!(first, [0u8; 16]);

        // Odd lengths fill the tail too.
        let mut odd = [0u8; 13];
        fallback_fill(&mut odd);
        assert_ne!(odd[8..], [0u8; 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_uses_the_tokio_timer() {
        let start = tokio::time::Instant::now();
        SystemEnv::new().sleep(Duration::from_secs(900)).await;
        assert!(start.elapsed() >= Duration::from_secs(900));
    }
}
