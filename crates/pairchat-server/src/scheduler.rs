//! Reset Scheduler
//!
//! A single background task that sleeps until the next reset boundary, runs a
//! full reshuffle and loops. A failed reshuffle is logged and followed by a
//! fixed backoff; it never stops later runs.
//!
//! ## State machine
//!
//! ```text
//!   Stopped ──start()──▶ Running ──stop()──▶ Stopped
//!                          │  ▲
//!                 sleep to │  │ reshuffle ok, or
//!                 boundary ▼  │ failed + backoff
//!                        reshuffle
//! ```
//!
//! The stop signal is raced against both sleeps, so `stop()` returns promptly
//! instead of waiting out a quarter hour.

use std::{
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, FixedOffset, Offset, Utc};
use pairchat_core::{Environment, PairingEngine, ResetCadence, next_boundary};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default wait after a failed reshuffle.
pub const DEFAULT_FAILURE_BACKOFF: Duration = Duration::from_secs(60);

/// Default boundary offset: +09:00.
pub const DEFAULT_UTC_OFFSET_MINUTES: i32 = 9 * 60;

/// Scheduler configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Boundary cadence
    pub cadence: ResetCadence,
    /// Fixed offset in which boundaries are evaluated
    pub utc_offset: FixedOffset,
    /// Wait after a failed reshuffle before computing the next boundary
    pub failure_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cadence: ResetCadence::default(),
            utc_offset: FixedOffset::east_opt(DEFAULT_UTC_OFFSET_MINUTES * 60)
                .unwrap_or_else(|| Utc.fix()),
            failure_backoff: DEFAULT_FAILURE_BACKOFF,
        }
    }
}

/// Whether the scheduler task is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// No task running
    Stopped,
    /// Task sleeping or reshuffling
    Running,
}

#[derive(Debug, Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Drives [`PairingEngine::full_reshuffle`] at reset boundaries.
pub struct ResetScheduler<E>
where
    E: Environment,
{
    engine: Arc<PairingEngine<E>>,
    env: E,
    config: SchedulerConfig,
    counters: Arc<Counters>,
    task: Mutex<Option<Running>>,
}

impl<E> ResetScheduler<E>
where
    E: Environment,
{
    /// Create a stopped scheduler.
    pub fn new(engine: Arc<PairingEngine<E>>, env: E, config: SchedulerConfig) -> Self {
        Self { engine, env, config, counters: Arc::default(), task: Mutex::new(None) }
    }

    /// Spawn the scheduler task.
    ///
    /// Returns `false` without side effects if it is already running.
    /// Must be called within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut task = self.lock();
        if task.as_ref().is_some_and(|running| !running.handle.is_finished()) {
            return false;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            Arc::clone(&self.engine),
            self.env.clone(),
            self.config,
            Arc::clone(&self.counters),
            cancel.clone(),
        ));
        *task = Some(Running { cancel, handle });

        tracing::info!(
            cadence = %self.config.cadence,
            utc_offset = %self.config.utc_offset,
            "reset scheduler started"
        );
        true
    }

    /// Signal the task to stop and wait for it to exit.
    ///
    /// A no-op when stopped.
    pub async fn stop(&self) {
        let running = self.lock().take();
        let Some(running) = running else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            tracing::error!("reset scheduler task failed: {e}");
        }
        tracing::info!("reset scheduler stopped");
    }

    /// Current state.
    pub fn state(&self) -> SchedulerState {
        match self.lock().as_ref() {
            Some(running) if !running.handle.is_finished() => SchedulerState::Running,
            _ => SchedulerState::Stopped,
        }
    }

    /// Reshuffles that completed successfully.
    pub fn completed_runs(&self) -> u64 {
        self.counters.completed.load(Ordering::Relaxed)
    }

    /// Reshuffles that returned an error.
    pub fn failed_runs(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Running>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<E> fmt::Debug for ResetScheduler<E>
where
    E: Environment,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResetScheduler")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("completed_runs", &self.completed_runs())
            .field("failed_runs", &self.failed_runs())
            .finish()
    }
}

async fn run_loop<E>(
    engine: Arc<PairingEngine<E>>,
    env: E,
    config: SchedulerConfig,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) where
    E: Environment,
{
    let mut previous: Option<DateTime<Utc>> = None;

    loop {
        let now = env.now();
        // An early wake-up must not fire the same boundary twice.
        let from = previous.map_or(now, |p| p.max(now));
        let boundary = next_boundary(from, config.cadence, config.utc_offset);
        let delay = (boundary - now).to_std().unwrap_or(Duration::ZERO);

        tracing::debug!(%boundary, ?delay, "next reshuffle scheduled");
        tokio::select! {
            () = cancel.cancelled() => return,
            () = env.sleep(delay) => {}
        }
        previous = Some(boundary);

        match engine.full_reshuffle().await {
            Ok(report) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    %boundary,
                    rooms = report.rooms.len(),
                    rooms_deleted = report.rooms_deleted,
                    "scheduled reshuffle complete"
                );
            },
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    %boundary,
                    backoff = ?config.failure_backoff,
                    "scheduled reshuffle failed: {e}"
                );
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = env.sleep(config.failure_backoff) => {}
                }
            },
        }
    }
}
