//! Service configuration.

use std::time::Duration;

use pairchat_core::pairing::DEFAULT_CANDIDATE_LIMIT;
use pairchat_core::relay::DEFAULT_TRANSFORM_TIMEOUT;

use crate::scheduler::SchedulerConfig;

/// Default minimum identity length.
pub const DEFAULT_MIN_IDENTITY_LEN: usize = 4;

/// Upper bound on identity length.
pub const MAX_IDENTITY_LEN: usize = 256;

/// Knobs for the per-process [`Service`](crate::Service).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Whether this process runs the reset scheduler
    pub scheduler_enabled: bool,
    /// Reset cadence, offset and failure backoff
    pub scheduler: SchedulerConfig,
    /// Unpaired users read per on-demand pairing attempt
    pub candidate_limit: usize,
    /// Identities shorter than this are rejected
    pub min_identity_len: usize,
    /// Bound on a single text-transform call
    pub transform_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            scheduler_enabled: true,
            scheduler: SchedulerConfig::default(),
            candidate_limit: DEFAULT_CANDIDATE_LIMIT,
            min_identity_len: DEFAULT_MIN_IDENTITY_LEN,
            transform_timeout: DEFAULT_TRANSFORM_TIMEOUT,
        }
    }
}
