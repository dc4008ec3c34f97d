//! Pairchat server binary.
//!
//! # Usage
//!
//! ```bash
//! # Single process, in-memory fan-out, passthrough transform
//! pairchat-server --bind 0.0.0.0:8000
//!
//! # Two processes sharing Redis; only the first runs the scheduler
//! pairchat-server --bind 0.0.0.0:8000 --redis-url redis://localhost:6379
//! pairchat-server --bind 0.0.0.0:8001 --redis-url redis://localhost:6379 --scheduler false
//! ```

use std::time::Duration;

use chrono::FixedOffset;
use clap::Parser;
use pairchat_core::ResetCadence;
use pairchat_server::{SchedulerConfig, Server, ServerError, ServerRuntimeConfig, ServiceConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Pairchat server
#[derive(Parser, Debug)]
#[command(name = "pairchat-server")]
#[command(about = "Anonymous two-person chat rooms with scheduled reshuffles")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, env = "PAIRCHAT_BIND", default_value = "0.0.0.0:8000")]
    bind: String,

    /// Redis URL for cross-process fan-out (in-process when unset)
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Reset cadence (quarter-hour, midnight)
    #[arg(long, env = "PAIRCHAT_CADENCE", default_value = "quarter-hour")]
    cadence: ResetCadence,

    /// UTC offset in minutes for reset boundaries
    #[arg(
        long,
        env = "PAIRCHAT_UTC_OFFSET_MINUTES",
        default_value = "540",
        allow_hyphen_values = true
    )]
    utc_offset_minutes: i32,

    /// Run the reset scheduler on this process
    #[arg(long, env = "PAIRCHAT_SCHEDULER", default_value = "true", action = clap::ArgAction::Set)]
    scheduler: bool,

    /// Seconds to wait after a failed reshuffle
    #[arg(long, env = "PAIRCHAT_FAILURE_BACKOFF_SECS", default_value = "60")]
    failure_backoff_secs: u64,

    /// Unpaired users considered per on-demand pairing
    #[arg(long, env = "PAIRCHAT_CANDIDATE_LIMIT", default_value = "10")]
    candidate_limit: usize,

    /// Minimum identity length
    #[arg(long, env = "PAIRCHAT_MIN_IDENTITY_LEN", default_value = "4")]
    min_identity_len: usize,

    /// Text transform endpoint (passthrough when unset)
    #[arg(long, env = "PAIRCHAT_TRANSFORM_URL")]
    transform_url: Option<String>,

    /// Bearer key for the transform endpoint
    #[arg(long, env = "PAIRCHAT_TRANSFORM_API_KEY", hide_env_values = true)]
    transform_api_key: Option<String>,

    /// Seconds before a transform call falls back to the original text
    #[arg(long, env = "PAIRCHAT_TRANSFORM_TIMEOUT_SECS", default_value = "30")]
    transform_timeout_secs: u64,

    /// Identity verifier endpoint (identities are trusted when unset)
    #[arg(long, env = "PAIRCHAT_AUTH_URL")]
    auth_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Result<ServerRuntimeConfig, ServerError> {
        let utc_offset = self
            .utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                ServerError::Config(format!(
                    "utc offset out of range: {} minutes",
                    self.utc_offset_minutes
                ))
            })?;

        Ok(ServerRuntimeConfig {
            bind_address: self.bind,
            redis_url: self.redis_url,
            transform_url: self.transform_url,
            transform_api_key: self.transform_api_key,
            auth_url: self.auth_url,
            service: ServiceConfig {
                scheduler_enabled: self.scheduler,
                scheduler: SchedulerConfig {
                    cadence: self.cadence,
                    utc_offset,
                    failure_backoff: Duration::from_secs(self.failure_backoff_secs),
                },
                candidate_limit: self.candidate_limit,
                min_identity_len: self.min_identity_len,
                transform_timeout: Duration::from_secs(self.transform_timeout_secs),
            },
        })
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("Pairchat server starting");
    tracing::info!("Binding to {}", args.bind);

    let config = args.into_config()?;
    if config.service.scheduler_enabled {
        tracing::info!(
            cadence = %config.service.scheduler.cadence,
            utc_offset = %config.service.scheduler.utc_offset,
            "Reset scheduler enabled"
        );
    }

    let server = Server::bind(config).await?;
    server.run(shutdown_signal()).await?;

    tracing::info!("Pairchat server stopped");
    Ok(())
}
