//! Pairchat production server.
//!
//! This crate provides the production runtime using:
//! - axum for HTTP and WebSocket
//! - Tokio for the async runtime
//! - Redis pub/sub (or an in-process channel) for cross-process fan-out
//! - System time and OS randomness
//!
//! ## Architecture
//!
//! ```text
//! pairchat-server
//!   ├─ Server             (listener + graceful shutdown)
//!   ├─ api                (axum router, handlers, ApiError)
//!   ├─ Service            (per-process state shared by handlers)
//!   │   ├─ PairingEngine  (try_pair_one, full_reshuffle)
//!   │   ├─ MessageRelay   (transform + persist + replay)
//!   │   ├─ ResetScheduler (boundary loop)
//!   │   └─ Fanout         (bus publish/subscribe → ConnectionRegistry)
//!   └─ SystemEnv          (production Environment impl)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod api;
pub mod auth;
pub mod config;
mod error;
pub mod fanout;
pub mod registry;
pub mod scheduler;
pub mod service;
mod system_env;
pub mod transform;

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

pub use auth::{AuthError, HttpIdentityVerifier, IdentityVerifier};
pub use config::ServiceConfig;
pub use error::ServerError;
pub use fanout::{BusError, Delivery, Envelope, Fanout, FanoutBus, MemoryBus, Origin, RedisBus};
use pairchat_core::{MemoryStore, Passthrough, TextTransform};
pub use registry::{ConnId, ConnectionRegistry};
pub use scheduler::{ResetScheduler, SchedulerConfig, SchedulerState};
pub use service::{Collaborators, Service, ServiceError};
pub use system_env::SystemEnv;
use tokio::net::TcpListener;
pub use transform::HttpTransform;

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Address to bind to (e.g., "0.0.0.0:8000")
    pub bind_address: String,
    /// Redis URL for cross-process fan-out; in-process bus when `None`
    pub redis_url: Option<String>,
    /// Text transform endpoint; passthrough when `None`
    pub transform_url: Option<String>,
    /// Bearer key for the transform endpoint
    pub transform_api_key: Option<String>,
    /// Identity verifier endpoint; identities are trusted when `None`
    pub auth_url: Option<String>,
    /// Pairing, scheduling and relay configuration
    pub service: ServiceConfig,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8000".to_string(),
            redis_url: None,
            transform_url: None,
            transform_api_key: None,
            auth_url: None,
            service: ServiceConfig::default(),
        }
    }
}

/// Production pairchat server.
///
/// Wraps a [`Service`] with a TCP listener and the axum router.
pub struct Server {
    /// Shared per-process state
    service: Arc<Service<SystemEnv>>,
    /// Bound listener
    listener: TcpListener,
}

impl Server {
    /// Connect collaborators and bind the listener.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Binding to the address fails
    /// - Redis is configured but unreachable
    /// - An HTTP client for the transform or verifier cannot be built
    pub async fn bind(config: ServerRuntimeConfig) -> Result<Self, ServerError> {
        let collaborators = collaborators(&config).await?;
        let service = Arc::new(Service::new(SystemEnv::new(), collaborators, config.service));
        Self::with_service(&config.bind_address, service).await
    }

    /// Bind the listener for an already-wired service.
    pub async fn with_service(
        bind_address: &str,
        service: Arc<Service<SystemEnv>>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(bind_address).await?;
        Ok(Self { service, listener })
    }

    /// Serve until `shutdown` resolves.
    ///
    /// Starts the fan-out subscriber and the reset scheduler first, and stops
    /// both once the listener has drained.
    pub async fn run<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::info!("Server listening on {}", self.local_addr()?);

        self.service.start().await;

        let app = api::router(Arc::clone(&self.service));
        let served = axum::serve(self.listener, app).with_graceful_shutdown(shutdown).await;

        self.service.shutdown().await;
        served.map_err(ServerError::from)
    }

    /// Get the local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }
}

async fn collaborators(config: &ServerRuntimeConfig) -> Result<Collaborators, ServerError> {
    let bus: Arc<dyn FanoutBus> = match &config.redis_url {
        Some(url) => Arc::new(RedisBus::connect(url).await?),
        None => {
            tracing::info!("no redis url configured, using in-process fan-out");
            Arc::new(MemoryBus::default())
        },
    };

    let transform: Arc<dyn TextTransform> = match &config.transform_url {
        Some(url) => {
            // The relay enforces the configured bound; the client gets slack on top.
            let timeout = config.service.transform_timeout + Duration::from_secs(1);
            Arc::new(
                HttpTransform::new(url.clone(), config.transform_api_key.clone(), timeout)
                    .map_err(|e| ServerError::Config(e.to_string()))?,
            )
        },
        None => Arc::new(Passthrough),
    };

    let verifier: Option<Arc<dyn IdentityVerifier>> = match &config.auth_url {
        Some(url) => Some(Arc::new(
            HttpIdentityVerifier::new(url.clone()).map_err(|e| ServerError::Config(e.to_string()))?,
        )),
        None => {
            tracing::warn!("no identity verifier configured, trusting claimed identities");
            None
        },
    };

    Ok(Collaborators { store: Arc::new(MemoryStore::new()), bus, transform, verifier })
}
