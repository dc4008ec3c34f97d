//! Liveness probe.

use axum::Json;
use serde::Serialize;

/// `GET /health` response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the process serves requests
    pub status: &'static str,
    /// Crate version
    pub version: &'static str,
}

/// Report liveness.
#[allow(clippy::unused_async)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", version: env!("CARGO_PKG_VERSION") })
}
