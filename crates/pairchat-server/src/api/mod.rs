//! HTTP and WebSocket surface.
//!
//! | Method | Path                 | Handler              |
//! |--------|----------------------|----------------------|
//! | GET    | `/health`            | [`health::health`]   |
//! | POST   | `/api/users`         | [`users::create`]    |
//! | GET    | `/api/users?id=`     | [`users::fetch`]     |
//! | POST   | `/api/rooms`         | [`rooms::create`]    |
//! | GET    | `/api/rooms`         | [`rooms::list`]      |
//! | POST   | `/api/rooms/refresh` | [`rooms::refresh`]   |
//! | GET    | `/api/rooms/{id}`    | [`rooms::get`]       |
//! | POST   | `/api/rooms/{id}`    | [`messages::send`]   |
//! | GET    | `/api/room/{id}`     | [`messages::list`]   |
//! | POST   | `/api/room/{id}`     | [`messages::send`]   |
//! | WS     | `/ws/{room_id}`      | [`ws::upgrade`]      |

pub mod error;
pub mod health;
pub mod messages;
pub mod rooms;
pub mod users;
pub mod ws;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use pairchat_core::Environment;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use self::error::{ApiError, ApiResult, ErrorResponse};
use crate::service::Service;

/// Build the router over a shared service.
pub fn router<E: Environment>(service: Arc<Service<E>>) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/api/users", post(users::create::<E>).get(users::fetch::<E>))
        .route("/api/rooms", post(rooms::create::<E>).get(rooms::list::<E>))
        .route("/api/rooms/refresh", post(rooms::refresh::<E>))
        .route("/api/rooms/{id}", get(rooms::get::<E>).post(messages::send::<E>))
        .route("/api/room/{id}", get(messages::list::<E>).post(messages::send::<E>))
        .route("/ws/{room_id}", get(ws::upgrade::<E>))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(service)
}
