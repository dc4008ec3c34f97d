//! Room endpoints.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use pairchat_core::{Environment, Room, RoomId, UserId};
use serde::Serialize;

use super::error::ApiResult;
use crate::service::Service;

/// `POST /api/rooms/refresh` response.
#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    /// Summary line
    pub message: &'static str,
    /// Rooms created for the new epoch
    pub created_rooms: usize,
    /// Rooms removed from the previous epoch
    pub rooms_deleted: usize,
    /// Messages removed from the previous epoch
    pub turns_deleted: usize,
    /// The odd user out, if any
    pub unpaired: Option<UserId>,
}

/// Pair two unpaired users into a new room.
pub async fn create<E: Environment>(
    State(service): State<Arc<Service<E>>>,
) -> ApiResult<(StatusCode, Json<Room>)> {
    let room = service.pair_now().await?;
    Ok((StatusCode::CREATED, Json(room)))
}

/// Every room.
pub async fn list<E: Environment>(
    State(service): State<Arc<Service<E>>>,
) -> ApiResult<Json<Vec<Room>>> {
    Ok(Json(service.list_rooms().await?))
}

/// One room.
pub async fn get<E: Environment>(
    State(service): State<Arc<Service<E>>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Room>> {
    Ok(Json(service.get_room(&RoomId::from(id)).await?))
}

/// Run a full reshuffle immediately.
pub async fn refresh<E: Environment>(
    State(service): State<Arc<Service<E>>>,
) -> ApiResult<Json<RefreshResponse>> {
    let report = service.refresh().await?;
    Ok(Json(RefreshResponse {
        message: "All rooms have been reset and new rooms created",
        created_rooms: report.rooms.len(),
        rooms_deleted: report.rooms_deleted,
        turns_deleted: report.turns_deleted,
        unpaired: report.unpaired,
    }))
}
