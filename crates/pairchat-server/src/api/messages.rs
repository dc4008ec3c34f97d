//! Message endpoints.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::HeaderMap,
};
use pairchat_core::{Environment, RoomId, Turn, UserId};
use serde::Deserialize;

use super::error::ApiResult;
use crate::service::Service;

/// `POST /api/room/{id}` body.
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    /// Message text
    pub original_text: String,
    /// Sender identity
    #[serde(default)]
    pub sender_id: String,
}

/// Transform, persist and announce a message.
pub async fn send<E: Environment>(
    State(service): State<Arc<Service<E>>>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> ApiResult<Json<Turn>> {
    let Json(req) = payload?;
    let sender = UserId::from(req.sender_id.trim());
    service.authorize(&headers, &sender).await?;

    let turn = service.send_message(&RoomId::from(room_id), &sender, &req.original_text).await?;
    Ok(Json(turn))
}

/// A room's messages, oldest first.
pub async fn list<E: Environment>(
    State(service): State<Arc<Service<E>>>,
    Path(room_id): Path<String>,
) -> ApiResult<Json<Vec<Turn>>> {
    Ok(Json(service.get_messages(&RoomId::from(room_id)).await?))
}
