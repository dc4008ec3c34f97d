//! User endpoints.

use std::sync::Arc;

use axum::{
    Json,
    extract::{
        Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderMap, StatusCode},
};
use pairchat_core::{Environment, User};
use serde::Deserialize;

use super::error::{ApiError, ApiResult};
use crate::service::Service;

/// `POST /api/users` body.
#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    /// Identity key
    #[serde(alias = "fingerprint_id", alias = "firebase_uid")]
    pub id: String,
}

/// `GET /api/users` query.
#[derive(Debug, Deserialize)]
pub struct UserQuery {
    /// Identity key
    #[serde(alias = "fingerprint_id", alias = "firebase_uid")]
    pub id: Option<String>,
}

/// Create a user, or fetch it if it exists. Either way an unpaired user gets
/// a best-effort pairing attempt.
pub async fn create<E: Environment>(
    State(service): State<Arc<Service<E>>>,
    headers: HeaderMap,
    payload: Result<Json<CreateUserRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<User>)> {
    let Json(req) = payload?;
    let id = service.parse_identity(&req.id)?;
    service.authorize(&headers, &id).await?;

    let upsert = service.create_or_fetch_user(id).await?;
    let status = if upsert.created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(upsert.user)))
}

/// Fetch a user, pairing it first if it is unpaired.
pub async fn fetch<E: Environment>(
    State(service): State<Arc<Service<E>>>,
    headers: HeaderMap,
    query: Result<Query<UserQuery>, QueryRejection>,
) -> ApiResult<Json<User>> {
    let Query(query) = query?;
    let raw = query.id.ok_or_else(|| ApiError::invalid("id", "missing"))?;
    let id = service.parse_identity(&raw)?;
    service.authorize(&headers, &id).await?;

    Ok(Json(service.fetch_user(&id).await?))
}
