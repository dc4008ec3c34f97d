//! Identity verification.
//!
//! Verification is delegated to an external service behind
//! [`IdentityVerifier`]. Without a verifier every claimed identity is
//! trusted.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use axum::http::{HeaderMap, header::AUTHORIZATION};
use pairchat_core::UserId;
use serde::Deserialize;

/// Errors from identity verification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// No bearer token in the request.
    #[error("missing or malformed Authorization header")]
    MissingToken,

    /// The verifier rejected the token.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// The token is valid but belongs to a different identity.
    #[error("token identity does not match {claimed}")]
    Mismatch {
        /// Identity named in the request
        claimed: UserId,
    },

    /// The verifier could not be reached.
    #[error("identity verifier unavailable: {0}")]
    Unavailable(String),
}

/// Resolves a bearer token to the identity it was issued for.
#[async_trait]
pub trait IdentityVerifier: Send + Sync + 'static {
    /// Verify `token`, returning its identity.
    async fn verify(&self, token: &str) -> Result<UserId, AuthError>;
}

/// Extract the token from `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Check that the request is authorised to act as `claimed`.
///
/// # Errors
///
/// With a verifier configured: `MissingToken` without a bearer token,
/// `InvalidToken`/`Unavailable` from the verifier, and `Mismatch` when the
/// verified identity differs from `claimed`.
pub async fn authorize(
    verifier: Option<&dyn IdentityVerifier>,
    headers: &HeaderMap,
    claimed: &UserId,
) -> Result<(), AuthError> {
    let Some(verifier) = verifier else {
        return Ok(());
    };
    let token = bearer_token(headers).ok_or(AuthError::MissingToken)?;
    let verified = verifier.verify(token).await?;
    if &verified == claimed {
        Ok(())
    } else {
        tracing::warn!(claimed = %claimed, "identity mismatch");
        Err(AuthError::Mismatch { claimed: claimed.clone() })
    }
}

#[derive(Deserialize)]
struct VerifyResponse {
    uid: String,
}

/// Verifier backed by an HTTP endpoint.
///
/// Sends the bearer token as-is and expects `200 {"uid": "..."}`. A 4xx
/// answer means the token is invalid.
pub struct HttpIdentityVerifier {
    client: reqwest::Client,
    url: String,
}

impl HttpIdentityVerifier {
    /// Request timeout for verification calls.
    pub const TIMEOUT: Duration = Duration::from_secs(10);

    /// Create a verifier calling `url`.
    pub fn new(url: impl Into<String>) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(Self::TIMEOUT)
            .build()
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;
        Ok(Self { client, url: url.into() })
    }
}

impl fmt::Debug for HttpIdentityVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpIdentityVerifier").field("url", &self.url).finish()
    }
}

#[async_trait]
impl IdentityVerifier for HttpIdentityVerifier {
    async fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        let response = self
            .client
            .get(&self.url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            return Err(AuthError::InvalidToken(format!("verifier answered {status}")));
        }
        if !status.is_success() {
            return Err(AuthError::Unavailable(format!("verifier answered {status}")));
        }

        let body: VerifyResponse =
            response.json().await.map_err(|e| AuthError::Unavailable(e.to_string()))?;
        Ok(UserId::new(body.uid))
    }
}
