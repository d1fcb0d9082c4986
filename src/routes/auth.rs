//! Resolves the caller's owner identity from an HS256 bearer token.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;
use crate::models::job::OwnerId;
use crate::routes::error::ApiError;

/// Claims expected in caller tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Owner identity.
    pub sub: String,
    /// Expiration time (UTC Unix timestamp).
    pub exp: i64,
}

/// Verifies bearer tokens against the configured secret.
pub struct TokenVerifier {
    decoding: DecodingKey,
    encoding: EncodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn verify(&self, token: &str) -> Result<OwnerId, jsonwebtoken::errors::Error> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)?;
        Ok(OwnerId::new(data.claims.sub))
    }

    /// Sign a token for `owner` valid for `ttl_secs`.
    pub fn issue(&self, owner: &OwnerId, ttl_secs: i64) -> Result<String, jsonwebtoken::errors::Error> {
        let claims = Claims {
            sub: owner.as_str().to_string(),
            exp: chrono::Utc::now().timestamp() + ttl_secs,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
    }
}

/// The authenticated owner making the request.
///
/// Read from `Authorization: Bearer <token>`, or from a `token` query
/// parameter for WebSocket upgrades where browsers cannot set headers.
#[derive(Debug, Clone)]
pub struct CurrentOwner(pub OwnerId);

impl FromRequestParts<AppState> for CurrentOwner {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .or_else(|| query_token(parts))
            .ok_or_else(|| ApiError::Unauthorized("Missing bearer token".to_string()))?;

        let owner = state
            .auth
            .verify(&token)
            .map_err(|_| ApiError::Unauthorized("Invalid or expired token".to_string()))?;

        Ok(CurrentOwner(owner))
    }
}

fn bearer_token(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
}

fn query_token(parts: &Parts) -> Option<String> {
    parts.uri.query()?.split('&').find_map(|pair| {
        pair.strip_prefix("token=")
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    })
}
