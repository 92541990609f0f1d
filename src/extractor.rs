use axum::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use chrono::Utc;
use jsonwebtoken::{decode, errors::ErrorKind, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Claims embedded in an access token.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct AccessClaims {
    /// User id.
    pub sub: Uuid,
    /// Workspace id.
    pub wid: Uuid,
    /// Session id backing this token.
    pub sid: Uuid,
    pub role: String,
    pub exp: usize,
}

/// Authenticated request principal. Every scoped operation takes this as
/// its first argument and filters on `workspace_id`.
#[derive(Debug, Clone)]
pub struct Subject {
    pub user_id: Uuid,
    pub workspace_id: Uuid,
    pub role: String,
    pub session_id: Uuid,
}

#[derive(Debug, PartialEq, Eq)]
pub enum TokenFailure {
    Expired,
    Invalid,
}

/// Decode and verify an access token's signature and expiry.
pub fn decode_access_claims(token: &str) -> Result<AccessClaims, TokenFailure> {
    let secret = crate::config::JWT_SECRET.as_str();
    decode::<AccessClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| match e.kind() {
        ErrorKind::ExpiredSignature => TokenFailure::Expired,
        _ => TokenFailure::Invalid,
    })
}

/// Check the backing session against the store. Access tokens are not
/// revoked individually; revoking the session invalidates them.
pub async fn authorize_claims(pool: &PgPool, claims: &AccessClaims) -> AppResult<Subject> {
    let row = sqlx::query("SELECT revoked, expires_at FROM sessions WHERE id = $1")
        .bind(claims.sid)
        .fetch_optional(pool)
        .await
        .map_err(|e| {
            tracing::error!(?e, "DB error checking session");
            AppError::Db(e)
        })?;
    let Some(row) = row else {
        return Err(AppError::Unauthorized);
    };
    let revoked: bool = row.get("revoked");
    let expires_at: chrono::DateTime<Utc> = row.get("expires_at");
    if revoked || expires_at < Utc::now() {
        return Err(AppError::Unauthorized);
    }
    Ok(Subject {
        user_id: claims.sub,
        workspace_id: claims.wid,
        role: claims.role.clone(),
        session_id: claims.sid,
    })
}

#[async_trait]
impl<S> FromRequestParts<S> for Subject
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer "))
            .ok_or(AppError::Unauthorized)?;
        let claims = decode_access_claims(token).map_err(|_| AppError::Unauthorized)?;
        let pool = parts
            .extensions
            .get::<PgPool>()
            .ok_or_else(|| AppError::Message("database pool missing from request".into()))?
            .clone();
        authorize_claims(&pool, &claims).await
    }
}
