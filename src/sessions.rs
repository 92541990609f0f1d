use chrono::{Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use rand_core::{OsRng, RngCore};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::config;
use crate::error::{AppError, AppResult};
use crate::extractor::AccessClaims;

/// Credential pair returned by login and refresh.
#[derive(Serialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
    pub expires_in: i64,
}

/// Refresh credentials are opaque high-entropy values; only this digest is stored.
pub fn hash_refresh_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn generate_refresh_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn encode_access_token(
    user_id: Uuid,
    workspace_id: Uuid,
    session_id: Uuid,
    role: &str,
) -> AppResult<String> {
    let exp = Utc::now()
        .checked_add_signed(Duration::seconds(*config::ACCESS_TTL_SECONDS))
        .ok_or_else(|| AppError::Message("clock overflow computing token expiry".into()))?
        .timestamp() as usize;
    let claims = AccessClaims {
        sub: user_id,
        wid: workspace_id,
        sid: session_id,
        role: role.to_string(),
        exp,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config::JWT_SECRET.as_bytes()),
    )
    .map_err(|e| {
        tracing::error!(?e, "access token encoding failed");
        AppError::Message("token encoding failed".into())
    })
}

/// Create a fresh session for a user and return its credential pair.
/// Used at login; rotation goes through [`rotate`].
pub async fn issue(
    pool: &PgPool,
    user_id: Uuid,
    workspace_id: Uuid,
    role: &str,
) -> AppResult<TokenPair> {
    let refresh = generate_refresh_token();
    let session_id = Uuid::new_v4();
    let expires_at = Utc::now() + Duration::seconds(*config::REFRESH_TTL_SECONDS);
    sqlx::query(
        "INSERT INTO sessions (id, user_id, workspace_id, refresh_token_hash, expires_at) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(session_id)
    .bind(user_id)
    .bind(workspace_id)
    .bind(hash_refresh_token(&refresh))
    .bind(expires_at)
    .execute(pool)
    .await
    .map_err(|e| {
        tracing::error!(?e, "DB error inserting session");
        AppError::Db(e)
    })?;
    Ok(TokenPair {
        access: encode_access_token(user_id, workspace_id, session_id, role)?,
        refresh,
        expires_in: *config::ACCESS_TTL_SECONDS,
    })
}

/// Rotate a refresh credential: revoke the presented session and issue a
/// child session atomically. Presenting an already-rotated credential is
/// treated as replay of a stolen token and revokes the whole chain.
pub async fn rotate(pool: &PgPool, refresh_token: &str) -> AppResult<TokenPair> {
    let hash = hash_refresh_token(refresh_token);
    let mut tx = pool.begin().await?;
    let row = sqlx::query(
        "SELECT id, user_id, workspace_id, revoked, expires_at \
         FROM sessions WHERE refresh_token_hash = $1 FOR UPDATE",
    )
    .bind(&hash)
    .fetch_optional(&mut tx)
    .await?;
    let Some(row) = row else {
        return Err(AppError::Unauthorized);
    };
    let session_id: Uuid = row.get("id");
    let user_id: Uuid = row.get("user_id");
    let workspace_id: Uuid = row.get("workspace_id");
    let revoked: bool = row.get("revoked");
    let expires_at: chrono::DateTime<Utc> = row.get("expires_at");

    if revoked {
        // Replay of a rotated token: the credential leaked. Force re-login
        // on the legitimate holder by revoking every descendant of the root.
        drop(tx);
        let revoked_count = revoke_chain(pool, session_id).await?;
        tracing::warn!(%session_id, revoked_count, "refresh token replay detected; chain revoked");
        return Err(AppError::Unauthorized);
    }
    if expires_at < Utc::now() {
        return Err(AppError::Unauthorized);
    }

    let user = sqlx::query("SELECT role, is_active FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(&mut tx)
        .await?;
    let Some(user) = user else {
        return Err(AppError::Unauthorized);
    };
    if !user.get::<bool, _>("is_active") {
        return Err(AppError::Unauthorized);
    }
    let role: String = user.get("role");

    sqlx::query("UPDATE sessions SET revoked = TRUE WHERE id = $1")
        .bind(session_id)
        .execute(&mut tx)
        .await?;
    let refresh = generate_refresh_token();
    let child_id = Uuid::new_v4();
    let child_expires = Utc::now() + Duration::seconds(*config::REFRESH_TTL_SECONDS);
    sqlx::query(
        "INSERT INTO sessions (id, user_id, workspace_id, refresh_token_hash, expires_at, parent_session_id) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(child_id)
    .bind(user_id)
    .bind(workspace_id)
    .bind(hash_refresh_token(&refresh))
    .bind(child_expires)
    .bind(session_id)
    .execute(&mut tx)
    .await?;
    tx.commit().await?;

    Ok(TokenPair {
        access: encode_access_token(user_id, workspace_id, child_id, &role)?,
        refresh,
        expires_in: *config::ACCESS_TTL_SECONDS,
    })
}

/// Revoke the entire rotation chain containing `session_id`: every ancestor
/// and every descendant of any ancestor. Returns the number of sessions hit.
pub async fn revoke_chain(pool: &PgPool, session_id: Uuid) -> AppResult<u64> {
    let result = sqlx::query(
        "WITH RECURSIVE up AS ( \
             SELECT id, parent_session_id FROM sessions WHERE id = $1 \
             UNION \
             SELECT s.id, s.parent_session_id FROM sessions s \
                 JOIN up ON up.parent_session_id = s.id \
         ), chain AS ( \
             SELECT id FROM up \
             UNION \
             SELECT s.id FROM sessions s JOIN chain ON s.parent_session_id = chain.id \
         ) \
         UPDATE sessions SET revoked = TRUE WHERE id IN (SELECT id FROM chain)",
    )
    .bind(session_id)
    .execute(pool)
    .await
    .map_err(|e| {
        tracing::error!(?e, %session_id, "DB error revoking session chain");
        AppError::Db(e)
    })?;
    Ok(result.rows_affected())
}
