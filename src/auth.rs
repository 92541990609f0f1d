use argon2::password_hash::{PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use axum::{extract::Extension, http::StatusCode, Json};
use once_cell::sync::Lazy;
use rand_core::OsRng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tracing::error;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::extractor::Subject;
use crate::rate_limit;
use crate::sessions::{self, TokenPair};

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email regex")
});

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub workspace_name: Option<String>,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct RefreshRequest {
    pub refresh: String,
}

#[derive(Serialize)]
pub struct UserInfo {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub email: String,
    pub role: String,
    pub is_active: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Serialize)]
pub struct WorkspaceInfo {
    pub id: Uuid,
    pub name: String,
    pub plan: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Serialize)]
pub struct RegisterResponse {
    pub user: UserInfo,
}

#[derive(Serialize)]
pub struct MeResponse {
    pub user: UserInfo,
    pub workspace: WorkspaceInfo,
}

fn validate_password(password: &str) -> Result<(), AppError> {
    if password.len() < 10
        || !password.chars().any(|c| c.is_ascii_alphabetic())
        || !password.chars().any(|c| c.is_ascii_digit())
    {
        return Err(AppError::BadRequest(
            "Password must be at least 10 characters and contain a letter and a digit".into(),
        ));
    }
    Ok(())
}

fn hash_password(password: &str) -> AppResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| {
            error!(?e, "password hashing failed");
            AppError::Message("password hashing failed".into())
        })
}

/// True when the stored hash was produced with parameters other than the
/// current defaults and should be upgraded on the next successful verify.
fn needs_rehash(parsed: &PasswordHash) -> bool {
    let defaults = argon2::Params::default();
    parsed.params.get_decimal("m") != Some(defaults.m_cost())
        || parsed.params.get_decimal("t") != Some(defaults.t_cost())
        || parsed.params.get_decimal("p") != Some(defaults.p_cost())
}

pub async fn register(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<RegisterRequest>,
) -> AppResult<(StatusCode, Json<RegisterResponse>)> {
    rate_limit::check(Uuid::nil(), "register")?;
    let email = payload.email.trim().to_lowercase();
    if !EMAIL_RE.is_match(&email) {
        return Err(AppError::BadRequest("Invalid email address".into()));
    }
    validate_password(&payload.password)?;
    let password_hash = hash_password(&payload.password)?;

    let workspace_name = payload
        .workspace_name
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            let local = email.split('@').next().unwrap_or("user");
            format!("{local}'s workspace")
        });

    let mut tx = pool.begin().await?;
    let workspace_id = Uuid::new_v4();
    sqlx::query("INSERT INTO workspaces (id, name, plan) VALUES ($1, $2, 'free')")
        .bind(workspace_id)
        .bind(&workspace_name)
        .execute(&mut tx)
        .await?;
    let user_id = Uuid::new_v4();
    let inserted = sqlx::query(
        "INSERT INTO users (id, workspace_id, email, password_hash, role) \
         VALUES ($1, $2, $3, $4, 'owner') RETURNING created_at",
    )
    .bind(user_id)
    .bind(workspace_id)
    .bind(&email)
    .bind(&password_hash)
    .fetch_one(&mut tx)
    .await;
    let row = match inserted {
        Ok(row) => row,
        Err(e) => {
            if let sqlx::Error::Database(db_err) = &e {
                if db_err.constraint() == Some("users_email_key") {
                    return Err(AppError::Conflict("Email already registered".into()));
                }
            }
            error!(?e, "DB error registering user");
            return Err(AppError::Db(e));
        }
    };
    tx.commit().await?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            user: UserInfo {
                id: user_id,
                workspace_id,
                email,
                role: "owner".into(),
                is_active: true,
                created_at: row.get("created_at"),
            },
        }),
    ))
}

pub async fn login(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<LoginRequest>,
) -> AppResult<Json<TokenPair>> {
    rate_limit::check(Uuid::nil(), "login")?;
    let email = payload.email.trim().to_lowercase();
    let rec = sqlx::query(
        "SELECT id, workspace_id, password_hash, role, is_active FROM users WHERE email = $1",
    )
    .bind(&email)
    .fetch_optional(&pool)
    .await
    .map_err(|e| {
        error!(?e, "DB error while fetching user");
        AppError::Db(e)
    })?;
    let rec = rec.ok_or(AppError::Unauthorized)?;
    if !rec.get::<bool, _>("is_active") {
        return Err(AppError::Unauthorized);
    }
    let user_id: Uuid = rec.get("id");
    let workspace_id: Uuid = rec.get("workspace_id");
    let stored_hash: String = rec.get("password_hash");
    let role: String = rec.get("role");

    let parsed = PasswordHash::new(&stored_hash).map_err(|e| {
        error!(?e, "stored password hash unparseable");
        AppError::Message("credential verification failed".into())
    })?;
    if Argon2::default()
        .verify_password(payload.password.as_bytes(), &parsed)
        .is_err()
    {
        return Err(AppError::Unauthorized);
    }
    if needs_rehash(&parsed) {
        let upgraded = hash_password(&payload.password)?;
        if let Err(e) = sqlx::query("UPDATE users SET password_hash = $1 WHERE id = $2")
            .bind(&upgraded)
            .bind(user_id)
            .execute(&pool)
            .await
        {
            // Best effort; the login itself already succeeded.
            error!(?e, %user_id, "failed to upgrade password hash");
        }
    }

    let pair = sessions::issue(&pool, user_id, workspace_id, &role).await?;
    Ok(Json(pair))
}

pub async fn refresh(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<RefreshRequest>,
) -> AppResult<Json<TokenPair>> {
    rate_limit::check(Uuid::nil(), "refresh")?;
    let pair = sessions::rotate(&pool, &payload.refresh).await?;
    Ok(Json(pair))
}

pub async fn logout(
    Extension(pool): Extension<PgPool>,
    subject: Subject,
) -> AppResult<StatusCode> {
    sessions::revoke_chain(&pool, subject.session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn me(
    Extension(pool): Extension<PgPool>,
    subject: Subject,
) -> AppResult<Json<MeResponse>> {
    let row = sqlx::query(
        "SELECT u.email, u.role, u.is_active, u.created_at, \
                w.name AS workspace_name, w.plan, w.created_at AS workspace_created_at \
         FROM users u JOIN workspaces w ON w.id = u.workspace_id \
         WHERE u.id = $1 AND u.workspace_id = $2",
    )
    .bind(subject.user_id)
    .bind(subject.workspace_id)
    .fetch_optional(&pool)
    .await
    .map_err(|e| {
        error!(?e, "DB error fetching current user");
        AppError::Db(e)
    })?;
    let Some(row) = row else {
        return Err(AppError::Unauthorized);
    };
    Ok(Json(MeResponse {
        user: UserInfo {
            id: subject.user_id,
            workspace_id: subject.workspace_id,
            email: row.get("email"),
            role: row.get("role"),
            is_active: row.get("is_active"),
            created_at: row.get("created_at"),
        },
        workspace: WorkspaceInfo {
            id: subject.workspace_id,
            name: row.get("workspace_name"),
            plan: row.get("plan"),
            created_at: row.get("workspace_created_at"),
        },
    }))
}
