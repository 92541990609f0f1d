use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::extractor::Subject;

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_RUNNING: &str = "running";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";
pub const STATUS_CANCELLED: &str = "cancelled";

pub fn is_terminal(status: &str) -> bool {
    matches!(status, STATUS_COMPLETED | STATUS_FAILED | STATUS_CANCELLED)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Transformation {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub user_id: Uuid,
    pub document_id: Option<Uuid>,
    pub kind: String,
    pub parameters: Value,
    pub status: String,
    pub result: Option<String>,
    pub error_reason: Option<String>,
    pub provider_used: Option<String>,
    pub tokens_used: Option<i64>,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

pub struct NewTransformation {
    pub id: Uuid,
    pub document_id: Option<Uuid>,
    pub kind: String,
    pub parameters: Value,
}

/// Insert a pending transformation. Runs inside the create-request
/// transaction so the row, its queue entry, and the preset usage bump
/// commit atomically.
pub async fn create(
    tx: &mut Transaction<'_, Postgres>,
    subject: &Subject,
    new: NewTransformation,
) -> AppResult<Transformation> {
    sqlx::query_as::<_, Transformation>(
        "INSERT INTO transformations \
             (id, workspace_id, user_id, document_id, kind, parameters, status) \
         VALUES ($1, $2, $3, $4, $5, $6, 'pending') \
         RETURNING *",
    )
    .bind(new.id)
    .bind(subject.workspace_id)
    .bind(subject.user_id)
    .bind(new.document_id)
    .bind(&new.kind)
    .bind(&new.parameters)
    .fetch_one(tx)
    .await
    .map_err(|e| {
        tracing::error!(?e, "DB error inserting transformation");
        AppError::Db(e)
    })
}

pub async fn get(pool: &PgPool, subject: &Subject, id: Uuid) -> AppResult<Transformation> {
    sqlx::query_as::<_, Transformation>(
        "SELECT * FROM transformations WHERE id = $1 AND workspace_id = $2",
    )
    .bind(id)
    .bind(subject.workspace_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| {
        tracing::error!(?e, "DB error fetching transformation");
        AppError::Db(e)
    })?
    .ok_or(AppError::NotFound)
}

pub async fn list(
    pool: &PgPool,
    subject: &Subject,
    document_id: Option<Uuid>,
) -> AppResult<Vec<Transformation>> {
    let rows = match document_id {
        Some(document_id) => {
            sqlx::query_as::<_, Transformation>(
                "SELECT * FROM transformations \
                 WHERE workspace_id = $1 AND document_id = $2 \
                 ORDER BY created_at DESC",
            )
            .bind(subject.workspace_id)
            .bind(document_id)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, Transformation>(
                "SELECT * FROM transformations WHERE workspace_id = $1 \
                 ORDER BY created_at DESC",
            )
            .bind(subject.workspace_id)
            .fetch_all(pool)
            .await
        }
    };
    rows.map_err(|e| {
        tracing::error!(?e, "DB error listing transformations");
        AppError::Db(e)
    })
}

#[derive(Serialize)]
pub struct WorkspaceUsage {
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub tokens_used: i64,
}

pub async fn workspace_usage(pool: &PgPool, subject: &Subject) -> AppResult<WorkspaceUsage> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS total, \
                COUNT(*) FILTER (WHERE status = 'completed') AS completed, \
                COUNT(*) FILTER (WHERE status = 'failed') AS failed, \
                COALESCE(SUM(tokens_used), 0) AS tokens_used \
         FROM transformations WHERE workspace_id = $1",
    )
    .bind(subject.workspace_id)
    .fetch_one(pool)
    .await
    .map_err(|e| {
        tracing::error!(?e, "DB error aggregating workspace usage");
        AppError::Db(e)
    })?;
    Ok(WorkspaceUsage {
        total: row.get("total"),
        completed: row.get("completed"),
        failed: row.get("failed"),
        tokens_used: row.get("tokens_used"),
    })
}

// The operations below take no Subject: they are reached from the executor,
// which owns the job's claim, and (`mark_cancelled` only) from the cancel
// handler after its scoped lookup, once the queue row is gone and no claim
// can exist. Status writes are compare-and-set so transitions stay
// monotonic toward a terminal state.

pub async fn load(pool: &PgPool, id: Uuid) -> AppResult<Option<Transformation>> {
    sqlx::query_as::<_, Transformation>("SELECT * FROM transformations WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(|e| {
            tracing::error!(?e, "DB error loading transformation");
            AppError::Db(e)
        })
}

pub async fn mark_running(pool: &PgPool, id: Uuid, attempts: i32) -> AppResult<bool> {
    let result = sqlx::query(
        "UPDATE transformations \
         SET status = 'running', attempts = $2, updated_at = now() \
         WHERE id = $1 AND status IN ('pending', 'running')",
    )
    .bind(id)
    .bind(attempts)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn complete(
    pool: &PgPool,
    id: Uuid,
    result_text: &str,
    provider: &str,
    tokens_used: i64,
) -> AppResult<bool> {
    let result = sqlx::query(
        "UPDATE transformations \
         SET status = 'completed', result = $2, provider_used = $3, tokens_used = $4, \
             error_reason = NULL, completed_at = now(), updated_at = now() \
         WHERE id = $1 AND status = 'running'",
    )
    .bind(id)
    .bind(result_text)
    .bind(provider)
    .bind(tokens_used)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn fail(pool: &PgPool, id: Uuid, reason: &str) -> AppResult<bool> {
    let result = sqlx::query(
        "UPDATE transformations \
         SET status = 'failed', error_reason = $2, completed_at = now(), updated_at = now() \
         WHERE id = $1 AND status IN ('pending', 'running')",
    )
    .bind(id)
    .bind(reason)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn mark_cancelled(pool: &PgPool, id: Uuid) -> AppResult<bool> {
    let result = sqlx::query(
        "UPDATE transformations \
         SET status = 'cancelled', completed_at = now(), updated_at = now() \
         WHERE id = $1 AND status IN ('pending', 'running')",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}
