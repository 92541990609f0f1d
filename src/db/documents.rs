use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::extractor::Subject;

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_READY: &str = "ready";
pub const STATUS_FAILED: &str = "failed";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Document {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub original_filename: String,
    pub content_type: String,
    pub blob_ref: String,
    pub content_hash: String,
    pub status: String,
    pub error_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub extracted_text: Option<String>,
}

pub struct NewDocument {
    pub title: String,
    pub description: Option<String>,
    pub original_filename: String,
    pub content_type: String,
    pub blob_ref: String,
    pub content_hash: String,
    pub status: String,
    pub error_reason: Option<String>,
    pub extracted_text: Option<String>,
}

pub async fn create(pool: &PgPool, subject: &Subject, new: NewDocument) -> AppResult<Document> {
    sqlx::query_as::<_, Document>(
        "INSERT INTO documents \
             (id, workspace_id, user_id, title, description, original_filename, content_type, \
              blob_ref, content_hash, status, error_reason, extracted_text) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(subject.workspace_id)
    .bind(subject.user_id)
    .bind(&new.title)
    .bind(&new.description)
    .bind(&new.original_filename)
    .bind(&new.content_type)
    .bind(&new.blob_ref)
    .bind(&new.content_hash)
    .bind(&new.status)
    .bind(&new.error_reason)
    .bind(&new.extracted_text)
    .fetch_one(pool)
    .await
    .map_err(|e| {
        tracing::error!(?e, "DB error inserting document");
        AppError::Db(e)
    })
}

/// Rows outside the subject's workspace surface as `NotFound`; existence is
/// never leaked across the tenancy boundary.
pub async fn get(pool: &PgPool, subject: &Subject, id: Uuid) -> AppResult<Document> {
    sqlx::query_as::<_, Document>(
        "SELECT * FROM documents \
         WHERE id = $1 AND workspace_id = $2 AND deleted_at IS NULL",
    )
    .bind(id)
    .bind(subject.workspace_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| {
        tracing::error!(?e, "DB error fetching document");
        AppError::Db(e)
    })?
    .ok_or(AppError::NotFound)
}

pub async fn list(pool: &PgPool, subject: &Subject) -> AppResult<Vec<Document>> {
    sqlx::query_as::<_, Document>(
        "SELECT * FROM documents \
         WHERE workspace_id = $1 AND deleted_at IS NULL \
         ORDER BY created_at DESC",
    )
    .bind(subject.workspace_id)
    .fetch_all(pool)
    .await
    .map_err(|e| {
        tracing::error!(?e, "DB error listing documents");
        AppError::Db(e)
    })
}

pub async fn soft_delete(pool: &PgPool, subject: &Subject, id: Uuid) -> AppResult<()> {
    let result = sqlx::query(
        "UPDATE documents SET deleted_at = now(), updated_at = now() \
         WHERE id = $1 AND workspace_id = $2 AND deleted_at IS NULL",
    )
    .bind(id)
    .bind(subject.workspace_id)
    .execute(pool)
    .await
    .map_err(|e| {
        tracing::error!(?e, "DB error deleting document");
        AppError::Db(e)
    })?;
    if result.rows_affected() == 0 {
        return Err(AppError::NotFound);
    }
    Ok(())
}

/// Worker-side source load, scoped by the owning transformation's workspace.
/// Not reachable from request handlers.
pub async fn load_extracted_text(
    pool: &PgPool,
    workspace_id: Uuid,
    id: Uuid,
) -> AppResult<Option<String>> {
    let row: Option<(Option<String>,)> = sqlx::query_as(
        "SELECT extracted_text FROM documents \
         WHERE id = $1 AND workspace_id = $2 AND deleted_at IS NULL",
    )
    .bind(id)
    .bind(workspace_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| {
        tracing::error!(?e, "DB error loading document text");
        AppError::Db(e)
    })?;
    Ok(row.and_then(|(text,)| text))
}
