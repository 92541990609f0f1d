use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::extractor::Subject;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Preset {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub kind: String,
    pub parameters: Value,
    pub is_shared: bool,
    pub usage_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct NewPreset {
    pub name: String,
    pub description: Option<String>,
    pub kind: String,
    pub parameters: Value,
    pub is_shared: bool,
}

pub struct PresetChanges {
    pub name: Option<String>,
    pub description: Option<String>,
    pub parameters: Option<Value>,
    pub is_shared: Option<bool>,
}

pub async fn create(pool: &PgPool, subject: &Subject, new: NewPreset) -> AppResult<Preset> {
    sqlx::query_as::<_, Preset>(
        "INSERT INTO presets (id, workspace_id, user_id, name, description, kind, parameters, is_shared) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(subject.workspace_id)
    .bind(subject.user_id)
    .bind(&new.name)
    .bind(&new.description)
    .bind(&new.kind)
    .bind(&new.parameters)
    .bind(new.is_shared)
    .fetch_one(pool)
    .await
    .map_err(|e| {
        tracing::error!(?e, "DB error inserting preset");
        AppError::Db(e)
    })
}

/// A preset is readable iff it is shared or the caller owns it. Anything
/// else, including rows from other workspaces, surfaces as `NotFound`.
pub async fn get_accessible(pool: &PgPool, subject: &Subject, id: Uuid) -> AppResult<Preset> {
    sqlx::query_as::<_, Preset>(
        "SELECT * FROM presets \
         WHERE id = $1 AND workspace_id = $2 AND (is_shared OR user_id = $3)",
    )
    .bind(id)
    .bind(subject.workspace_id)
    .bind(subject.user_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| {
        tracing::error!(?e, "DB error fetching preset");
        AppError::Db(e)
    })?
    .ok_or(AppError::NotFound)
}

pub async fn list_accessible(pool: &PgPool, subject: &Subject) -> AppResult<Vec<Preset>> {
    sqlx::query_as::<_, Preset>(
        "SELECT * FROM presets \
         WHERE workspace_id = $1 AND (is_shared OR user_id = $2) \
         ORDER BY created_at DESC",
    )
    .bind(subject.workspace_id)
    .bind(subject.user_id)
    .fetch_all(pool)
    .await
    .map_err(|e| {
        tracing::error!(?e, "DB error listing presets");
        AppError::Db(e)
    })
}

/// Owner check distinct from visibility: a shared preset is visible to the
/// workspace but only its owner may change it.
async fn require_owner(pool: &PgPool, subject: &Subject, id: Uuid) -> AppResult<()> {
    let row = sqlx::query("SELECT user_id FROM presets WHERE id = $1 AND workspace_id = $2")
        .bind(id)
        .bind(subject.workspace_id)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Err(AppError::NotFound);
    };
    if row.get::<Uuid, _>("user_id") != subject.user_id {
        return Err(AppError::Forbidden);
    }
    Ok(())
}

pub async fn update(
    pool: &PgPool,
    subject: &Subject,
    id: Uuid,
    changes: PresetChanges,
) -> AppResult<Preset> {
    require_owner(pool, subject, id).await?;
    sqlx::query_as::<_, Preset>(
        "UPDATE presets SET \
             name = COALESCE($3, name), \
             description = COALESCE($4, description), \
             parameters = COALESCE($5, parameters), \
             is_shared = COALESCE($6, is_shared), \
             updated_at = now() \
         WHERE id = $1 AND workspace_id = $2 \
         RETURNING *",
    )
    .bind(id)
    .bind(subject.workspace_id)
    .bind(&changes.name)
    .bind(&changes.description)
    .bind(&changes.parameters)
    .bind(changes.is_shared)
    .fetch_one(pool)
    .await
    .map_err(|e| {
        tracing::error!(?e, "DB error updating preset");
        AppError::Db(e)
    })
}

pub async fn delete(pool: &PgPool, subject: &Subject, id: Uuid) -> AppResult<()> {
    require_owner(pool, subject, id).await?;
    sqlx::query("DELETE FROM presets WHERE id = $1 AND workspace_id = $2")
        .bind(id)
        .bind(subject.workspace_id)
        .execute(pool)
        .await
        .map_err(|e| {
            tracing::error!(?e, "DB error deleting preset");
            AppError::Db(e)
        })?;
    Ok(())
}

/// Bumped exactly once per successful transformation enqueue, inside the
/// enqueue transaction. Executor retries never touch this.
pub async fn increment_usage(
    tx: &mut Transaction<'_, Postgres>,
    subject: &Subject,
    id: Uuid,
) -> AppResult<()> {
    sqlx::query(
        "UPDATE presets SET usage_count = usage_count + 1 \
         WHERE id = $1 AND workspace_id = $2",
    )
    .bind(id)
    .bind(subject.workspace_id)
    .execute(tx)
    .await?;
    Ok(())
}
