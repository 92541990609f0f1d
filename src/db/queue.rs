use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::config;
use crate::error::{AppError, AppResult};
use crate::extractor::Subject;

/// Postgres NOTIFY channel that wakes idle workers after an enqueue.
pub const WAKE_CHANNEL: &str = "remix_tasks";

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct QueuedTask {
    /// Same id as the owning transformation.
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub attempts: i32,
    pub not_before: DateTime<Utc>,
    pub claim_owner: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a request-path cancel.
#[derive(Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was unclaimed and has been removed from the queue.
    Deleted,
    /// The task is claimed; the executor will observe the flag and stop.
    Flagged,
    /// No queue row for this id in the subject's workspace.
    NotFound,
}

/// Exponential retry backoff: `base * 2^min(attempts, cap)`.
pub fn backoff_delay_ms(attempts: i32) -> i64 {
    let exp = (attempts.max(0) as u32).min(config::BACKOFF_EXP_CAP);
    *config::BACKOFF_BASE_MS * (1i64 << exp)
}

/// Insert a queue row and post the wake signal. The NOTIFY is issued inside
/// the transaction so it is only delivered once the row is visible.
pub async fn enqueue(
    tx: &mut Transaction<'_, Postgres>,
    subject: &Subject,
    task_id: Uuid,
    payload: Value,
) -> AppResult<()> {
    sqlx::query(
        "INSERT INTO queued_tasks (id, workspace_id, payload) VALUES ($1, $2, $3)",
    )
    .bind(task_id)
    .bind(subject.workspace_id)
    .bind(&payload)
    .execute(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(?e, "DB error enqueueing task");
        AppError::Db(e)
    })?;
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(WAKE_CHANNEL)
        .bind(task_id.to_string())
        .execute(&mut *tx)
        .await?;
    Ok(())
}

/// Atomically lease the eligible task with the smallest `(not_before, id)`.
/// Eligible: due, and either unclaimed or holding an expired lease.
pub async fn claim(
    pool: &PgPool,
    worker_id: &str,
    lease_seconds: i64,
) -> AppResult<Option<QueuedTask>> {
    sqlx::query_as::<_, QueuedTask>(
        "UPDATE queued_tasks SET \
             claim_owner = $1, \
             claim_expires_at = now() + make_interval(secs => $2), \
             attempts = attempts + 1 \
         WHERE id = ( \
             SELECT id FROM queued_tasks \
             WHERE not_before <= now() \
               AND (claim_owner IS NULL OR claim_expires_at < now()) \
             ORDER BY not_before, id \
             FOR UPDATE SKIP LOCKED \
             LIMIT 1 \
         ) \
         RETURNING *",
    )
    .bind(worker_id)
    .bind(lease_seconds as f64)
    .fetch_optional(pool)
    .await
    .map_err(|e| {
        tracing::error!(?e, "DB error claiming task");
        AppError::Db(e)
    })
}

/// Remove a finished task. Fails closed when the claim owner does not match:
/// a worker whose lease expired must not ack a task someone else re-claimed.
pub async fn ack(pool: &PgPool, task_id: Uuid, worker_id: &str) -> AppResult<bool> {
    let result = sqlx::query("DELETE FROM queued_tasks WHERE id = $1 AND claim_owner = $2")
        .bind(task_id)
        .bind(worker_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Release a claim and push the task into the future for retry.
pub async fn nack(
    pool: &PgPool,
    task_id: Uuid,
    worker_id: &str,
    delay_ms: i64,
) -> AppResult<bool> {
    let result = sqlx::query(
        "UPDATE queued_tasks SET \
             claim_owner = NULL, \
             claim_expires_at = NULL, \
             not_before = now() + make_interval(secs => $3) \
         WHERE id = $1 AND claim_owner = $2",
    )
    .bind(task_id)
    .bind(worker_id)
    .bind(delay_ms as f64 / 1000.0)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Request-path cancel: delete outright when unclaimed, otherwise set the
/// cooperative flag the executor polls between provider attempts.
pub async fn cancel(pool: &PgPool, subject: &Subject, task_id: Uuid) -> AppResult<CancelOutcome> {
    let deleted = sqlx::query(
        "DELETE FROM queued_tasks \
         WHERE id = $1 AND workspace_id = $2 AND claim_owner IS NULL",
    )
    .bind(task_id)
    .bind(subject.workspace_id)
    .execute(pool)
    .await?;
    if deleted.rows_affected() > 0 {
        return Ok(CancelOutcome::Deleted);
    }
    let flagged = sqlx::query(
        "UPDATE queued_tasks SET cancel_requested = TRUE \
         WHERE id = $1 AND workspace_id = $2",
    )
    .bind(task_id)
    .bind(subject.workspace_id)
    .execute(pool)
    .await?;
    if flagged.rows_affected() > 0 {
        return Ok(CancelOutcome::Flagged);
    }
    Ok(CancelOutcome::NotFound)
}

/// Worker-side poll of the cooperative cancel flag.
pub async fn cancel_flag(pool: &PgPool, task_id: Uuid) -> AppResult<bool> {
    let row: Option<(bool,)> =
        sqlx::query_as("SELECT cancel_requested FROM queued_tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|(flag,)| flag).unwrap_or(false))
}

/// Startup sweep: drop queue rows whose transformation already reached a
/// terminal state (left behind by a crash between terminal write and ack).
pub async fn reap_terminal(pool: &PgPool) -> AppResult<u64> {
    let result = sqlx::query(
        "DELETE FROM queued_tasks q USING transformations t \
         WHERE q.id = t.id AND t.status IN ('completed', 'failed', 'cancelled')",
    )
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = *config::BACKOFF_BASE_MS;
        assert_eq!(backoff_delay_ms(0), base);
        assert_eq!(backoff_delay_ms(1), base * 2);
        assert_eq!(backoff_delay_ms(3), base * 8);
        let cap = backoff_delay_ms(config::BACKOFF_EXP_CAP as i32);
        assert_eq!(backoff_delay_ms(config::BACKOFF_EXP_CAP as i32 + 5), cap);
    }

    #[test]
    fn backoff_tolerates_negative_attempts() {
        assert_eq!(backoff_delay_ms(-1), *config::BACKOFF_BASE_MS);
    }
}
