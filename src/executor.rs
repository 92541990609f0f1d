use serde_json::json;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

use crate::config;
use crate::db::{documents, queue, transformations as store};
use crate::error::AppResult;
use crate::events::{self, EventKind};
use crate::providers::{ProviderError, ProviderRegistry, ProviderRequest};
use crate::transformations::TransformationKind;

const IDLE_POLL_SECONDS: u64 = 5;
const RESULT_PREVIEW_CHARS: usize = 280;

/// Spawn the worker pool and the queue wake listener.
pub fn start_workers(
    pool: PgPool,
    registry: Arc<ProviderRegistry>,
    shutdown: watch::Receiver<bool>,
) {
    let wake = Arc::new(Notify::new());
    start_wake_listener(pool.clone(), wake.clone());
    for n in 0..*config::WORKER_CONCURRENCY {
        let worker_id = format!("{}/{n}", *config::INSTANCE_ID);
        tokio::spawn(worker_loop(
            pool.clone(),
            registry.clone(),
            wake.clone(),
            shutdown.clone(),
            worker_id,
        ));
    }
}

fn start_wake_listener(pool: PgPool, wake: Arc<Notify>) {
    tokio::spawn(async move {
        loop {
            match PgListener::connect_with(&pool).await {
                Ok(mut listener) => {
                    if let Err(e) = listener.listen(queue::WAKE_CHANNEL).await {
                        tracing::error!(?e, "failed to LISTEN on task wake channel");
                        sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                    while listener.recv().await.is_ok() {
                        wake.notify_waiters();
                    }
                    tracing::warn!("task wake listener lost; reconnecting");
                }
                Err(e) => {
                    tracing::error!(?e, "task wake listener failed to connect");
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });
}

async fn worker_loop(
    pool: PgPool,
    registry: Arc<ProviderRegistry>,
    wake: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
    worker_id: String,
) {
    tracing::info!(%worker_id, "transformation worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        match queue::claim(&pool, &worker_id, *config::CLAIM_LEASE_SECONDS).await {
            Ok(Some(task)) => {
                if let Err(e) = process_claimed(&pool, &registry, &worker_id, &task).await {
                    tracing::error!(?e, task_id = %task.id, %worker_id, "job processing failed");
                }
            }
            Ok(None) => {
                tokio::select! {
                    _ = wake.notified() => {}
                    _ = sleep(Duration::from_secs(IDLE_POLL_SECONDS)) => {}
                    _ = shutdown.changed() => {}
                }
            }
            Err(e) => {
                tracing::error!(?e, %worker_id, "claim failed");
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
    tracing::info!(%worker_id, "transformation worker stopped");
}

/// Run one claimed task to an ack. Public so the double-delivery and
/// failover paths are testable without the worker loop.
pub async fn process_claimed(
    pool: &PgPool,
    registry: &ProviderRegistry,
    worker_id: &str,
    task: &queue::QueuedTask,
) -> AppResult<()> {
    // Idempotency guard: a re-delivered task whose transformation is gone or
    // already terminal is absorbed without side effects.
    let Some(transformation) = store::load(pool, task.id).await? else {
        queue::ack(pool, task.id, worker_id).await?;
        return Ok(());
    };
    if store::is_terminal(&transformation.status) {
        queue::ack(pool, task.id, worker_id).await?;
        return Ok(());
    }
    if queue::cancel_flag(pool, task.id).await? {
        return finish_cancelled(pool, worker_id, task.id, transformation.workspace_id).await;
    }

    let Some(kind) = TransformationKind::parse(&transformation.kind) else {
        // Unreachable from the validated create path.
        store::fail(pool, task.id, "invalid_kind").await?;
        queue::ack(pool, task.id, worker_id).await?;
        return publish_failed(pool, task.id, transformation.workspace_id, "invalid_kind").await;
    };

    if !store::mark_running(pool, task.id, task.attempts).await? {
        queue::ack(pool, task.id, worker_id).await?;
        return Ok(());
    }
    publish_event(
        pool,
        transformation.workspace_id,
        EventKind::TransformationProgress,
        json!({
            "id": task.id,
            "workspace_id": transformation.workspace_id,
            "status": store::STATUS_RUNNING,
            "attempts": task.attempts,
        }),
    )
    .await;

    let source = match transformation.document_id {
        Some(document_id) => {
            documents::load_extracted_text(pool, transformation.workspace_id, document_id).await?
        }
        None => None,
    };
    let request = ProviderRequest {
        kind,
        parameters: transformation.parameters.clone(),
        source,
    };

    let mut deterministic_failure = false;
    for provider in registry.candidates(kind) {
        // Cooperative cancel, polled at least once per provider attempt.
        if queue::cancel_flag(pool, task.id).await? {
            return finish_cancelled(pool, worker_id, task.id, transformation.workspace_id).await;
        }
        let invocation = timeout(
            Duration::from_secs(*config::PROVIDER_TIMEOUT_SECONDS + 5),
            provider.invoke(&request),
        )
        .await
        .unwrap_or_else(|_| Err(ProviderError::Transient("invocation timed out".into())));
        match invocation {
            Ok(output) => {
                registry.record_success(provider.name(), output.tokens_in, output.tokens_out);
                let completed = store::complete(
                    pool,
                    task.id,
                    &output.text,
                    provider.name(),
                    output.tokens_in + output.tokens_out,
                )
                .await?;
                queue::ack(pool, task.id, worker_id).await?;
                if completed {
                    let preview: String = output.text.chars().take(RESULT_PREVIEW_CHARS).collect();
                    publish_event(
                        pool,
                        transformation.workspace_id,
                        EventKind::TransformationCompleted,
                        json!({
                            "id": task.id,
                            "workspace_id": transformation.workspace_id,
                            "status": store::STATUS_COMPLETED,
                            "provider_used": provider.name(),
                            "preview": preview,
                        }),
                    )
                    .await;
                }
                return Ok(());
            }
            Err(ProviderError::Transient(reason)) => {
                tracing::warn!(task_id = %task.id, provider = provider.name(), %reason, "provider attempt failed");
                registry.record_failure(provider.name());
            }
            Err(ProviderError::Deterministic(reason)) => {
                // Job-specific rejection, not provider health: the breaker
                // only steps on transient failures.
                tracing::warn!(task_id = %task.id, provider = provider.name(), %reason, "provider rejected job");
                deterministic_failure = true;
                break;
            }
        }
    }

    if queue::cancel_flag(pool, task.id).await? {
        return finish_cancelled(pool, worker_id, task.id, transformation.workspace_id).await;
    }
    if deterministic_failure {
        store::fail(pool, task.id, "provider_rejected").await?;
        queue::ack(pool, task.id, worker_id).await?;
        return publish_failed(pool, task.id, transformation.workspace_id, "provider_rejected")
            .await;
    }
    if task.attempts < *config::MAX_ATTEMPTS {
        let delay = queue::backoff_delay_ms(task.attempts);
        queue::nack(pool, task.id, worker_id, delay).await?;
        tracing::info!(task_id = %task.id, attempts = task.attempts, delay_ms = delay, "job requeued");
        return Ok(());
    }
    store::fail(pool, task.id, "provider_exhausted").await?;
    queue::ack(pool, task.id, worker_id).await?;
    publish_failed(pool, task.id, transformation.workspace_id, "provider_exhausted").await
}

async fn finish_cancelled(
    pool: &PgPool,
    worker_id: &str,
    task_id: Uuid,
    workspace_id: Uuid,
) -> AppResult<()> {
    store::mark_cancelled(pool, task_id).await?;
    queue::ack(pool, task_id, worker_id).await?;
    publish_event(
        pool,
        workspace_id,
        EventKind::TransformationFailed,
        json!({
            "id": task_id,
            "workspace_id": workspace_id,
            "status": store::STATUS_CANCELLED,
            "reason": "cancelled",
        }),
    )
    .await;
    Ok(())
}

async fn publish_failed(
    pool: &PgPool,
    task_id: Uuid,
    workspace_id: Uuid,
    reason: &str,
) -> AppResult<()> {
    publish_event(
        pool,
        workspace_id,
        EventKind::TransformationFailed,
        json!({
            "id": task_id,
            "workspace_id": workspace_id,
            "status": store::STATUS_FAILED,
            "reason": reason,
        }),
    )
    .await;
    Ok(())
}

async fn publish_event(
    pool: &PgPool,
    workspace_id: Uuid,
    kind: EventKind,
    payload: serde_json::Value,
) {
    if let Err(e) =
        events::publish(pool, events::workspace_topic(workspace_id), kind, payload).await
    {
        tracing::warn!(?e, %workspace_id, "event publish failed");
    }
}
