use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use remixer::db::{queue, transformations};
use remixer::extractor::Subject;

async fn seed_subject(pool: &PgPool) -> Subject {
    let workspace_id = Uuid::new_v4();
    let user_id = Uuid::new_v4();
    sqlx::query("INSERT INTO workspaces (id, name) VALUES ($1, 'queue test')")
        .bind(workspace_id)
        .execute(pool)
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO users (id, workspace_id, email, password_hash) VALUES ($1, $2, $3, 'unused')",
    )
    .bind(user_id)
    .bind(workspace_id)
    .bind(format!("{user_id}@test.io"))
    .execute(pool)
    .await
    .unwrap();
    Subject {
        user_id,
        workspace_id,
        role: "owner".into(),
        session_id: Uuid::new_v4(),
    }
}

async fn enqueue_job(pool: &PgPool, subject: &Subject) -> Uuid {
    let id = Uuid::new_v4();
    let mut tx = pool.begin().await.unwrap();
    transformations::create(
        &mut tx,
        subject,
        transformations::NewTransformation {
            id,
            document_id: None,
            kind: "summary".into(),
            parameters: json!({"length": 200}),
        },
    )
    .await
    .unwrap();
    queue::enqueue(&mut tx, subject, id, json!({"kind": "summary"}))
        .await
        .unwrap();
    tx.commit().await.unwrap();
    id
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn claim_is_exclusive(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let subject = seed_subject(&pool).await;
    let id = enqueue_job(&pool, &subject).await;

    let first = queue::claim(&pool, "worker-a", 60).await.unwrap();
    assert_eq!(first.as_ref().map(|t| t.id), Some(id));
    assert_eq!(first.unwrap().attempts, 1);

    // A live lease keeps the task invisible to other workers.
    assert!(queue::claim(&pool, "worker-b", 60).await.unwrap().is_none());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn expired_lease_is_reclaimable(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let subject = seed_subject(&pool).await;
    let id = enqueue_job(&pool, &subject).await;

    queue::claim(&pool, "worker-a", 60).await.unwrap().unwrap();
    sqlx::query("UPDATE queued_tasks SET claim_expires_at = now() - interval '1 second' WHERE id = $1")
        .bind(id)
        .execute(&pool)
        .await
        .unwrap();

    let reclaimed = queue::claim(&pool, "worker-b", 60).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, id);
    assert_eq!(reclaimed.attempts, 2);
    assert_eq!(reclaimed.claim_owner.as_deref(), Some("worker-b"));

    // The dead worker can no longer ack a task it lost.
    assert!(!queue::ack(&pool, id, "worker-a").await.unwrap());
    assert!(queue::ack(&pool, id, "worker-b").await.unwrap());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn claims_follow_not_before_order(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let subject = seed_subject(&pool).await;
    let late = enqueue_job(&pool, &subject).await;
    let early = enqueue_job(&pool, &subject).await;
    sqlx::query("UPDATE queued_tasks SET not_before = now() - interval '10 seconds' WHERE id = $1")
        .bind(early)
        .execute(&pool)
        .await
        .unwrap();

    let first = queue::claim(&pool, "worker", 60).await.unwrap().unwrap();
    assert_eq!(first.id, early);
    let second = queue::claim(&pool, "worker", 60).await.unwrap().unwrap();
    assert_eq!(second.id, late);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn nack_defers_and_releases(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let subject = seed_subject(&pool).await;
    let id = enqueue_job(&pool, &subject).await;

    let task = queue::claim(&pool, "worker", 60).await.unwrap().unwrap();
    assert!(queue::nack(&pool, id, "worker", queue::backoff_delay_ms(task.attempts))
        .await
        .unwrap());

    // Deferred into the future: nothing claimable right now.
    assert!(queue::claim(&pool, "worker", 60).await.unwrap().is_none());
    sqlx::query("UPDATE queued_tasks SET not_before = now() WHERE id = $1")
        .bind(id)
        .execute(&pool)
        .await
        .unwrap();
    let retried = queue::claim(&pool, "worker", 60).await.unwrap().unwrap();
    assert_eq!(retried.id, id);
    assert_eq!(retried.attempts, 2);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn cancel_deletes_unclaimed_and_flags_claimed(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let subject = seed_subject(&pool).await;

    let unclaimed = enqueue_job(&pool, &subject).await;
    assert_eq!(
        queue::cancel(&pool, &subject, unclaimed).await.unwrap(),
        queue::CancelOutcome::Deleted
    );

    let claimed = enqueue_job(&pool, &subject).await;
    queue::claim(&pool, "worker", 60).await.unwrap().unwrap();
    assert_eq!(
        queue::cancel(&pool, &subject, claimed).await.unwrap(),
        queue::CancelOutcome::Flagged
    );
    assert!(queue::cancel_flag(&pool, claimed).await.unwrap());

    assert_eq!(
        queue::cancel(&pool, &subject, Uuid::new_v4()).await.unwrap(),
        queue::CancelOutcome::NotFound
    );
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn cancel_is_workspace_scoped(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let subject = seed_subject(&pool).await;
    let other = seed_subject(&pool).await;
    let id = enqueue_job(&pool, &subject).await;

    assert_eq!(
        queue::cancel(&pool, &other, id).await.unwrap(),
        queue::CancelOutcome::NotFound
    );
    assert!(!queue::cancel_flag(&pool, id).await.unwrap());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn startup_sweep_reaps_terminal_leftovers(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let subject = seed_subject(&pool).await;
    let id = enqueue_job(&pool, &subject).await;

    // Crash window: terminal status written but the ack never happened.
    sqlx::query("UPDATE transformations SET status = 'completed' WHERE id = $1")
        .bind(id)
        .execute(&pool)
        .await
        .unwrap();
    let reaped = queue::reap_terminal(&pool).await.unwrap();
    assert_eq!(reaped, 1);
    assert!(queue::claim(&pool, "worker", 60).await.unwrap().is_none());
}
