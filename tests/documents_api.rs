use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::{Extension, Router};
use serde_json::{json, Value};
use sqlx::PgPool;
use std::sync::Arc;
use tower::ServiceExt;

use remixer::blob_store::{BlobStore, FsBlobStore};
use remixer::extract::{ContentExtractor, PlainTextExtractor};

const BOUNDARY: &str = "X-REMIXER-TEST-BOUNDARY";

fn setup_env() {
    std::env::set_var("JWT_SECRET", "test-secret");
    std::env::set_var(
        "RATE_LIMITS",
        "register=1000,login=1000,refresh=1000,transformations=1000,upload=1000",
    );
}

fn app(pool: &PgPool, blob_root: &std::path::Path) -> Router {
    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(blob_root));
    let extractor: Arc<dyn ContentExtractor> = Arc::new(PlainTextExtractor);
    Router::new()
        .merge(remixer::routes::api_routes())
        .layer(Extension(pool.clone()))
        .layer(Extension(blobs))
        .layer(Extension(extractor))
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("Authorization", format!("Bearer {token}"));
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn login(app: &Router, email: &str) -> String {
    send(
        app,
        "POST",
        "/api/auth/register",
        None,
        Some(json!({"email": email, "password": "P@ssw0rd!12"})),
    )
    .await;
    let (_, body) = send(
        app,
        "POST",
        "/api/auth/login",
        None,
        Some(json!({"email": email, "password": "P@ssw0rd!12"})),
    )
    .await;
    body["access"].as_str().unwrap().to_string()
}

fn multipart_body(title: &str, filename: &str, content_type: &str, content: &str) -> String {
    format!(
        "--{BOUNDARY}\r\n\
         Content-Disposition: form-data; name=\"title\"\r\n\r\n\
         {title}\r\n\
         --{BOUNDARY}\r\n\
         Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
         Content-Type: {content_type}\r\n\r\n\
         {content}\r\n\
         --{BOUNDARY}--\r\n"
    )
}

async fn upload(
    app: &Router,
    token: &str,
    title: &str,
    content_type: &str,
    content: &str,
) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri("/api/documents/upload")
        .header("Authorization", format!("Bearer {token}"))
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(
            title,
            "note.txt",
            content_type,
            content,
        )))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn upload_list_get_delete_cycle(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    setup_env();
    let dir = tempfile::tempdir().unwrap();
    let app = app(&pool, dir.path());
    let token = login(&app, "docs@x.io").await;

    let (status, body) = upload(&app, &token, "Launch notes", "text/plain", "ship it").await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["document"]["title"], "Launch notes");
    assert_eq!(body["document"]["status"], "ready");
    assert_eq!(body["document"]["content_type"], "text/plain");
    let id = body["document"]["id"].as_str().unwrap().to_string();
    let blob_ref = body["document"]["blob_ref"].as_str().unwrap().to_string();
    assert_eq!(blob_ref, body["document"]["content_hash"].as_str().unwrap());

    let (status, body) = send(&app, "GET", "/api/documents", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);

    let (status, _) = send(&app, "GET", &format!("/api/documents/{id}"), Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &app,
        "DELETE",
        &format!("/api/documents/{id}"),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, "GET", &format!("/api/documents/{id}"), Some(&token), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn documents_are_invisible_across_workspaces(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    setup_env();
    let dir = tempfile::tempdir().unwrap();
    let app = app(&pool, dir.path());
    let alice = login(&app, "wa@x.io").await;
    let bob = login(&app, "wb@x.io").await;

    let (_, body) = upload(&app, &alice, "Private", "text/plain", "secret plans").await;
    let id = body["document"]["id"].as_str().unwrap().to_string();

    let (status, _) = send(&app, "GET", &format!("/api/documents/{id}"), Some(&bob), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(
        &app,
        "DELETE",
        &format!("/api/documents/{id}"),
        Some(&bob),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, "GET", &format!("/api/documents/{id}"), Some(&alice), None).await;
    assert_eq!(status, StatusCode::OK);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn binary_upload_is_stored_but_marked_failed(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    setup_env();
    let dir = tempfile::tempdir().unwrap();
    let app = app(&pool, dir.path());
    let token = login(&app, "pdf@x.io").await;

    let (status, body) = upload(&app, &token, "Paper", "application/pdf", "%PDF-1.7 fake").await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["document"]["status"], "failed");
    assert_eq!(body["document"]["error_reason"], "extraction_unsupported");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn missing_title_rejected(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    setup_env();
    let dir = tempfile::tempdir().unwrap();
    let app = app(&pool, dir.path());
    let token = login(&app, "notitle@x.io").await;

    let body = format!(
        "--{BOUNDARY}\r\n\
         Content-Disposition: form-data; name=\"file\"; filename=\"note.txt\"\r\n\
         Content-Type: text/plain\r\n\r\n\
         content\r\n\
         --{BOUNDARY}--\r\n"
    );
    let request = Request::builder()
        .method("POST")
        .uri("/api/documents/upload")
        .header("Authorization", format!("Bearer {token}"))
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
