use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::{Extension, Router};
use serde_json::{json, Value};
use sqlx::PgPool;
use tower::ServiceExt;

fn setup_env() {
    std::env::set_var("JWT_SECRET", "test-secret");
    std::env::set_var(
        "RATE_LIMITS",
        "register=1000,login=1000,refresh=1000,transformations=1000,upload=1000",
    );
}

fn app(pool: &PgPool) -> Router {
    Router::new()
        .merge(remixer::routes::api_routes())
        .layer(Extension(pool.clone()))
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

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn register_login_me_round_trip(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    setup_env();
    let app = app(&pool);

    let (status, body) = send(
        &app,
        "POST",
        "/api/auth/register",
        None,
        Some(json!({"email": "a@x.io", "password": "P@ssw0rd!12"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["user"]["email"], "a@x.io");
    assert_eq!(body["user"]["role"], "owner");

    let (status, body) = send(
        &app,
        "POST",
        "/api/auth/login",
        None,
        Some(json!({"email": "a@x.io", "password": "P@ssw0rd!12"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let access = body["access"].as_str().unwrap().to_string();
    assert!(body["refresh"].as_str().is_some());
    assert!(body["expires_in"].as_i64().unwrap() > 0);

    let (status, body) = send(&app, "GET", "/api/auth/me", Some(&access), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user"]["email"], "a@x.io");
    assert!(body["workspace"]["name"].as_str().is_some());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn duplicate_email_conflicts(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    setup_env();
    let app = app(&pool);
    let payload = json!({"email": "dup@x.io", "password": "P@ssw0rd!12"});
    let (status, _) = send(&app, "POST", "/api/auth/register", None, Some(payload.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = send(&app, "POST", "/api/auth/register", None, Some(payload)).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn weak_password_rejected(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    setup_env();
    let app = app(&pool);
    let (status, _) = send(
        &app,
        "POST",
        "/api/auth/register",
        None,
        Some(json!({"email": "weak@x.io", "password": "short1"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn refresh_rotation_detects_replay_and_revokes_chain(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    setup_env();
    let app = app(&pool);

    send(
        &app,
        "POST",
        "/api/auth/register",
        None,
        Some(json!({"email": "rotate@x.io", "password": "P@ssw0rd!12"})),
    )
    .await;
    let (_, body) = send(
        &app,
        "POST",
        "/api/auth/login",
        None,
        Some(json!({"email": "rotate@x.io", "password": "P@ssw0rd!12"})),
    )
    .await;
    let r0 = body["refresh"].as_str().unwrap().to_string();

    // First rotation succeeds and yields a fresh pair.
    let (status, body) = send(
        &app,
        "POST",
        "/api/auth/refresh",
        None,
        Some(json!({"refresh": r0})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let a1 = body["access"].as_str().unwrap().to_string();
    let r1 = body["refresh"].as_str().unwrap().to_string();
    assert_ne!(r0, r1);

    // Replaying the rotated credential fails and nukes the chain.
    let (status, _) = send(
        &app,
        "POST",
        "/api/auth/refresh",
        None,
        Some(json!({"refresh": r0})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // The legitimate holder's descendants are revoked too.
    let (status, _) = send(&app, "GET", "/api/auth/me", Some(&a1), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = send(
        &app,
        "POST",
        "/api/auth/refresh",
        None,
        Some(json!({"refresh": r1})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn logout_revokes_the_session(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    setup_env();
    let app = app(&pool);

    send(
        &app,
        "POST",
        "/api/auth/register",
        None,
        Some(json!({"email": "bye@x.io", "password": "P@ssw0rd!12"})),
    )
    .await;
    let (_, body) = send(
        &app,
        "POST",
        "/api/auth/login",
        None,
        Some(json!({"email": "bye@x.io", "password": "P@ssw0rd!12"})),
    )
    .await;
    let access = body["access"].as_str().unwrap().to_string();
    let refresh = body["refresh"].as_str().unwrap().to_string();

    let (status, _) = send(&app, "POST", "/api/auth/logout", Some(&access), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&app, "GET", "/api/auth/me", Some(&access), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = send(
        &app,
        "POST",
        "/api/auth/refresh",
        None,
        Some(json!({"refresh": refresh})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn requests_without_credentials_are_rejected(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    setup_env();
    let app = app(&pool);
    let (status, _) = send(&app, "GET", "/api/auth/me", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = send(&app, "GET", "/api/documents", Some("not-a-token"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
