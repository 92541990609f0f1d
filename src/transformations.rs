use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::{presets, queue, transformations as store};
use crate::error::{AppError, AppResult};
use crate::events::{self, EventKind};
use crate::extractor::Subject;
use crate::rate_limit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformationKind {
    BlogPost,
    SocialMedia,
    EmailSequence,
    Newsletter,
    Summary,
    Custom,
}

impl TransformationKind {
    pub const ALL: [TransformationKind; 6] = [
        TransformationKind::BlogPost,
        TransformationKind::SocialMedia,
        TransformationKind::EmailSequence,
        TransformationKind::Newsletter,
        TransformationKind::Summary,
        TransformationKind::Custom,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TransformationKind::BlogPost => "blog_post",
            TransformationKind::SocialMedia => "social_media",
            TransformationKind::EmailSequence => "email_sequence",
            TransformationKind::Newsletter => "newsletter",
            TransformationKind::Summary => "summary",
            TransformationKind::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

const TONES: [&str; 5] = ["professional", "casual", "academic", "friendly", "persuasive"];
const PLATFORMS: [&str; 4] = ["twitter", "instagram", "linkedin", "facebook"];
const MAX_CUSTOM_INSTRUCTIONS: usize = 4000;

fn check_int_range(key: &str, value: &Value, min: i64, max: i64) -> Result<(), String> {
    match value.as_i64() {
        Some(n) if (min..=max).contains(&n) => Ok(()),
        _ => Err(format!("{key} must be an integer in [{min}, {max}]")),
    }
}

fn check_enum(key: &str, value: &Value, options: &[&str]) -> Result<(), String> {
    match value.as_str() {
        Some(s) if options.contains(&s) => Ok(()),
        _ => Err(format!("{key} must be one of {}", options.join(", "))),
    }
}

fn known_keys(kind: TransformationKind) -> &'static [&'static str] {
    match kind {
        TransformationKind::BlogPost => &["word_count", "tone"],
        TransformationKind::SocialMedia => &["platform", "post_count"],
        TransformationKind::EmailSequence => &["email_count"],
        TransformationKind::Newsletter => &["sections"],
        TransformationKind::Summary => &["length"],
        TransformationKind::Custom => &["custom_instructions"],
    }
}

fn check_value(kind: TransformationKind, key: &str, value: &Value) -> Result<(), String> {
    match (kind, key) {
        (TransformationKind::BlogPost, "word_count") => check_int_range(key, value, 300, 3000),
        (TransformationKind::BlogPost, "tone") => check_enum(key, value, &TONES),
        (TransformationKind::SocialMedia, "platform") => check_enum(key, value, &PLATFORMS),
        (TransformationKind::SocialMedia, "post_count") => check_int_range(key, value, 1, 10),
        (TransformationKind::EmailSequence, "email_count") => check_int_range(key, value, 1, 7),
        (TransformationKind::Newsletter, "sections") => match value.as_array() {
            Some(items) if !items.is_empty() && items.iter().all(Value::is_string) => Ok(()),
            _ => Err("sections must be a non-empty list of strings".into()),
        },
        (TransformationKind::Summary, "length") => check_int_range(key, value, 100, 1000),
        (TransformationKind::Custom, "custom_instructions") => match value.as_str() {
            Some(s) if !s.is_empty() && s.len() <= MAX_CUSTOM_INSTRUCTIONS => Ok(()),
            _ => Err(format!(
                "custom_instructions must be a non-empty string of at most {MAX_CUSTOM_INSTRUCTIONS} characters"
            )),
        },
        _ => Err(format!("unknown parameter {key}")),
    }
}

/// Validate a parameter map for a kind. Unknown keys are always rejected;
/// `require_all` additionally demands every key of the kind be present
/// (applied to the effective map after preset resolution, so a request may
/// legitimately carry a subset when a preset fills the rest).
pub fn validate_parameters(
    kind: TransformationKind,
    parameters: &Value,
    require_all: bool,
) -> Result<(), String> {
    let Some(map) = parameters.as_object() else {
        return Err("parameters must be an object".into());
    };
    for (key, value) in map {
        if !known_keys(kind).contains(&key.as_str()) {
            return Err(format!("unknown parameter {key}"));
        }
        check_value(kind, key, value)?;
    }
    if require_all {
        for key in known_keys(kind) {
            if !map.contains_key(*key) {
                return Err(format!("missing parameter {key}"));
            }
        }
    }
    Ok(())
}

/// Shallow merge: override keys win; nested maps are replaced wholesale.
pub fn merge_parameters(base: &Value, overrides: &Value) -> Value {
    let Some(base_map) = base.as_object() else {
        return overrides.clone();
    };
    let Some(override_map) = overrides.as_object() else {
        return base.clone();
    };
    let mut merged: Map<String, Value> = base_map.clone();
    for (key, value) in override_map {
        merged.insert(key.clone(), value.clone());
    }
    Value::Object(merged)
}

#[derive(Deserialize)]
pub struct CreateTransformationRequest {
    pub document_id: Option<Uuid>,
    pub kind: String,
    #[serde(default)]
    pub parameters: Option<Value>,
    pub preset_id: Option<Uuid>,
}

#[derive(Serialize)]
pub struct TransformationResponse {
    pub transformation: store::Transformation,
}

#[derive(Serialize)]
pub struct TransformationListResponse {
    pub transformations: Vec<store::Transformation>,
    pub count: usize,
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub document_id: Option<Uuid>,
}

/// Create a transformation: validate, resolve the preset, persist `pending`,
/// enqueue, and announce it. The row, its queue entry, and the preset usage
/// bump commit in one transaction.
pub async fn create_transformation(
    Extension(pool): Extension<PgPool>,
    subject: Subject,
    Json(payload): Json<CreateTransformationRequest>,
) -> AppResult<(StatusCode, Json<TransformationResponse>)> {
    rate_limit::check(subject.workspace_id, "transformations")?;
    let kind = TransformationKind::parse(&payload.kind)
        .ok_or_else(|| AppError::BadRequest(format!("unknown transformation kind {}", payload.kind)))?;
    let request_params = payload.parameters.unwrap_or_else(|| json!({}));
    validate_parameters(kind, &request_params, false).map_err(AppError::BadRequest)?;

    if let Some(document_id) = payload.document_id {
        crate::db::documents::get(&pool, &subject, document_id).await?;
    }

    let preset = match payload.preset_id {
        Some(preset_id) => Some(presets::get_accessible(&pool, &subject, preset_id).await?),
        None => None,
    };
    let effective = match &preset {
        Some(preset) => {
            if preset.kind != kind.as_str() {
                return Err(AppError::BadRequest(format!(
                    "preset is for kind {}, request is {}",
                    preset.kind,
                    kind.as_str()
                )));
            }
            merge_parameters(&preset.parameters, &request_params)
        }
        None => request_params,
    };
    validate_parameters(kind, &effective, true).map_err(AppError::BadRequest)?;

    let transformation_id = Uuid::new_v4();
    let mut tx = pool.begin().await?;
    let transformation = store::create(
        &mut tx,
        &subject,
        store::NewTransformation {
            id: transformation_id,
            document_id: payload.document_id,
            kind: kind.as_str().to_string(),
            parameters: effective.clone(),
        },
    )
    .await?;
    queue::enqueue(
        &mut tx,
        &subject,
        transformation_id,
        json!({
            "kind": kind.as_str(),
            "document_id": payload.document_id,
        }),
    )
    .await?;
    if let Some(preset) = &preset {
        presets::increment_usage(&mut tx, &subject, preset.id).await?;
    }
    tx.commit().await?;

    if let Err(e) = events::publish(
        &pool,
        events::workspace_topic(subject.workspace_id),
        EventKind::TransformationStarted,
        json!({
            "id": transformation_id,
            "kind": kind.as_str(),
            "workspace_id": subject.workspace_id,
            "status": store::STATUS_PENDING,
        }),
    )
    .await
    {
        // The job is durably queued; a missed announcement only delays the UI.
        tracing::warn!(?e, %transformation_id, "failed to publish started event");
    }

    Ok((StatusCode::CREATED, Json(TransformationResponse { transformation })))
}

pub async fn list_transformations(
    Extension(pool): Extension<PgPool>,
    subject: Subject,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<TransformationListResponse>> {
    let transformations = store::list(&pool, &subject, query.document_id).await?;
    let count = transformations.len();
    Ok(Json(TransformationListResponse {
        transformations,
        count,
    }))
}

pub async fn get_transformation(
    Extension(pool): Extension<PgPool>,
    subject: Subject,
    Path(id): Path<Uuid>,
) -> AppResult<Json<TransformationResponse>> {
    let transformation = store::get(&pool, &subject, id).await?;
    Ok(Json(TransformationResponse { transformation }))
}

#[derive(Serialize)]
pub struct TransformationStatus {
    pub id: Uuid,
    pub status: String,
    pub attempts: i32,
}

pub async fn get_transformation_status(
    Extension(pool): Extension<PgPool>,
    subject: Subject,
    Path(id): Path<Uuid>,
) -> AppResult<Json<TransformationStatus>> {
    let transformation = store::get(&pool, &subject, id).await?;
    Ok(Json(TransformationStatus {
        id: transformation.id,
        status: transformation.status,
        attempts: transformation.attempts,
    }))
}

/// Cancellation is cooperative: unclaimed tasks are cancelled immediately,
/// claimed ones when the executor next polls the flag. Always 202 once the
/// request is recorded.
pub async fn cancel_transformation(
    Extension(pool): Extension<PgPool>,
    subject: Subject,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let transformation = store::get(&pool, &subject, id).await?;
    if store::is_terminal(&transformation.status) {
        return Err(AppError::Conflict("transformation already finished".into()));
    }
    let outcome = queue::cancel(&pool, &subject, id).await?;
    let cancelled_now = match outcome {
        // No queue row left means no worker can hold a claim: a job parked
        // in its retry backoff is still `running` and must be cancelled here,
        // or nothing ever resumes it.
        queue::CancelOutcome::Deleted | queue::CancelOutcome::NotFound => {
            store::mark_cancelled(&pool, id).await?
        }
        queue::CancelOutcome::Flagged => false,
    };
    if cancelled_now {
        if let Err(e) = events::publish(
            &pool,
            events::workspace_topic(subject.workspace_id),
            EventKind::TransformationFailed,
            json!({
                "id": id,
                "workspace_id": subject.workspace_id,
                "status": store::STATUS_CANCELLED,
                "reason": "cancelled",
            }),
        )
        .await
        {
            tracing::warn!(?e, %id, "failed to publish cancellation event");
        }
    }
    Ok(StatusCode::ACCEPTED)
}

/// Aggregate transformation counters for the workspace. Admin and owner only.
pub async fn workspace_usage(
    Extension(pool): Extension<PgPool>,
    subject: Subject,
) -> AppResult<Json<store::WorkspaceUsage>> {
    if subject.role != "admin" && subject.role != "owner" {
        return Err(AppError::Forbidden);
    }
    let usage = store::workspace_usage(&pool, &subject).await?;
    Ok(Json(usage))
}
