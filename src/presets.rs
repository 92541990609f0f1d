use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::presets as store;
use crate::error::{AppError, AppResult};
use crate::extractor::Subject;
use crate::transformations::{validate_parameters, TransformationKind};

#[derive(Deserialize)]
pub struct PresetCreate {
    pub name: String,
    pub description: Option<String>,
    pub kind: String,
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub is_shared: bool,
}

#[derive(Deserialize)]
pub struct PresetUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub parameters: Option<Value>,
    pub is_shared: Option<bool>,
}

#[derive(Serialize)]
pub struct PresetResponse {
    pub preset: store::Preset,
}

#[derive(Serialize)]
pub struct PresetListResponse {
    pub presets: Vec<store::Preset>,
    pub count: usize,
}

pub async fn create_preset(
    Extension(pool): Extension<PgPool>,
    subject: Subject,
    Json(payload): Json<PresetCreate>,
) -> AppResult<(StatusCode, Json<PresetResponse>)> {
    let name = payload.name.trim().to_string();
    if name.is_empty() {
        return Err(AppError::BadRequest("name is required".into()));
    }
    let kind = TransformationKind::parse(&payload.kind)
        .ok_or_else(|| AppError::BadRequest(format!("unknown transformation kind {}", payload.kind)))?;
    let parameters = payload.parameters.unwrap_or_else(|| json!({}));
    // Presets may hold a subset of a kind's parameters; the remainder comes
    // from the request at transformation time.
    validate_parameters(kind, &parameters, false).map_err(AppError::BadRequest)?;

    let preset = store::create(
        &pool,
        &subject,
        store::NewPreset {
            name,
            description: payload.description.filter(|s| !s.trim().is_empty()),
            kind: kind.as_str().to_string(),
            parameters,
            is_shared: payload.is_shared,
        },
    )
    .await?;
    Ok((StatusCode::CREATED, Json(PresetResponse { preset })))
}

pub async fn list_presets(
    Extension(pool): Extension<PgPool>,
    subject: Subject,
) -> AppResult<Json<PresetListResponse>> {
    let presets = store::list_accessible(&pool, &subject).await?;
    let count = presets.len();
    Ok(Json(PresetListResponse { presets, count }))
}

pub async fn update_preset(
    Extension(pool): Extension<PgPool>,
    subject: Subject,
    Path(id): Path<Uuid>,
    Json(payload): Json<PresetUpdate>,
) -> AppResult<Json<PresetResponse>> {
    if let Some(parameters) = &payload.parameters {
        let current = store::get_accessible(&pool, &subject, id).await?;
        let kind = TransformationKind::parse(&current.kind)
            .ok_or_else(|| AppError::Message("stored preset kind unparseable".into()))?;
        validate_parameters(kind, parameters, false).map_err(AppError::BadRequest)?;
    }
    if let Some(name) = &payload.name {
        if name.trim().is_empty() {
            return Err(AppError::BadRequest("name must not be empty".into()));
        }
    }
    let preset = store::update(
        &pool,
        &subject,
        id,
        store::PresetChanges {
            name: payload.name.map(|s| s.trim().to_string()),
            description: payload.description,
            parameters: payload.parameters,
            is_shared: payload.is_shared,
        },
    )
    .await?;
    Ok(Json(PresetResponse { preset }))
}

pub async fn delete_preset(
    Extension(pool): Extension<PgPool>,
    subject: Subject,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    store::delete(&pool, &subject, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
