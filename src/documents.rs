use axum::{
    extract::{Extension, Multipart, Path},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use crate::blob_store::{self, BlobStore};
use crate::config;
use crate::db::documents as store;
use crate::error::{AppError, AppResult};
use crate::extract::{ContentExtractor, ExtractError};
use crate::extractor::Subject;
use crate::rate_limit;

const ALLOWED_CONTENT_TYPES: [&str; 4] = [
    "text/plain",
    "text/markdown",
    "application/pdf",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
];

#[derive(Serialize)]
pub struct DocumentResponse {
    pub document: store::Document,
}

#[derive(Serialize)]
pub struct DocumentListResponse {
    pub documents: Vec<store::Document>,
    pub count: usize,
}

struct UploadFields {
    title: Option<String>,
    description: Option<String>,
    filename: Option<String>,
    content_type: Option<String>,
    bytes: Option<Vec<u8>>,
}

async fn read_multipart(multipart: &mut Multipart) -> AppResult<UploadFields> {
    let mut fields = UploadFields {
        title: None,
        description: None,
        filename: None,
        content_type: None,
        bytes: None,
    };
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        error!(?e, "failed reading multipart field");
        AppError::BadRequest("malformed multipart body".into())
    })? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                fields.filename = field.file_name().map(|s| s.to_string());
                fields.content_type = field.content_type().map(|s| s.to_string());
                let data = field.bytes().await.map_err(|e| {
                    error!(?e, "failed reading upload body");
                    AppError::BadRequest("failed to read uploaded file".into())
                })?;
                fields.bytes = Some(data.to_vec());
            }
            "title" => {
                fields.title = field.text().await.ok().map(|s| s.trim().to_string());
            }
            "description" => {
                fields.description = field.text().await.ok().map(|s| s.trim().to_string());
            }
            _ => {}
        }
    }
    Ok(fields)
}

pub async fn upload_document(
    Extension(pool): Extension<PgPool>,
    Extension(blobs): Extension<Arc<dyn BlobStore>>,
    Extension(extractor): Extension<Arc<dyn ContentExtractor>>,
    subject: Subject,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<DocumentResponse>)> {
    rate_limit::check(subject.workspace_id, "upload")?;
    let fields = read_multipart(&mut multipart).await?;

    let Some(bytes) = fields.bytes else {
        return Err(AppError::BadRequest("file field is required".into()));
    };
    if bytes.is_empty() {
        return Err(AppError::BadRequest("uploaded file is empty".into()));
    }
    if bytes.len() > *config::MAX_UPLOAD_BYTES {
        return Err(AppError::BadRequest(format!(
            "file exceeds the {} byte limit",
            *config::MAX_UPLOAD_BYTES
        )));
    }
    let filename = fields
        .filename
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "upload.txt".to_string());
    let content_type = fields
        .content_type
        .unwrap_or_else(|| "text/plain".to_string());
    if !ALLOWED_CONTENT_TYPES.contains(&content_type.as_str()) {
        return Err(AppError::BadRequest(format!(
            "unsupported content type {content_type}"
        )));
    }
    let title = match fields.title.filter(|s| !s.is_empty()) {
        Some(title) => title,
        None => return Err(AppError::BadRequest("title is required".into())),
    };

    let content_hash = blob_store::content_hash(&bytes);
    let blob_ref = blobs.put(&bytes).await.map_err(|e| {
        error!(?e, "blob store write failed");
        AppError::Unavailable("document storage unavailable".into())
    })?;

    let (status, error_reason, extracted_text) =
        match extractor.extract(&content_type, &bytes) {
            Ok(text) => (store::STATUS_READY, None, Some(text)),
            Err(ExtractError::Unsupported(_)) => (
                store::STATUS_FAILED,
                Some("extraction_unsupported".to_string()),
                None,
            ),
            Err(ExtractError::InvalidText) => (
                store::STATUS_FAILED,
                Some("extraction_failed".to_string()),
                None,
            ),
        };

    let document = store::create(
        &pool,
        &subject,
        store::NewDocument {
            title,
            description: fields.description.filter(|s| !s.is_empty()),
            original_filename: filename,
            content_type,
            blob_ref,
            content_hash,
            status: status.to_string(),
            error_reason,
            extracted_text,
        },
    )
    .await?;

    Ok((StatusCode::CREATED, Json(DocumentResponse { document })))
}

pub async fn list_documents(
    Extension(pool): Extension<PgPool>,
    subject: Subject,
) -> AppResult<Json<DocumentListResponse>> {
    let documents = store::list(&pool, &subject).await?;
    let count = documents.len();
    Ok(Json(DocumentListResponse { documents, count }))
}

pub async fn get_document(
    Extension(pool): Extension<PgPool>,
    subject: Subject,
    Path(id): Path<Uuid>,
) -> AppResult<Json<DocumentResponse>> {
    let document = store::get(&pool, &subject, id).await?;
    Ok(Json(DocumentResponse { document }))
}

pub async fn delete_document(
    Extension(pool): Extension<PgPool>,
    subject: Subject,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    store::soft_delete(&pool, &subject, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
