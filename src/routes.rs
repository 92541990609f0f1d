use axum::{
    routing::{delete, get, patch, post},
    Router,
};

use crate::{auth, documents, presets, transformations, ws};

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/refresh", post(auth::refresh))
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/auth/me", get(auth::me))
        .route("/api/documents/upload", post(documents::upload_document))
        .route("/api/documents", get(documents::list_documents))
        .route(
            "/api/documents/:id",
            get(documents::get_document).delete(documents::delete_document),
        )
        .route(
            "/api/transformations",
            get(transformations::list_transformations)
                .post(transformations::create_transformation),
        )
        .route(
            "/api/transformations/:id",
            get(transformations::get_transformation),
        )
        .route(
            "/api/transformations/:id/status",
            get(transformations::get_transformation_status),
        )
        .route(
            "/api/transformations/:id/cancel",
            post(transformations::cancel_transformation),
        )
        .route(
            "/api/transformation-presets",
            get(presets::list_presets).post(presets::create_preset),
        )
        .route(
            "/api/transformation-presets/:id",
            patch(presets::update_preset).delete(presets::delete_preset),
        )
        .route("/api/workspace/usage", get(transformations::workspace_usage))
        .route("/ws", get(ws::ws_endpoint))
}
