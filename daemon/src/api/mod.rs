pub mod generate;
pub mod images;
pub mod registry;
pub mod settings;

use axum::{
    routing::{get, post},
    Router,
};
use seedalchemy_core::request::is_safe_component;

use crate::error::ApiError;
use crate::state::AppState;
use std::sync::Arc;

/// The `/api/v1` endpoints.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/cancel", post(generate::cancel))
        .route("/sd-generate", post(generate::sd_generate))
        .route("/controlnet-process", post(generate::controlnet_process))
        .route("/image-delete", post(images::delete))
        .route("/image-move", post(images::move_image))
        .route("/reveal", post(images::reveal))
        .route("/upload", post(images::upload))
        .route("/users", get(registry::users))
        .route("/models", get(registry::models))
        .route("/schedulers", get(registry::schedulers))
        .route("/control_net_processors", get(registry::processors))
        .route("/settings/:user", get(settings::read).put(settings::write))
        .route("/collections/:user", get(images::collections))
        .route("/images/:user/:collection", get(images::list))
        .route("/metadata/:user/*path", get(images::metadata))
}

pub async fn health() -> &'static str {
    "ok"
}

pub(crate) fn check_component(what: &str, value: &str) -> Result<(), ApiError> {
    if is_safe_component(value) {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!("Invalid {}: {:?}", what, value)))
    }
}

/// Validate a collection-relative path and strip a leading slash.
pub(crate) fn check_path(path: &str) -> Result<&str, ApiError> {
    let path = path.trim_start_matches('/');
    if path.split('/').all(is_safe_component) {
        Ok(path)
    } else {
        Err(ApiError::BadRequest(format!("Invalid path: {:?}", path)))
    }
}
