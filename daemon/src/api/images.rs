use axum::{
    extract::{Multipart, Path, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use seedalchemy_core::request::{MoveRequest, PathRequest};
use serde_json::Value;
use std::path::Path as FsPath;
use std::process::Command;
use std::sync::Arc;

use super::{check_component, check_path};
use crate::error::ApiError;
use crate::state::AppState;

const IMMUTABLE: &str = "public, max-age=31536000, immutable";

/// POST /api/v1/image-delete
pub async fn delete(State(state): State<Arc<AppState>>, Json(req): Json<PathRequest>) -> Result<Json<Value>, ApiError> {
    check_component("user", &req.user)?;
    let path = check_path(&req.path)?;
    state.store.delete(&req.user, path)?;
    tracing::info!("Deleted {}/{}", req.user, path);
    Ok(Json(Value::Null))
}

/// POST /api/v1/image-move - the new path, or null when the source is gone
pub async fn move_image(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MoveRequest>,
) -> Result<Json<Option<String>>, ApiError> {
    check_component("user", &req.user)?;
    check_component("collection", &req.dst_collection)?;
    let src = check_path(&req.src_path)?;
    let moved = state.store.move_image(&req.user, src, &req.dst_collection)?;
    Ok(Json(moved))
}

fn reveal_command(path: &FsPath) -> Option<Command> {
    if cfg!(target_os = "macos") {
        let mut command = Command::new("open");
        command.arg("-R").arg(path);
        Some(command)
    } else if cfg!(target_os = "windows") {
        let mut command = Command::new("explorer");
        command.arg(format!("/select,{}", path.display()));
        Some(command)
    } else {
        None
    }
}

/// POST /api/v1/reveal - best effort; unsupported platforms do nothing
pub async fn reveal(State(state): State<Arc<AppState>>, Json(req): Json<PathRequest>) -> Result<Json<Value>, ApiError> {
    check_component("user", &req.user)?;
    let full = state.store.image_path(&req.user, check_path(&req.path)?)?;
    match reveal_command(&full) {
        Some(mut command) => {
            if let Err(e) = command.spawn() {
                tracing::warn!("Failed to reveal {}: {}", full.display(), e);
            }
        }
        None => tracing::debug!("Reveal is not supported on this platform"),
    }
    Ok(Json(Value::Null))
}

/// POST /api/v1/upload - multipart `image`, `user` and `collection`
pub async fn upload(State(state): State<Arc<AppState>>, mut multipart: Multipart) -> Result<Json<String>, ApiError> {
    let mut image = None;
    let mut user = None;
    let mut collection = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => image = Some(field.bytes().await.map_err(|e| ApiError::BadRequest(e.to_string()))?),
            "user" => user = Some(field.text().await.map_err(|e| ApiError::BadRequest(e.to_string()))?),
            "collection" => collection = Some(field.text().await.map_err(|e| ApiError::BadRequest(e.to_string()))?),
            other => tracing::debug!("Ignoring upload field {}", other),
        }
    }

    let image = image.ok_or_else(|| ApiError::BadRequest("Missing image field".to_string()))?;
    let user = user.ok_or_else(|| ApiError::BadRequest("Missing user field".to_string()))?;
    let collection = collection.unwrap_or_else(|| "outputs".to_string());
    check_component("user", &user)?;
    check_component("collection", &collection)?;

    let path = state.store.write_image(&user, &collection, &image)?;
    tracing::info!("Uploaded {} bytes to {}/{}", image.len(), user, path);
    Ok(Json(path))
}

/// GET /api/v1/collections/:user
pub async fn collections(State(state): State<Arc<AppState>>, Path(user): Path<String>) -> Result<Json<Vec<String>>, ApiError> {
    check_component("user", &user)?;
    Ok(Json(state.store.collections(&user)?))
}

/// GET /api/v1/images/:user/:collection - newest first
pub async fn list(
    State(state): State<Arc<AppState>>,
    Path((user, collection)): Path<(String, String)>,
) -> Result<Json<Vec<String>>, ApiError> {
    check_component("user", &user)?;
    check_component("collection", &collection)?;
    Ok(Json(state.store.images(&user, &collection)?))
}

/// GET /api/v1/metadata/:user/*path
pub async fn metadata(
    State(state): State<Arc<AppState>>,
    Path((user, path)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    check_component("user", &user)?;
    Ok(Json(state.store.metadata(&user, check_path(&path)?)?))
}

fn content_type(path: &FsPath) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match extension.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        _ => "application/octet-stream",
    }
}

async fn serve_file(path: &FsPath, content_type: &'static str) -> Result<Response, ApiError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(ApiError::NotFound),
        Err(e) => return Err(anyhow::Error::from(e).into()),
    };
    let headers = [(header::CONTENT_TYPE, content_type), (header::CACHE_CONTROL, IMMUTABLE)];
    Ok((headers, bytes).into_response())
}

/// GET /images/:user/*path
pub async fn serve_image(
    State(state): State<Arc<AppState>>,
    Path((user, path)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    check_component("user", &user)?;
    let full = state.store.image_path(&user, check_path(&path)?)?;
    serve_file(&full, content_type(&full)).await
}

/// GET /thumbnails/:user/*path - WebP, generated on first request
pub async fn serve_thumbnail(
    State(state): State<Arc<AppState>>,
    Path((user, path)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    check_component("user", &user)?;
    let path = check_path(&path)?.to_string();
    let store = state.store.clone();

    let thumbnail = tokio::task::spawn_blocking(move || store.thumbnail(&user, &path))
        .await
        .map_err(|e| anyhow::anyhow!("Thumbnail task failed: {}", e))??;

    match thumbnail {
        Some(full) => serve_file(&full, "image/webp").await,
        None => Err(ApiError::NotFound),
    }
}
