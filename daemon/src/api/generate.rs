use axum::{extract::State, Json};
use seedalchemy_core::request::{CancelRequest, ProcessRequest};
use seedalchemy_core::ImageRequest;
use seedalchemy_engine::{Outcome, Worker};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

use crate::error::ApiError;
use crate::state::AppState;

fn claim_worker(state: &AppState) -> Result<OwnedMutexGuard<Worker>, ApiError> {
    Arc::clone(&state.worker).try_lock_owned().map_err(|_| ApiError::Busy)
}

/// POST /api/v1/cancel
pub async fn cancel(State(state): State<Arc<AppState>>, Json(req): Json<CancelRequest>) -> Json<Value> {
    if !state.sessions.cancel(req.session_id).await {
        tracing::debug!("Cancel for unknown session {}", req.session_id);
    }
    Json(Value::Null)
}

/// POST /api/v1/sd-generate
pub async fn sd_generate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ImageRequest>,
) -> Result<Json<Outcome>, ApiError> {
    let session = match req.session_id {
        Some(id) => state.sessions.get(id).await,
        None => None,
    };
    let mut worker = claim_worker(&state)?;
    let guard = session.as_ref().map(|s| s.track());

    let outcome = tokio::task::spawn_blocking(move || {
        let _guard = guard;
        worker.generate(&req, session.as_deref())
    })
    .await
    .map_err(|e| anyhow::anyhow!("Generation task failed: {}", e))??;

    Ok(Json(outcome))
}

/// POST /api/v1/controlnet-process
pub async fn controlnet_process(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ProcessRequest>,
) -> Result<Json<String>, ApiError> {
    let mut worker = claim_worker(&state)?;

    let path = tokio::task::spawn_blocking(move || worker.process(&req))
        .await
        .map_err(|e| anyhow::anyhow!("Preprocessor task failed: {}", e))??;

    Ok(Json(path))
}
