use axum::{
    body::Bytes,
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;

use super::check_component;
use crate::error::ApiError;
use crate::state::AppState;

/// GET /api/v1/settings/:user - the stored document, or `{}`
pub async fn read(State(state): State<Arc<AppState>>, Path(user): Path<String>) -> Result<Response, ApiError> {
    check_component("user", &user)?;
    match state.store.read_settings(&user)? {
        Some(bytes) => Ok(([(header::CONTENT_TYPE, "application/json")], bytes).into_response()),
        None => Ok(Json(json!({})).into_response()),
    }
}

/// PUT /api/v1/settings/:user - stores the body as-is
pub async fn write(
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    check_component("user", &user)?;
    state.store.write_settings(&user, &body)?;
    Ok(Json(Value::Null))
}
