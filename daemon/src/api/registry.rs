use axum::{extract::State, Json};
use seedalchemy_core::{processors, schedulers};
use std::sync::Arc;

use crate::state::AppState;

/// GET /api/v1/users
pub async fn users(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.config.storage.users.clone())
}

/// GET /api/v1/models - `[type, base, name]` rows sorted by type, then base,
/// then name
pub async fn models(State(state): State<Arc<AppState>>) -> Json<Vec<(String, String, String)>> {
    let rows = state
        .registry
        .list()
        .into_iter()
        .map(|row| (row.kind, row.base, row.name))
        .collect();
    Json(rows)
}

/// GET /api/v1/schedulers
pub async fn schedulers() -> Json<Vec<&'static str>> {
    let mut ids = schedulers::ids().to_vec();
    ids.sort_unstable();
    Json(ids)
}

/// GET /api/v1/control_net_processors
pub async fn processors() -> Json<Vec<&'static str>> {
    let mut names = processors::names().to_vec();
    names.sort_unstable();
    Json(names)
}
