use anyhow::Result;
use axum::{routing::get, Router};
use seedalchemy_core::Config;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api;
use crate::state::AppState;
use crate::ws;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api/v1", api::routes())
        .route("/images/:user/*path", get(api::images::serve_image))
        .route("/thumbnails/:user/*path", get(api::images::serve_thumbnail))
        .route("/health", get(api::health))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

pub async fn run_server(config: Config, addr: SocketAddr) -> Result<()> {
    let state = Arc::new(AppState::new(config)?);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = router(state).layer(cors).layer(TraceLayer::new_for_http());

    tracing::info!("Starting daemon on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
