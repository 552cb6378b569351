//! seedalchemy_daemon - HTTP server for the web front-end
//!
//! This crate provides the daemon server that:
//! - Exposes the `/api/v1` generation, image and settings endpoints
//! - Serves stored images and on-demand thumbnails
//! - Streams progress and preview frames over the `/ws` session bus
//! - Runs one generation at a time on a shared worker

pub mod api;
pub mod error;
pub mod server;
pub mod state;
pub mod ws;

pub use error::ApiError;
pub use server::{router, run_server};
pub use state::AppState;
