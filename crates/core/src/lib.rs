//! seedalchemy_core - Core library for the generation worker
//!
//! This crate provides:
//! - TOML configuration and storage layout
//! - The model, scheduler and preprocessor registries
//! - Image request types and their validation
//! - PNG metadata embedding and the output store
//! - The session frame codec

pub mod config;
pub mod controlnets;
pub mod error;
pub mod frames;
pub mod metadata;
pub mod processors;
pub mod registry;
pub mod request;
pub mod schedulers;
pub mod storage;

pub use config::Config;
pub use error::GenerationError;
pub use registry::{BaseFamily, ModelInfo, ModelKind, ModelLocation, ModelRegistry};
pub use request::ImageRequest;
pub use storage::OutputStore;
