//! seedalchemy_engine - The generation worker
//!
//! This crate provides:
//! - The model cache and its reuse rules
//! - Prompt weighting, seeded noise and the sampling schedulers
//! - The sampling loop shared by every pipeline shape
//! - Stage orchestration with progress, previews and cancellation
//! - Per-client session queues

pub mod cache;
pub mod conditioning;
pub mod dispatch;
pub mod imageops;
pub mod lora;
pub mod noise;
pub mod orchestrator;
pub mod preview;
pub mod prompt;
pub mod schedulers;
pub mod session;

pub use cache::{LoadedPipeline, ModelCache};
pub use orchestrator::{Outcome, Worker};
pub use session::{Session, SessionRegistry, TaskGuard};
