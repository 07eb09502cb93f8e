//! # vs-pipeline
//!
//! The video processing pipeline built on top of `vs-av`.
//!
//! This crate provides:
//!
//! - **[`KeyManager`]** -- deterministic per-video content keys, stored as
//!   `key.bin` in the workspace, plus the XOR transform used for thumbnails.
//! - **[`FfmpegThumbnailer`]** -- poster frame extraction behind the
//!   [`ThumbnailGenerator`] seam.
//! - **[`Orchestrator`]** -- the seven-phase pipeline with per-phase timing,
//!   single best-effort cleanup on failure and an injectable statistics
//!   cache.
//! - **[`SystemRequirements`]** -- tool, disk and GPU availability report.

pub mod error;
pub mod keys;
pub mod orchestrator;
pub mod progress;
pub mod requirements;
pub mod stats;
pub mod thumbnail;

pub use error::OrchestrationError;
pub use keys::{derive_key, xor_transform, ContentKey, KeyManager, KeyMaterial, XorStream};
pub use orchestrator::{
    Components, OrchestrationRequest, OrchestrationResult, Orchestrator, OrchestratorSettings,
};
pub use progress::ProgressSender;
pub use requirements::{DiskStatus, GpuStatus, SystemRequirements};
pub use stats::{Phase, PhaseDurations, ProcessingStatistics};
pub use thumbnail::{FfmpegThumbnailer, ThumbnailGenerator, ThumbnailRequest};
