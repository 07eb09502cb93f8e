//! # vs-av
//!
//! External tool orchestration for the vaultstream pipeline.
//!
//! This crate provides:
//!
//! - **Process execution** ([`ProcessRunner`]) -- async subprocess runner with
//!   timeout, output capture, streaming progress and label-keyed kill.
//! - **Progress parsing** ([`progress`]) -- best-effort extraction of
//!   percentage, frame, fps, time, speed and ETA from tool output.
//! - **Tool discovery** ([`ToolRegistry`]) -- find ffmpeg, ffprobe, the Shaka
//!   packager and nvidia-smi.
//! - **Encoding model** ([`encoding`]) -- tagged encoding options, bitrate
//!   ladder, options derived from a [`VideoAnalysis`].
//! - **Transcoding** ([`Transcoder`]) -- ffmpeg command construction,
//!   hardware encoder probing and two-pass encoding.
//! - **Packaging** ([`Packager`]) -- DASH segmentation, raw-key encryption
//!   and output verification.
//! - **Workspaces** ([`WorkspaceManager`]) -- per-video directory trees,
//!   disk-space preflight and cleanup.

pub mod classify;
pub mod command;
pub mod encoding;
pub mod package;
pub mod progress;
pub mod tools;
pub mod transcode;
pub mod workspace;

// ---- Re-exports for convenience ----

pub use command::{ExecOptions, ProcessOutput, ProcessRunner};
pub use encoding::{
    AudioSettings, EncodingOptions, EnhancedOptions, LegacyEncoder, LegacyOptions, QualityParam,
    RateControl, VideoAnalysis,
};
pub use package::{
    validate_packaged_video, EncryptionConfig, EncryptionScheme, PackageRequest, PackageResult,
    PackageValidation, Packager, VideoPackager,
};
pub use progress::{ProgressCallback, ProgressUpdate};
pub use tools::{ToolInfo, ToolRegistry};
pub use transcode::{
    EncoderAvailability, EncoderProber, FfmpegEncoderProber, TranscodeRequest, TranscodeResult,
    Transcoder, VideoTranscoder,
};
pub use workspace::{CleanupReport, DiskUsage, SpaceCheck, Workspace, WorkspaceManager};
