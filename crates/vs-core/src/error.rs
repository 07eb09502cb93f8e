//! Unified error type for the video processing pipeline.
//!
//! Adapters reclassify raw tool failures into the variants below so callers
//! can react to the *kind* of failure. The serving layer derives an HTTP
//! status via [`Error::http_status`] and a stable machine-readable code via
//! [`Error::code`].

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Unified error type covering all failure modes of the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Request data or options failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "workspace", "key").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// The per-video directory tree could not be created.
    #[error("Failed to create workspace at {}: {message}", path.display())]
    WorkspaceCreation {
        /// Directory that could not be created.
        path: PathBuf,
        /// Human-readable error description.
        message: String,
    },

    /// Not enough free disk space to start processing.
    #[error("Insufficient disk space: {required} bytes required, {available} bytes available")]
    InsufficientSpace {
        /// Estimated bytes needed for the job.
        required: u64,
        /// Bytes currently free on the target filesystem.
        available: u64,
    },

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// An external process exited unsuccessfully (or could not be spawned).
    #[error("Process [{command}] failed (exit code {}): {stderr}", exit_code.map_or_else(|| "none".to_string(), |c| c.to_string()))]
    ProcessExecution {
        /// Program name.
        command: String,
        /// Exit code, `None` when the process never ran or was signalled.
        exit_code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// An external process exceeded its timeout and was killed.
    #[error("Process [{command}] timed out after {timeout:?}")]
    ProcessTimeout {
        /// Program name.
        command: String,
        /// The configured timeout.
        timeout: Duration,
    },

    /// The transcoding engine (or a requested hardware encoder) is unusable.
    #[error("Transcoding system unavailable: {0}")]
    TranscodingUnavailable(String),

    /// The transcoding engine failed for an unclassified reason.
    #[error("Transcoding failed: {0}")]
    TranscodingFailed(String),

    /// The engine does not support the requested or source codec.
    #[error("Unsupported video codec [{codec}]: {message}")]
    UnsupportedVideoCodec {
        /// The codec involved.
        codec: String,
        /// Human-readable error description.
        message: String,
    },

    /// The engine ran out of memory, disk or device resources.
    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    /// The segment packager is not installed or not runnable.
    #[error("Packaging system unavailable: {0}")]
    PackagingUnavailable(String),

    /// The packager failed for an unclassified reason.
    #[error("Packaging failed: {0}")]
    PackagingFailed(String),

    /// Key material or encryption parameters were rejected.
    #[error("Encryption setup error: {0}")]
    EncryptionSetup(String),

    /// The manifest could not be written.
    #[error("Manifest creation error: {0}")]
    ManifestCreation(String),

    /// Packaged output failed verification. Carries every failed check.
    #[error("Package validation failed: {}", issues.join("; "))]
    PackageValidation {
        /// One entry per failed check.
        issues: Vec<String>,
    },

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NotFound { .. } => "NOT_FOUND",
            Error::WorkspaceCreation { .. } => "WORKSPACE_CREATION_ERROR",
            Error::InsufficientSpace { .. } => "INSUFFICIENT_SPACE",
            Error::Io { .. } => "IO_ERROR",
            Error::ProcessExecution { .. } => "PROCESS_EXECUTION_ERROR",
            Error::ProcessTimeout { .. } => "PROCESS_TIMEOUT",
            Error::TranscodingUnavailable(_) => "TRANSCODING_SYSTEM_UNAVAILABLE",
            Error::TranscodingFailed(_) => "TRANSCODING_FAILED",
            Error::UnsupportedVideoCodec { .. } => "UNSUPPORTED_VIDEO_CODEC",
            Error::InsufficientResources(_) => "INSUFFICIENT_RESOURCES",
            Error::PackagingUnavailable(_) => "PACKAGING_SYSTEM_UNAVAILABLE",
            Error::PackagingFailed(_) => "PACKAGING_FAILED",
            Error::EncryptionSetup(_) => "ENCRYPTION_SETUP_ERROR",
            Error::ManifestCreation(_) => "MANIFEST_CREATION_ERROR",
            Error::PackageValidation { .. } => "PACKAGE_VALIDATION_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Map this error to an appropriate HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::NotFound { .. } => 404,
            Error::UnsupportedVideoCodec { .. } => 422,
            Error::InsufficientSpace { .. } | Error::InsufficientResources(_) => 507,
            Error::TranscodingUnavailable(_) | Error::PackagingUnavailable(_) => 503,
            Error::ProcessTimeout { .. } => 504,
            Error::ProcessExecution { .. }
            | Error::TranscodingFailed(_)
            | Error::PackagingFailed(_)
            | Error::ManifestCreation(_)
            | Error::PackageValidation { .. } => 502,
            Error::WorkspaceCreation { .. }
            | Error::Io { .. }
            | Error::EncryptionSetup(_)
            | Error::Internal(_) => 500,
        }
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::WorkspaceCreation`].
    pub fn workspace_creation(path: impl Into<PathBuf>, message: impl fmt::Display) -> Self {
        Error::WorkspaceCreation {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Convenience constructor for [`Error::ProcessExecution`].
    pub fn process(
        command: impl Into<String>,
        exit_code: Option<i32>,
        stderr: impl Into<String>,
    ) -> Self {
        Error::ProcessExecution {
            command: command.into(),
            exit_code,
            stderr: stderr.into(),
        }
    }

    /// Captured stderr, when this error came from a failed process.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Error::ProcessExecution { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
