//! Poster frame extraction and optional thumbnail obfuscation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use vs_av::classify::classify_transcode_failure;
use vs_av::tools::FFMPEG;
use vs_av::workspace::write_atomic;
use vs_av::{ExecOptions, ProcessRunner, ToolRegistry};
use vs_core::config::ThumbnailConfig;
use vs_core::{Error, Result};

use crate::keys::{xor_in_place, ContentKey};

/// One thumbnail job.
#[derive(Debug, Clone)]
pub struct ThumbnailRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Source duration in seconds; positions the grabbed frame.
    pub duration_secs: f64,
    pub label: Option<String>,
}

#[async_trait]
pub trait ThumbnailGenerator: Send + Sync {
    /// Write a JPEG poster frame to `request.output` and return its path.
    async fn generate(&self, request: ThumbnailRequest) -> Result<PathBuf>;
}

/// Grabs a single scaled frame with ffmpeg.
pub struct FfmpegThumbnailer {
    runner: Arc<ProcessRunner>,
    ffmpeg: Option<PathBuf>,
    config: ThumbnailConfig,
}

impl FfmpegThumbnailer {
    pub fn new(runner: Arc<ProcessRunner>, tools: &ToolRegistry, config: ThumbnailConfig) -> Self {
        Self {
            runner,
            ffmpeg: tools.path(FFMPEG).map(Path::to_path_buf),
            config,
        }
    }

    /// Seek position in seconds for a source of `duration_secs`.
    pub fn seek_position(&self, duration_secs: f64) -> f64 {
        if duration_secs <= 0.0 {
            return 0.0;
        }
        (duration_secs * self.config.seek_fraction.clamp(0.0, 1.0)).min(duration_secs)
    }

    pub fn build_args(&self, request: &ThumbnailRequest) -> Vec<String> {
        vec![
            "-y".into(),
            "-hide_banner".into(),
            "-ss".into(),
            format!("{:.3}", self.seek_position(request.duration_secs)),
            "-i".into(),
            request.input.to_string_lossy().into_owned(),
            "-frames:v".into(),
            "1".into(),
            "-vf".into(),
            format!("scale={}:-2", self.config.width),
            "-q:v".into(),
            "3".into(),
            request.output.to_string_lossy().into_owned(),
        ]
    }
}

#[async_trait]
impl ThumbnailGenerator for FfmpegThumbnailer {
    async fn generate(&self, request: ThumbnailRequest) -> Result<PathBuf> {
        let ffmpeg = self
            .ffmpeg
            .as_deref()
            .ok_or_else(|| Error::TranscodingUnavailable("ffmpeg not found".into()))?;

        let mut opts = ExecOptions::new().timeout(Duration::from_secs(self.config.timeout_secs));
        if let Some(ref label) = request.label {
            opts = opts.label(label.clone());
        }

        self.runner
            .execute(ffmpeg, &self.build_args(&request), &opts)
            .await
            .map_err(|e| classify_transcode_failure(e, "mjpeg"))?;

        match tokio::fs::metadata(&request.output).await {
            Ok(meta) if meta.len() > 0 => Ok(request.output),
            _ => Err(Error::TranscodingFailed(format!(
                "no thumbnail written to {}",
                request.output.display()
            ))),
        }
    }
}

/// XOR the file at `path` with the video key, in place. Applying it twice
/// restores the original. Returns the number of bytes processed.
pub async fn encrypt_thumbnail(path: &Path, key: &ContentKey) -> Result<u64> {
    let mut data = tokio::fs::read(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::not_found("thumbnail", path.display()),
        _ => e.into(),
    })?;
    xor_in_place(&mut data, key, 0);
    write_atomic(path, &data, None).await?;
    Ok(data.len() as u64)
}
