//! Packaging adapter: DASH segmentation and raw-key encryption with the
//! Shaka packager.
//!
//! Output is verified on disk before a run is reported as successful; the
//! packager's exit status alone is not trusted.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use vs_core::config::PackagingConfig;
use vs_core::{Error, Result};

use crate::classify::classify_package_failure;
use crate::command::{ExecOptions, ProcessRunner};
use crate::progress::ProgressCallback;
use crate::tools::{ToolRegistry, PACKAGER};
use crate::workspace::Workspace;

const INIT_SEGMENT: &str = "init.mp4";
const SEGMENT_TEMPLATE: &str = "segment-$Number$.m4s";
const KEY_LEN: usize = 16;

/// Common Encryption scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionScheme {
    Cenc,
    Cbcs,
    None,
}

impl EncryptionScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            EncryptionScheme::Cenc => "cenc",
            EncryptionScheme::Cbcs => "cbcs",
            EncryptionScheme::None => "none",
        }
    }
}

impl fmt::Display for EncryptionScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncryptionScheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cenc" => Ok(EncryptionScheme::Cenc),
            "cbcs" => Ok(EncryptionScheme::Cbcs),
            "none" => Ok(EncryptionScheme::None),
            other => Err(Error::Validation(format!(
                "unknown encryption scheme {other:?} (expected cenc, cbcs or none)"
            ))),
        }
    }
}

/// Key material handed to the packager. Hex strings, 16 bytes each.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub scheme: EncryptionScheme,
    pub key: String,
    pub key_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drm_label: Option<String>,
}

impl EncryptionConfig {
    pub fn new(
        scheme: EncryptionScheme,
        key: &[u8; KEY_LEN],
        key_id: &[u8; KEY_LEN],
        drm_label: Option<String>,
    ) -> Self {
        Self {
            scheme,
            key: hex::encode(key),
            key_id: hex::encode(key_id),
            drm_label,
        }
    }

    /// Clear-text output.
    pub fn none() -> Self {
        Self {
            scheme: EncryptionScheme::None,
            key: String::new(),
            key_id: String::new(),
            drm_label: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.scheme != EncryptionScheme::None
    }

    /// Check key material before anything is spawned.
    pub fn validate(&self) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        check_hex16("key", &self.key)?;
        check_hex16("key_id", &self.key_id)?;
        if let Some(ref label) = self.drm_label {
            let ok = !label.is_empty()
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
            if !ok {
                return Err(Error::EncryptionSetup(format!("invalid DRM label {label:?}")));
            }
        }
        Ok(())
    }

    /// `--keys` value: `[label=<l>:]key_id=<kid>:key=<key>`.
    fn keys_arg(&self) -> String {
        let mut spec = String::new();
        if let Some(ref label) = self.drm_label {
            spec.push_str(&format!("label={label}:"));
        }
        spec.push_str(&format!("key_id={}:key={}", self.key_id, self.key));
        spec
    }
}

fn check_hex16(what: &str, value: &str) -> Result<()> {
    let bytes = hex::decode(value)
        .map_err(|e| Error::EncryptionSetup(format!("{what} is not valid hex: {e}")))?;
    if bytes.len() != KEY_LEN {
        return Err(Error::EncryptionSetup(format!(
            "{what} must be {KEY_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(())
}

/// One packaging job.
#[derive(Clone)]
pub struct PackageRequest {
    /// The transcoded intermediate file.
    pub input: PathBuf,
    pub workspace: Workspace,
    pub encryption: EncryptionConfig,
    /// Seconds.
    pub segment_duration: u32,
    pub static_live_manifest: bool,
    pub label: Option<String>,
    pub progress: Option<ProgressCallback>,
}

impl PackageRequest {
    /// Request for `input` using the packaging defaults from `config`.
    pub fn new(
        input: impl Into<PathBuf>,
        workspace: Workspace,
        encryption: EncryptionConfig,
        config: &PackagingConfig,
    ) -> Self {
        Self {
            input: input.into(),
            workspace,
            encryption,
            segment_duration: config.segment_duration_secs,
            static_live_manifest: config.static_live_manifest,
            label: None,
            progress: None,
        }
    }
}

/// Files written by a successful packager run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageResult {
    /// The DASH manifest (`manifest.mpd`).
    pub manifest_path: PathBuf,
    /// Video media segments in segment-number order.
    pub video_segments: Vec<PathBuf>,
    /// Audio media segments in segment-number order.
    pub audio_segments: Vec<PathBuf>,
    /// Video initialization segment.
    pub video_init_segment: PathBuf,
    /// Audio initialization segment.
    pub audio_init_segment: PathBuf,
    /// Media segments across both streams.
    pub segment_count: usize,
    /// Wall-clock time of the packager run.
    pub duration: Duration,
}

/// Outcome of checking packaged output on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PackageValidation {
    pub is_valid: bool,
    pub manifest_valid: bool,
    pub key_valid: bool,
    pub video_valid: bool,
    pub audio_valid: bool,
    pub video_segment_count: usize,
    pub audio_segment_count: usize,
    /// One entry per failed check.
    pub issues: Vec<String>,
}

/// Build the packager argument list.
pub fn build_package_args(request: &PackageRequest) -> Vec<String> {
    let ws = &request.workspace;
    let input = request.input.to_string_lossy();
    let drm_label = request
        .encryption
        .drm_label
        .as_deref()
        .filter(|_| request.encryption.is_enabled());

    let descriptor = |stream: &str, dir: &Path| {
        let mut spec = format!(
            "in={input},stream={stream},init_segment={},segment_template={}",
            dir.join(INIT_SEGMENT).display(),
            dir.join(SEGMENT_TEMPLATE).display(),
        );
        if let Some(label) = drm_label {
            spec.push_str(&format!(",drm_label={label}"));
        }
        spec
    };

    let mut args = vec![
        descriptor("video", &ws.video_seg_dir),
        descriptor("audio", &ws.audio_seg_dir),
    ];

    if request.encryption.is_enabled() {
        args.extend([
            "--enable_raw_key_encryption".to_string(),
            "--protection_scheme".to_string(),
            request.encryption.scheme.to_string(),
            "--keys".to_string(),
            request.encryption.keys_arg(),
        ]);
    }

    args.extend([
        "--mpd_output".to_string(),
        ws.manifest_path.to_string_lossy().into_owned(),
        "--segment_duration".to_string(),
        request.segment_duration.to_string(),
    ]);
    if request.static_live_manifest {
        args.push("--generate_static_live_mpd".to_string());
    }
    args
}

/// Check a packaged workspace. Every check runs; all failures are listed.
pub async fn validate_packaged_video(ws: &Workspace, encrypted: bool) -> PackageValidation {
    let mut v = PackageValidation::default();

    match tokio::fs::read_to_string(&ws.manifest_path).await {
        Ok(text) => {
            let has_open = text.contains("<MPD");
            let has_close = text.contains("</MPD>");
            v.manifest_valid = has_open && has_close;
            if !has_open {
                v.issues.push("manifest is missing the <MPD> root element".into());
            }
            if !has_close {
                v.issues.push("manifest is missing the closing </MPD> tag".into());
            }
        }
        Err(e) => v
            .issues
            .push(format!("manifest unreadable at {}: {e}", ws.manifest_path.display())),
    }

    v.key_valid = if encrypted {
        match tokio::fs::metadata(&ws.key_path).await {
            Ok(meta) if meta.len() == KEY_LEN as u64 => true,
            Ok(meta) => {
                v.issues.push(format!(
                    "key file must be {KEY_LEN} bytes, found {}",
                    meta.len()
                ));
                false
            }
            Err(_) => {
                v.issues
                    .push(format!("key file missing at {}", ws.key_path.display()));
                false
            }
        }
    } else {
        true
    };

    let (video_valid, video_segments) =
        check_stream("video", &ws.video_seg_dir, &mut v.issues).await;
    let (audio_valid, audio_segments) =
        check_stream("audio", &ws.audio_seg_dir, &mut v.issues).await;
    v.video_valid = video_valid;
    v.audio_valid = audio_valid;
    v.video_segment_count = video_segments.len();
    v.audio_segment_count = audio_segments.len();

    v.is_valid = v.manifest_valid && v.key_valid && v.video_valid && v.audio_valid;
    v
}

async fn check_stream(stream: &str, dir: &Path, issues: &mut Vec<String>) -> (bool, Vec<PathBuf>) {
    let init_ok = tokio::fs::metadata(dir.join(INIT_SEGMENT))
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);
    if !init_ok {
        issues.push(format!("{stream} init segment missing"));
    }
    let segments = media_segments(dir).await;
    if segments.is_empty() {
        issues.push(format!("no {stream} media segments"));
    }
    (init_ok && !segments.is_empty(), segments)
}

/// `segment-<n>.m4s` files in `dir`, ordered by segment number.
async fn media_segments(dir: &Path) -> Vec<PathBuf> {
    let mut found: Vec<(u64, PathBuf)> = Vec::new();
    let Ok(mut rd) = tokio::fs::read_dir(dir).await else {
        return Vec::new();
    };
    while let Ok(Some(entry)) = rd.next_entry().await {
        let name = entry.file_name();
        let Some(n) = name
            .to_str()
            .and_then(|n| n.strip_prefix("segment-"))
            .and_then(|n| n.strip_suffix(".m4s"))
            .and_then(|n| n.parse::<u64>().ok())
        else {
            continue;
        };
        found.push((n, entry.path()));
    }
    found.sort();
    found.into_iter().map(|(_, p)| p).collect()
}

/// Seam between the orchestrator and the packager implementation.
#[async_trait]
pub trait VideoPackager: Send + Sync {
    async fn package(&self, request: PackageRequest) -> Result<PackageResult>;
}

/// Shaka packager-backed [`VideoPackager`].
pub struct Packager {
    runner: Arc<ProcessRunner>,
    packager: Option<PathBuf>,
    timeout: Duration,
}

impl Packager {
    pub fn new(runner: Arc<ProcessRunner>, tools: &ToolRegistry, config: &PackagingConfig) -> Self {
        Self {
            runner,
            packager: tools.path(PACKAGER).map(Path::to_path_buf),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

#[async_trait]
impl VideoPackager for Packager {
    async fn package(&self, request: PackageRequest) -> Result<PackageResult> {
        let packager = self
            .packager
            .as_deref()
            .ok_or_else(|| Error::PackagingUnavailable("packager not found".into()))?;

        request.encryption.validate()?;
        if request.segment_duration == 0 {
            return Err(Error::Validation("segment duration must be positive".into()));
        }
        if !tokio::fs::try_exists(&request.input).await.unwrap_or(false) {
            return Err(Error::not_found("packaging input", request.input.display()));
        }

        let args = build_package_args(&request);
        let ws = &request.workspace;
        tracing::info!(
            video_id = %ws.video_id,
            scheme = %request.encryption.scheme,
            segment_duration = request.segment_duration,
            "Starting packaging"
        );

        let mut opts = ExecOptions::new().timeout(self.timeout);
        if let Some(ref label) = request.label {
            opts = opts.label(label.clone());
        }

        let started = Instant::now();
        let run = match request.progress {
            Some(ref callback) => {
                self.runner
                    .execute_with_streaming(packager, &args, &opts, None, |u| callback(&u))
                    .await
            }
            None => self.runner.execute(packager, &args, &opts).await,
        };
        run.map_err(classify_package_failure)?;
        let duration = started.elapsed();

        let validation = validate_packaged_video(ws, request.encryption.is_enabled()).await;
        if !validation.is_valid {
            tracing::warn!(
                video_id = %ws.video_id,
                issues = ?validation.issues,
                "Packaged output failed validation"
            );
            return Err(Error::PackageValidation {
                issues: validation.issues,
            });
        }

        let video_segments = media_segments(&ws.video_seg_dir).await;
        let audio_segments = media_segments(&ws.audio_seg_dir).await;
        let segment_count = video_segments.len() + audio_segments.len();

        tracing::info!(
            video_id = %ws.video_id,
            segment_count,
            elapsed_ms = duration.as_millis() as u64,
            "Packaging finished"
        );

        Ok(PackageResult {
            manifest_path: ws.manifest_path.clone(),
            video_init_segment: ws.video_seg_dir.join(INIT_SEGMENT),
            audio_init_segment: ws.audio_seg_dir.join(INIT_SEGMENT),
            video_segments,
            audio_segments,
            segment_count,
            duration,
        })
    }
}
