//! Per-video workspace management.
//!
//! Every video owns one directory tree under the configured videos
//! directory. The tree doubles as the served asset location, so only the
//! intermediate encode and the temp directory are removed after packaging.
//!
//! ```text
//! <videos_dir>/<video_id>/
//!   video/init.mp4, video/segment-<n>.m4s
//!   audio/init.mp4, audio/segment-<n>.m4s
//!   manifest.mpd
//!   thumbnail.jpg
//!   key.bin
//!   keyinfo.txt
//!   intermediate.mp4
//!   temp/
//! ```
//!
//! File helpers on [`WorkspaceManager`] treat "already absent" as success
//! for removals so cleanup can be re-run safely after an interrupted job.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use vs_core::config::StorageConfig;
use vs_core::{Error, Result, VideoId};

/// File name prefix of ffmpeg two-pass statistics files.
pub const TWO_PASS_LOG_PREFIX: &str = "ffmpeg2pass";

/// Whether `file_name` is a two-pass statistics file
/// (`ffmpeg2pass-0.log`, `ffmpeg2pass-0.log.mbtree`, ...).
pub fn is_two_pass_log(file_name: &str) -> bool {
    file_name.starts_with(TWO_PASS_LOG_PREFIX) && file_name.contains(".log")
}

/// Paths making up one video's workspace. Pure function of the base
/// directory and the id; constructing one touches nothing on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Workspace {
    pub video_id: VideoId,
    pub root_dir: PathBuf,
    pub video_seg_dir: PathBuf,
    pub audio_seg_dir: PathBuf,
    pub intermediate_path: PathBuf,
    pub manifest_path: PathBuf,
    pub thumbnail_path: PathBuf,
    pub key_path: PathBuf,
    pub keyinfo_path: PathBuf,
    pub temp_dir: PathBuf,
}

impl Workspace {
    pub fn layout(base_dir: &Path, video_id: &VideoId) -> Self {
        let root = base_dir.join(video_id.as_str());
        Self {
            video_id: video_id.clone(),
            video_seg_dir: root.join("video"),
            audio_seg_dir: root.join("audio"),
            intermediate_path: root.join("intermediate.mp4"),
            manifest_path: root.join("manifest.mpd"),
            thumbnail_path: root.join("thumbnail.jpg"),
            key_path: root.join("key.bin"),
            keyinfo_path: root.join("keyinfo.txt"),
            temp_dir: root.join("temp"),
            root_dir: root,
        }
    }
}

/// What a cleanup pass removed. Failures are collected, never raised.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub bytes_freed: u64,
    pub removed: Vec<PathBuf>,
    pub errors: Vec<String>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn merge(&mut self, other: CleanupReport) {
        self.bytes_freed += other.bytes_freed;
        self.removed.extend(other.removed);
        self.errors.extend(other.errors);
    }
}

/// Result of a free-space preflight check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SpaceCheck {
    pub required: u64,
    pub available: u64,
    pub sufficient: bool,
}

/// Filesystem capacity of the videos directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiskUsage {
    pub available_bytes: u64,
    pub total_bytes: u64,
}

/// Owns the per-video directory trees under one base directory.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    base_dir: PathBuf,
    space_multiplier: f64,
}

impl WorkspaceManager {
    pub fn new(base_dir: impl Into<PathBuf>, space_multiplier: f64) -> Self {
        Self {
            base_dir: base_dir.into(),
            space_multiplier,
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(config.videos_dir.clone(), config.space_multiplier)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Workspace paths for `video_id`, whether or not it exists.
    pub fn layout(&self, video_id: &VideoId) -> Workspace {
        Workspace::layout(&self.base_dir, video_id)
    }

    /// Create the directory tree for `video_id`.
    ///
    /// A tree left behind by an interrupted run is removed first so stale
    /// segments never mix with new output.
    pub async fn create_workspace(&self, video_id: &VideoId) -> Result<Workspace> {
        let ws = self.layout(video_id);

        if path_exists(&ws.root_dir).await {
            tracing::warn!(
                video_id = %video_id,
                path = %ws.root_dir.display(),
                "Removing stale workspace"
            );
            tokio::fs::remove_dir_all(&ws.root_dir).await.map_err(|e| {
                Error::workspace_creation(&ws.root_dir, format!("failed to remove stale tree: {e}"))
            })?;
        }

        for dir in [&ws.video_seg_dir, &ws.audio_seg_dir, &ws.temp_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::workspace_creation(dir, e))?;
        }

        tracing::debug!(video_id = %video_id, root = %ws.root_dir.display(), "Workspace created");
        Ok(ws)
    }

    /// Existing workspace for `video_id`, or [`Error::NotFound`].
    pub async fn get_workspace(&self, video_id: &VideoId) -> Result<Workspace> {
        let ws = self.layout(video_id);
        if is_dir(&ws.root_dir).await {
            Ok(ws)
        } else {
            Err(Error::not_found("workspace", video_id))
        }
    }

    pub async fn workspace_exists(&self, video_id: &VideoId) -> bool {
        is_dir(&self.layout(video_id).root_dir).await
    }

    /// Remove the intermediate encode, everything in the temp directory and
    /// any two-pass logs in the workspace root.
    ///
    /// Every item is attempted; failures end up in
    /// [`CleanupReport::errors`].
    pub async fn cleanup_temp_files(&self, ws: &Workspace) -> CleanupReport {
        let mut report = CleanupReport::default();

        report.merge(remove_tree(&ws.intermediate_path).await);

        match list_dir(&ws.temp_dir).await {
            Ok(entries) => {
                for entry in entries {
                    report.merge(remove_tree(&entry).await);
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => report
                .errors
                .push(format!("{}: {e}", ws.temp_dir.display())),
        }

        match list_dir(&ws.root_dir).await {
            Ok(entries) => {
                for entry in entries {
                    let is_log = entry
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(is_two_pass_log);
                    if is_log {
                        report.merge(remove_tree(&entry).await);
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => report
                .errors
                .push(format!("{}: {e}", ws.root_dir.display())),
        }

        tracing::debug!(
            video_id = %ws.video_id,
            bytes_freed = report.bytes_freed,
            removed = report.removed.len(),
            errors = report.errors.len(),
            "Temp files cleaned"
        );
        report
    }

    /// Delete the whole tree for `video_id`. A missing tree is not an error.
    pub async fn cleanup_workspace(&self, video_id: &VideoId) -> CleanupReport {
        let ws = self.layout(video_id);
        let report = remove_tree(&ws.root_dir).await;
        tracing::info!(
            video_id = %video_id,
            bytes_freed = report.bytes_freed,
            errors = report.errors.len(),
            "Workspace removed"
        );
        report
    }

    /// Bytes to reserve for processing an input of `input_size` bytes.
    pub fn estimate_required_space(&self, input_size: u64) -> u64 {
        (input_size as f64 * self.space_multiplier).ceil() as u64
    }

    /// Compare `required` bytes against the free space of the videos
    /// directory's filesystem.
    pub async fn has_enough_space(&self, required: u64) -> Result<SpaceCheck> {
        let usage = self.disk_usage().await?;
        Ok(SpaceCheck {
            required,
            available: usage.available_bytes,
            sufficient: usage.available_bytes >= required,
        })
    }

    /// Capacity of the filesystem holding the videos directory. Falls back
    /// to the nearest existing ancestor when the directory is not created
    /// yet.
    pub async fn disk_usage(&self) -> Result<DiskUsage> {
        let mut probe = self.base_dir.clone();
        while !path_exists(&probe).await {
            if !probe.pop() || probe.as_os_str().is_empty() {
                probe = PathBuf::from(".");
                break;
            }
        }
        tokio::task::spawn_blocking(move || filesystem_usage(&probe))
            .await
            .map_err(|e| Error::Internal(format!("disk usage task failed: {e}")))?
    }

    // -- idempotent file helpers ---------------------------------------------

    /// Move `from` to `to`, falling back to copy + remove across
    /// filesystems. Succeeds without doing anything when `from` is gone and
    /// `to` already exists.
    pub async fn move_file(&self, from: &Path, to: &Path) -> Result<()> {
        if !path_exists(from).await && path_exists(to).await {
            return Ok(());
        }
        ensure_parent(to).await?;
        if let Err(rename_err) = tokio::fs::rename(from, to).await {
            if rename_err.kind() == ErrorKind::NotFound {
                return Err(Error::not_found("file", from.display()));
            }
            tokio::fs::copy(from, to).await?;
            if let Err(e) = tokio::fs::remove_file(from).await {
                tracing::warn!(path = %from.display(), "Failed to remove source after copy: {e}");
            }
        }
        Ok(())
    }

    pub async fn copy_file(&self, from: &Path, to: &Path) -> Result<u64> {
        ensure_parent(to).await?;
        tokio::fs::copy(from, to).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::not_found("file", from.display()),
            _ => e.into(),
        })
    }

    pub async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        tokio::fs::read(path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::not_found("file", path.display()),
            _ => e.into(),
        })
    }

    /// Atomically replace `path` with `data`.
    pub async fn write_file(&self, path: &Path, data: &[u8]) -> Result<()> {
        write_atomic(path, data, None).await
    }

    /// Entries of `dir`, sorted. A missing directory lists as empty.
    pub async fn list_files(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        match list_dir(dir).await {
            Ok(entries) => Ok(entries),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a file. Returns `false` when it was already absent.
    pub async fn remove_file(&self, path: &Path) -> Result<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write `data` to a sibling temp file and rename it over `path`.
///
/// On unix `mode` is applied to the temp file before the rename so the
/// final file never exists with looser permissions.
pub async fn write_atomic(path: &Path, data: &[u8], mode: Option<u32>) -> Result<()> {
    ensure_parent(path).await?;
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::Validation(format!("not a file path: {}", path.display())))?;
    let tmp = path.with_file_name(format!(
        ".{}.tmp-{}",
        file_name.to_string_lossy(),
        std::process::id()
    ));

    tokio::fs::write(&tmp, data).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Some(mode) = mode {
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(mode)).await?;
        }
    }
    #[cfg(not(unix))]
    let _ = mode;

    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

async fn list_dir(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    let mut rd = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        entries.push(entry.path());
    }
    entries.sort();
    Ok(entries)
}

/// Total size of the files under `path` (or of `path` itself).
async fn tree_size(path: &Path) -> u64 {
    let mut total = 0;
    let mut stack = vec![path.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(meta) = tokio::fs::symlink_metadata(&current).await else {
            continue;
        };
        if meta.is_dir() {
            if let Ok(children) = list_dir(&current).await {
                stack.extend(children);
            }
        } else {
            total += meta.len();
        }
    }
    total
}

/// Remove a file or directory tree, recording the outcome.
async fn remove_tree(path: &Path) -> CleanupReport {
    let mut report = CleanupReport::default();
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return report,
        Err(e) => {
            report.errors.push(format!("{}: {e}", path.display()));
            return report;
        }
    };

    let size = tree_size(path).await;
    let result = if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };

    match result {
        Ok(()) => {
            report.bytes_freed = size;
            report.removed.push(path.to_path_buf());
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => report.errors.push(format!("{}: {e}", path.display())),
    }
    report
}

#[cfg(unix)]
fn filesystem_usage(path: &Path) -> Result<DiskUsage> {
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|e| Error::Internal(format!("statvfs {}: {e}", path.display())))?;
    let fragment = stat.fragment_size() as u64;
    Ok(DiskUsage {
        available_bytes: stat.blocks_available() as u64 * fragment,
        total_bytes: stat.blocks() as u64 * fragment,
    })
}

#[cfg(not(unix))]
fn filesystem_usage(path: &Path) -> Result<DiskUsage> {
    Err(Error::Internal(format!(
        "disk statistics are not supported on this platform ({})",
        path.display()
    )))
}
