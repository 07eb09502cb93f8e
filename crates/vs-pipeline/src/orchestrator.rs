//! The processing pipeline: one video from raw upload to encrypted DASH
//! asset.
//!
//! A run moves strictly through
//! `validation → workspace-setup → key-generation → transcoding →
//! packaging → thumbnail → cleanup`, one phase at a time. The first failing
//! phase ends the run: the remaining phases are skipped, the workspace is
//! removed (once, best effort), the statistics of the failed run are
//! recorded and an [`OrchestrationError`] naming the phase is returned.
//! There are no retries and no partial results.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use vs_av::{
    EncoderAvailability, EncodingOptions, EncryptionConfig, EncryptionScheme, PackageRequest,
    PackageResult, Packager, ProcessRunner, ProgressCallback, ProgressUpdate, ToolRegistry,
    TranscodeRequest, TranscodeResult, Transcoder, VideoAnalysis, VideoPackager, VideoTranscoder,
    Workspace, WorkspaceManager,
};
use vs_core::config::{Config, PackagingConfig};
use vs_core::{Cache, Error, MemoryCache, Result, VideoId};

use crate::error::OrchestrationError;
use crate::keys::{generate_key_id, ContentKey, KeyManager};
use crate::progress::{overall_percent, ProgressSender};
use crate::requirements::SystemRequirements;
use crate::stats::{Phase, ProcessingStatistics};
use crate::thumbnail::{encrypt_thumbnail, FfmpegThumbnailer, ThumbnailGenerator, ThumbnailRequest};

/// Input of [`Orchestrator::execute`].
#[derive(Debug, Clone)]
pub struct OrchestrationRequest {
    pub video_id: VideoId,
    pub input_path: PathBuf,
    pub encoding_options: EncodingOptions,
    pub video_analysis: VideoAnalysis,
    pub generate_thumbnail: bool,
    /// Delete `input_path` after a successful run.
    pub cleanup_original: bool,
}

impl OrchestrationRequest {
    pub fn new(
        video_id: VideoId,
        input_path: impl Into<PathBuf>,
        encoding_options: EncodingOptions,
        video_analysis: VideoAnalysis,
    ) -> Self {
        Self {
            video_id,
            input_path: input_path.into(),
            encoding_options,
            video_analysis,
            generate_thumbnail: false,
            cleanup_original: false,
        }
    }

    pub fn with_thumbnail(mut self, generate: bool) -> Self {
        self.generate_thumbnail = generate;
        self
    }

    pub fn with_cleanup_original(mut self, cleanup: bool) -> Self {
        self.cleanup_original = cleanup;
        self
    }
}

/// Output of a fully successful run.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationResult {
    pub video_id: VideoId,
    pub manifest_path: PathBuf,
    pub thumbnail_path: Option<PathBuf>,
    /// `None` when neither the segments nor the thumbnail are encrypted.
    pub key_path: Option<PathBuf>,
    pub statistics: ProcessingStatistics,
    pub transcoding: TranscodeResult,
    pub packaging: PackageResult,
}

/// Run-wide settings that are not owned by a single component.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub encryption_scheme: EncryptionScheme,
    pub drm_label: Option<String>,
    pub packaging: PackagingConfig,
    /// XOR the thumbnail with the content key.
    pub encrypt_thumbnail: bool,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            encryption_scheme: config.packaging.encryption_scheme.parse()?,
            drm_label: config.packaging.drm_label.clone(),
            packaging: config.packaging.clone(),
            encrypt_thumbnail: config.thumbnail.encrypt,
        })
    }

    fn needs_key(&self) -> bool {
        self.encryption_scheme != EncryptionScheme::None || self.encrypt_thumbnail
    }
}

/// The collaborators an [`Orchestrator`] drives.
pub struct Components {
    pub workspaces: Arc<WorkspaceManager>,
    pub keys: Arc<KeyManager>,
    pub transcoder: Arc<dyn VideoTranscoder>,
    pub packager: Arc<dyn VideoPackager>,
    pub thumbnailer: Arc<dyn ThumbnailGenerator>,
    pub runner: Arc<ProcessRunner>,
    pub tools: Arc<ToolRegistry>,
    pub statistics: Arc<dyn Cache<VideoId, ProcessingStatistics>>,
}

impl Components {
    /// Production components built from configuration.
    pub fn from_config(config: &Config) -> Self {
        let runner = Arc::new(ProcessRunner::new());
        let tools = Arc::new(ToolRegistry::discover(&config.tools));
        let workspaces = Arc::new(WorkspaceManager::from_config(&config.storage));
        let keys = Arc::new(KeyManager::new(workspaces.clone(), config.keys.clone()));
        let encoder_cache: Arc<dyn Cache<String, EncoderAvailability>> =
            Arc::new(MemoryCache::new());

        Self {
            transcoder: Arc::new(Transcoder::new(
                runner.clone(),
                &tools,
                encoder_cache,
                &config.transcoding,
            )),
            packager: Arc::new(Packager::new(runner.clone(), &tools, &config.packaging)),
            thumbnailer: Arc::new(FfmpegThumbnailer::new(
                runner.clone(),
                &tools,
                config.thumbnail.clone(),
            )),
            statistics: Arc::new(MemoryCache::<VideoId, ProcessingStatistics>::new()),
            workspaces,
            keys,
            runner,
            tools,
        }
    }
}

/// Sequences the pipeline phases for one video at a time per id.
pub struct Orchestrator {
    components: Components,
    settings: OrchestratorSettings,
    progress: Arc<ProgressSender>,
    active: Mutex<HashSet<VideoId>>,
}

impl Orchestrator {
    pub fn new(components: Components, settings: OrchestratorSettings) -> Self {
        Self {
            components,
            settings,
            progress: Arc::new(ProgressSender::noop()),
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            Components::from_config(config),
            OrchestratorSettings::from_config(config)?,
        ))
    }

    /// Builder: report overall progress to `sender`.
    pub fn with_progress(mut self, sender: ProgressSender) -> Self {
        self.progress = Arc::new(sender);
        self
    }

    pub fn workspaces(&self) -> &Arc<WorkspaceManager> {
        &self.components.workspaces
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.components.keys
    }

    /// Statistics of the last run for `video_id`, successful or not.
    pub fn get_processing_statistics(&self, video_id: &VideoId) -> Option<ProcessingStatistics> {
        self.components.statistics.get(video_id)
    }

    /// Tool, disk and GPU availability. Never fails.
    pub async fn check_system_requirements(&self) -> SystemRequirements {
        let c = &self.components;
        SystemRequirements::probe(&c.runner, &c.tools, &c.workspaces).await
    }

    /// Run the whole pipeline for one video.
    pub async fn execute(
        &self,
        request: OrchestrationRequest,
    ) -> std::result::Result<OrchestrationResult, OrchestrationError> {
        let video_id = request.video_id.clone();
        let mut run = RunState::new(video_id.clone(), self.progress.clone());
        tracing::info!(
            video_id = %video_id,
            input = %request.input_path.display(),
            "Processing started"
        );

        let Some(claim) = ActiveClaim::acquire(&self.active, &video_id) else {
            return Err(Self::reject_duplicate(run));
        };
        let outcome = self.run_phases(&request, &mut run).await;
        drop(claim);

        match outcome {
            Ok(mut result) => {
                run.stats.finish(run.started.elapsed(), None);
                self.components
                    .statistics
                    .insert(video_id.clone(), run.stats.clone());
                self.progress.send(Phase::Cleanup, 100.0);
                tracing::info!(
                    video_id = %video_id,
                    total_ms = run.stats.total_duration.as_millis() as u64,
                    segments = run.stats.segment_count,
                    "Processing finished"
                );
                result.statistics = run.stats;
                Ok(result)
            }
            Err(source) => Err(self.fail(run, source).await),
        }
    }

    /// A second run for an id already in flight. Nothing on disk belongs to
    /// this request, and the statistics cache and progress callback stay with
    /// the run that owns the id.
    fn reject_duplicate(mut run: RunState) -> OrchestrationError {
        let video_id = run.stats.video_id.clone();
        let elapsed = run.started.elapsed();
        run.stats.phase_durations.record(Phase::Validation, elapsed);
        run.stats.finish(elapsed, Some(Phase::Validation));
        tracing::warn!(video_id = %video_id, "Rejected run: video is already being processed");

        OrchestrationError {
            phase: Phase::Validation,
            source: Error::Validation(format!("video {video_id} is already being processed")),
            video_id,
            statistics: Box::new(run.stats),
        }
    }

    async fn fail(&self, mut run: RunState, source: Error) -> OrchestrationError {
        let phase = run.phase;
        run.leave();
        tracing::error!(
            video_id = %run.stats.video_id,
            phase = %phase,
            code = source.code(),
            "Processing failed: {source}"
        );

        // Validation runs before anything is written, so an existing asset
        // for this id is left untouched.
        if phase != Phase::Validation {
            let report = self
                .components
                .workspaces
                .cleanup_workspace(&run.stats.video_id)
                .await;
            if !report.is_clean() {
                tracing::warn!(
                    video_id = %run.stats.video_id,
                    errors = ?report.errors,
                    "Workspace cleanup after failure was incomplete"
                );
            }
        }

        run.stats.finish(run.started.elapsed(), Some(phase));
        let video_id = run.stats.video_id.clone();
        self.components
            .statistics
            .insert(video_id.clone(), run.stats.clone());

        OrchestrationError {
            phase,
            video_id,
            source,
            statistics: Box::new(run.stats),
        }
    }

    async fn run_phases(
        &self,
        request: &OrchestrationRequest,
        run: &mut RunState,
    ) -> Result<OrchestrationResult> {
        let c = &self.components;
        let video_id = &request.video_id;

        run.enter(Phase::Validation);
        run.stats.input_size = self.validate(request).await?;
        run.leave();

        run.enter(Phase::WorkspaceSetup);
        let ws = c.workspaces.create_workspace(video_id).await?;
        run.leave();

        run.enter(Phase::KeyGeneration);
        let (key, key_path, encryption) = self.prepare_keys(video_id).await?;
        run.leave();

        run.enter(Phase::Transcoding);
        let transcoding = c
            .transcoder
            .transcode(TranscodeRequest {
                input: request.input_path.clone(),
                output: ws.intermediate_path.clone(),
                options: request.encoding_options.to_enhanced(),
                analysis: request.video_analysis.clone(),
                passlog_dir: ws.temp_dir.clone(),
                label: Some(format!("transcode:{video_id}")),
                progress: Some(self.phase_callback(Phase::Transcoding)),
            })
            .await?;
        run.stats.used_gpu = transcoding.used_gpu;
        run.stats.codec_used = Some(transcoding.codec.clone());
        run.stats.set_output_size(transcoding.file_size);
        run.leave();

        run.enter(Phase::Packaging);
        let mut package_request = PackageRequest::new(
            ws.intermediate_path.clone(),
            ws.clone(),
            encryption,
            &self.settings.packaging,
        );
        package_request.label = Some(format!("package:{video_id}"));
        package_request.progress = Some(self.phase_callback(Phase::Packaging));
        let packaging = c.packager.package(package_request).await?;
        run.stats.segment_count = packaging.segment_count;
        run.leave();

        let thumbnail_path = if request.generate_thumbnail {
            run.enter(Phase::Thumbnail);
            let path = self.make_thumbnail(request, &ws, key.as_ref()).await?;
            run.leave();
            Some(path)
        } else {
            None
        };

        run.enter(Phase::Cleanup);
        self.cleanup(request, &ws).await?;
        run.leave();

        Ok(OrchestrationResult {
            video_id: video_id.clone(),
            manifest_path: packaging.manifest_path.clone(),
            thumbnail_path,
            key_path,
            statistics: run.stats.clone(),
            transcoding,
            packaging,
        })
    }

    /// Check the request before anything touches the disk or spawns a
    /// process. Returns the input size.
    async fn validate(&self, request: &OrchestrationRequest) -> Result<u64> {
        request.encoding_options.validate()?;

        let meta = tokio::fs::metadata(&request.input_path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    Error::not_found("input file", request.input_path.display())
                }
                _ => e.into(),
            })?;
        if !meta.is_file() {
            return Err(Error::Validation(format!(
                "input {} is not a regular file",
                request.input_path.display()
            )));
        }
        if meta.len() == 0 {
            return Err(Error::Validation(format!(
                "input {} is empty",
                request.input_path.display()
            )));
        }

        let workspaces = &self.components.workspaces;
        let required = workspaces.estimate_required_space(meta.len());
        let space = workspaces.has_enough_space(required).await?;
        if !space.sufficient {
            return Err(Error::InsufficientSpace {
                required: space.required,
                available: space.available,
            });
        }

        tracing::debug!(
            video_id = %request.video_id,
            input_size = meta.len(),
            required,
            available = space.available,
            "Validation passed"
        );
        Ok(meta.len())
    }

    async fn prepare_keys(
        &self,
        video_id: &VideoId,
    ) -> Result<(Option<ContentKey>, Option<PathBuf>, EncryptionConfig)> {
        if !self.settings.needs_key() {
            return Ok((None, None, EncryptionConfig::none()));
        }

        let material = self.components.keys.generate_and_store_key(video_id).await?;
        let encryption = if self.settings.encryption_scheme == EncryptionScheme::None {
            EncryptionConfig::none()
        } else {
            let config = EncryptionConfig::new(
                self.settings.encryption_scheme,
                &material.key,
                &generate_key_id(),
                self.settings.drm_label.clone(),
            );
            config.validate()?;
            config
        };
        Ok((Some(material.key), Some(material.key_path), encryption))
    }

    async fn make_thumbnail(
        &self,
        request: &OrchestrationRequest,
        ws: &Workspace,
        key: Option<&ContentKey>,
    ) -> Result<PathBuf> {
        let path = self
            .components
            .thumbnailer
            .generate(ThumbnailRequest {
                input: ws.intermediate_path.clone(),
                output: ws.thumbnail_path.clone(),
                duration_secs: request.video_analysis.duration,
                label: Some(format!("thumbnail:{}", request.video_id)),
            })
            .await?;

        if self.settings.encrypt_thumbnail {
            let key = key.ok_or_else(|| {
                Error::EncryptionSetup("thumbnail encryption requires a content key".into())
            })?;
            encrypt_thumbnail(&path, key).await?;
        }
        Ok(path)
    }

    async fn cleanup(&self, request: &OrchestrationRequest, ws: &Workspace) -> Result<()> {
        let c = &self.components;
        c.keys.cleanup_temp_files(&request.video_id).await?;

        let report = c.workspaces.cleanup_temp_files(ws).await;
        if !report.is_clean() {
            tracing::warn!(
                video_id = %request.video_id,
                errors = ?report.errors,
                "Some temp files could not be removed"
            );
        }

        if request.cleanup_original && c.workspaces.remove_file(&request.input_path).await? {
            tracing::info!(path = %request.input_path.display(), "Removed original upload");
        }
        Ok(())
    }

    fn phase_callback(&self, phase: Phase) -> ProgressCallback {
        let sender = self.progress.clone();
        Arc::new(move |update: &ProgressUpdate| {
            if let Some(pct) = update.percent {
                sender.send(phase, overall_percent(phase, pct));
            }
        })
    }
}

/// Per-run bookkeeping: the current phase and its start time.
struct RunState {
    stats: ProcessingStatistics,
    started: Instant,
    phase: Phase,
    phase_started: Option<Instant>,
    progress: Arc<ProgressSender>,
}

impl RunState {
    fn new(video_id: VideoId, progress: Arc<ProgressSender>) -> Self {
        Self {
            stats: ProcessingStatistics::new(video_id),
            started: Instant::now(),
            phase: Phase::Validation,
            phase_started: None,
            progress,
        }
    }

    fn enter(&mut self, phase: Phase) {
        tracing::debug!(video_id = %self.stats.video_id, phase = %phase, "Entering phase");
        self.phase = phase;
        self.phase_started = Some(Instant::now());
        self.progress.send(phase, overall_percent(phase, 0.0));
    }

    fn leave(&mut self) {
        if let Some(started) = self.phase_started.take() {
            self.stats.phase_durations.record(self.phase, started.elapsed());
        }
    }
}

/// Marks a video id as in flight for the lifetime of the guard.
struct ActiveClaim<'a> {
    active: &'a Mutex<HashSet<VideoId>>,
    video_id: VideoId,
}

impl<'a> ActiveClaim<'a> {
    fn acquire(active: &'a Mutex<HashSet<VideoId>>, video_id: &VideoId) -> Option<Self> {
        active.lock().insert(video_id.clone()).then(|| Self {
            active,
            video_id: video_id.clone(),
        })
    }
}

impl Drop for ActiveClaim<'_> {
    fn drop(&mut self) {
        self.active.lock().remove(&self.video_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_are_exclusive_per_id() {
        let active = Mutex::new(HashSet::new());
        let a = VideoId::new("a").unwrap();
        let b = VideoId::new("b").unwrap();

        let first = ActiveClaim::acquire(&active, &a);
        assert!(first.is_some());
        assert!(ActiveClaim::acquire(&active, &a).is_none());
        assert!(ActiveClaim::acquire(&active, &b).is_some());

        drop(first);
        assert!(ActiveClaim::acquire(&active, &a).is_some());
    }

    #[test]
    fn settings_parse_scheme() {
        let mut config = Config::default();
        config.packaging.encryption_scheme = "CBCS".into();
        let settings = OrchestratorSettings::from_config(&config).unwrap();
        assert_eq!(settings.encryption_scheme, EncryptionScheme::Cbcs);
        assert!(settings.needs_key());

        config.packaging.encryption_scheme = "aes".into();
        assert!(OrchestratorSettings::from_config(&config).is_err());

        config.packaging.encryption_scheme = "none".into();
        let settings = OrchestratorSettings::from_config(&config).unwrap();
        assert!(!settings.needs_key());
    }

    #[test]
    fn leaving_without_entering_records_nothing() {
        let mut run = RunState::new(VideoId::new("v").unwrap(), Arc::new(ProgressSender::noop()));
        run.leave();
        assert_eq!(run.stats.phase_durations.total(), std::time::Duration::ZERO);

        run.enter(Phase::Packaging);
        run.leave();
        run.leave();
        assert!(run.stats.phase_durations.get(Phase::Packaging) > std::time::Duration::ZERO);
    }
}
