//! End-to-end pipeline runs against in-process fakes of the external tools.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use tokio::sync::Notify;
use vs_av::{
    EncoderAvailability, EncodingOptions, EncryptionConfig, EnhancedOptions, LegacyEncoder,
    LegacyOptions, PackageRequest, PackageResult, ProcessRunner, ToolRegistry, TranscodeRequest,
    TranscodeResult, VideoAnalysis, VideoPackager, VideoTranscoder, WorkspaceManager,
};
use vs_core::config::{Config, KeyConfig};
use vs_core::{Cache, Error, MemoryCache, Result, VideoId};
use vs_pipeline::{
    Components, KeyManager, OrchestrationRequest, Orchestrator, OrchestratorSettings, Phase,
    ProcessingStatistics, ProgressSender, ThumbnailGenerator, ThumbnailRequest,
};

const INTERMEDIATE: &[u8] = b"transcoded-bytes";
const THUMBNAIL: &[u8] = b"\xff\xd8jpeg-bytes\xff\xd9";

#[derive(Default)]
struct FakeTranscoder {
    fail: bool,
    requests: Mutex<Vec<(String, Option<String>)>>,
    /// When set, each transcode signals `started` and then waits here.
    gate: Mutex<Option<Arc<Notify>>>,
    started: Notify,
}

#[async_trait]
impl VideoTranscoder for FakeTranscoder {
    async fn transcode(&self, request: TranscodeRequest) -> Result<TranscodeResult> {
        self.requests
            .lock()
            .unwrap()
            .push((request.options.codec.clone(), request.label.clone()));
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            self.started.notify_one();
            gate.notified().await;
        }
        if self.fail {
            return Err(Error::TranscodingFailed("engine crashed".into()));
        }
        tokio::fs::write(&request.output, INTERMEDIATE).await?;
        Ok(TranscodeResult {
            output_path: request.output,
            duration: Duration::from_millis(5),
            used_gpu: request.options.is_hardware(),
            codec: request.options.codec,
            file_size: INTERMEDIATE.len() as u64,
            two_pass: false,
        })
    }

    async fn check_encoder(&self, _codec: &str) -> EncoderAvailability {
        EncoderAvailability::available()
    }
}

#[derive(Default)]
struct FakePackager {
    fail: bool,
    encryption: Mutex<Option<EncryptionConfig>>,
}

#[async_trait]
impl VideoPackager for FakePackager {
    async fn package(&self, request: PackageRequest) -> Result<PackageResult> {
        *self.encryption.lock().unwrap() = Some(request.encryption.clone());
        assert!(request.input.exists(), "packager input must exist");
        if self.fail {
            return Err(Error::PackagingFailed("segmenter crashed".into()));
        }

        let ws = &request.workspace;
        tokio::fs::write(&ws.manifest_path, "<MPD></MPD>").await?;
        let mut video_segments = Vec::new();
        let mut audio_segments = Vec::new();
        for (dir, segments) in [
            (&ws.video_seg_dir, &mut video_segments),
            (&ws.audio_seg_dir, &mut audio_segments),
        ] {
            tokio::fs::write(dir.join("init.mp4"), b"init").await?;
            for n in 1..=3 {
                let seg = dir.join(format!("segment-{n}.m4s"));
                tokio::fs::write(&seg, b"seg").await?;
                segments.push(seg);
            }
        }

        Ok(PackageResult {
            manifest_path: ws.manifest_path.clone(),
            video_init_segment: ws.video_seg_dir.join("init.mp4"),
            audio_init_segment: ws.audio_seg_dir.join("init.mp4"),
            segment_count: video_segments.len() + audio_segments.len(),
            video_segments,
            audio_segments,
            duration: Duration::from_millis(3),
        })
    }
}

struct FakeThumbnailer;

#[async_trait]
impl ThumbnailGenerator for FakeThumbnailer {
    async fn generate(&self, request: ThumbnailRequest) -> Result<PathBuf> {
        tokio::fs::write(&request.output, THUMBNAIL).await?;
        Ok(request.output)
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    videos: PathBuf,
    input: PathBuf,
    statistics: Arc<dyn Cache<VideoId, ProcessingStatistics>>,
    packager: Arc<FakePackager>,
    transcoder: Arc<FakeTranscoder>,
    orchestrator: Orchestrator,
}

fn key_config() -> KeyConfig {
    KeyConfig {
        master_seed: "integration-seed".into(),
        rounds: 1_000,
        ..Default::default()
    }
}

fn harness_with(
    transcoder: FakeTranscoder,
    packager: FakePackager,
    config: Config,
    multiplier: f64,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let videos = dir.path().join("videos");
    let input = dir.path().join("upload.mkv");
    std::fs::write(&input, vec![7u8; 4096]).unwrap();

    let workspaces = Arc::new(WorkspaceManager::new(&videos, multiplier));
    let statistics: Arc<dyn Cache<VideoId, ProcessingStatistics>> =
        Arc::new(MemoryCache::<VideoId, ProcessingStatistics>::new());
    let transcoder = Arc::new(transcoder);
    let packager = Arc::new(packager);

    let components = Components {
        keys: Arc::new(KeyManager::new(workspaces.clone(), config.keys.clone())),
        workspaces,
        transcoder: transcoder.clone(),
        packager: packager.clone(),
        thumbnailer: Arc::new(FakeThumbnailer),
        runner: Arc::new(ProcessRunner::new()),
        tools: Arc::new(ToolRegistry::default()),
        statistics: statistics.clone(),
    };
    let settings = OrchestratorSettings::from_config(&config).unwrap();

    Harness {
        _dir: dir,
        videos,
        input,
        statistics,
        packager,
        transcoder,
        orchestrator: Orchestrator::new(components, settings),
    }
}

fn harness(transcoder: FakeTranscoder, packager: FakePackager) -> Harness {
    let config = Config {
        keys: key_config(),
        ..Default::default()
    };
    harness_with(transcoder, packager, config, 3.0)
}

fn vid() -> VideoId {
    VideoId::new("movie-1").unwrap()
}

fn request(h: &Harness) -> OrchestrationRequest {
    let analysis = VideoAnalysis {
        duration: 60.0,
        bitrate: 5_000,
        height: 1080,
        width: 1920,
        ..Default::default()
    };
    OrchestrationRequest::new(
        vid(),
        &h.input,
        EncodingOptions::Legacy(LegacyOptions {
            encoder: LegacyEncoder::CpuH265,
        }),
        analysis,
    )
}

#[tokio::test]
async fn successful_run_produces_asset_and_statistics() {
    let h = harness(FakeTranscoder::default(), FakePackager::default());
    let result = h.orchestrator.execute(request(&h)).await.unwrap();

    let root = h.videos.join("movie-1");
    assert_eq!(result.manifest_path, root.join("manifest.mpd"));
    assert!(result.manifest_path.exists());
    assert_eq!(result.key_path.as_deref(), Some(root.join("key.bin").as_path()));
    assert_eq!(result.thumbnail_path, None);
    assert_eq!(result.packaging.segment_count, 6);

    // Temporary artifacts are gone, the asset stays.
    assert!(!root.join("intermediate.mp4").exists());
    assert!(!root.join("keyinfo.txt").exists());
    assert!(root.join("key.bin").exists());
    assert!(h.input.exists());

    let stats = &result.statistics;
    assert!(stats.succeeded);
    assert_eq!(stats.failed_phase, None);
    assert_eq!(stats.codec_used.as_deref(), Some("libx265"));
    assert!(!stats.used_gpu);
    assert_eq!(stats.segment_count, 6);
    assert_eq!(stats.input_size, 4096);
    assert_eq!(stats.compression_ratio, Some(4096.0 / INTERMEDIATE.len() as f64));
    for phase in Phase::ALL {
        let recorded = stats.phase_durations.get(phase);
        if phase == Phase::Thumbnail {
            assert_eq!(recorded, Duration::ZERO);
        } else {
            assert!(recorded > Duration::ZERO, "{phase} not timed");
        }
    }

    let cached = h.orchestrator.get_processing_statistics(&vid()).unwrap();
    assert!(cached.succeeded);
    assert_eq!(cached.phase_durations, stats.phase_durations);

    let transcodes = h.transcoder.requests.lock().unwrap().clone();
    assert_eq!(
        transcodes,
        vec![("libx265".to_string(), Some("transcode:movie-1".to_string()))]
    );
}

#[tokio::test]
async fn packager_receives_the_derived_key() {
    let h = harness(FakeTranscoder::default(), FakePackager::default());
    h.orchestrator.execute(request(&h)).await.unwrap();

    let expected =
        vs_pipeline::derive_key("integration-seed", "video-key-salt-", "movie-1", 1_000).unwrap();
    let encryption = h.packager.encryption.lock().unwrap().clone().unwrap();
    assert!(encryption.is_enabled());
    assert_eq!(encryption.key, hex::encode(expected));
    assert_eq!(encryption.key_id.len(), 32);
    assert_eq!(std::fs::read(h.videos.join("movie-1").join("key.bin")).unwrap(), expected);
}

#[tokio::test]
async fn packaging_failure_reports_phase_and_cleans_up() {
    let h = harness(
        FakeTranscoder::default(),
        FakePackager {
            fail: true,
            ..Default::default()
        },
    );
    let err = h.orchestrator.execute(request(&h)).await.unwrap_err();

    assert_eq!(err.phase, Phase::Packaging);
    assert_eq!(err.video_id, vid());
    assert_matches!(err.source, Error::PackagingFailed(_));
    assert_eq!(err.code(), "PACKAGING_FAILED");
    assert!(!h.videos.join("movie-1").exists(), "workspace should be removed");

    let stats = h.statistics.get(&vid()).expect("failed run recorded");
    for phase in [
        Phase::Validation,
        Phase::WorkspaceSetup,
        Phase::KeyGeneration,
        Phase::Transcoding,
        Phase::Packaging,
    ] {
        assert!(stats.phase_durations.get(phase) > Duration::ZERO, "{phase} not timed");
    }
    assert_eq!(stats.phase_durations.get(Phase::Thumbnail), Duration::ZERO);
    assert_eq!(stats.phase_durations.get(Phase::Cleanup), Duration::ZERO);
    assert!(!stats.succeeded);
    assert_eq!(stats.failed_phase, Some(Phase::Packaging));
    assert_eq!(err.statistics.failed_phase, Some(Phase::Packaging));
}

#[tokio::test]
async fn transcoding_failure_skips_packaging() {
    let h = harness(
        FakeTranscoder {
            fail: true,
            ..Default::default()
        },
        FakePackager::default(),
    );
    let err = h.orchestrator.execute(request(&h)).await.unwrap_err();

    assert_eq!(err.phase, Phase::Transcoding);
    assert_matches!(err.source, Error::TranscodingFailed(_));
    assert!(h.packager.encryption.lock().unwrap().is_none());
    assert!(!h.videos.join("movie-1").exists());
}

#[tokio::test]
async fn missing_input_fails_validation_without_touching_disk() {
    let h = harness(FakeTranscoder::default(), FakePackager::default());
    std::fs::remove_file(&h.input).unwrap();

    let err = h.orchestrator.execute(request(&h)).await.unwrap_err();
    assert_eq!(err.phase, Phase::Validation);
    assert_matches!(err.source, Error::NotFound { .. });
    assert!(h.transcoder.requests.lock().unwrap().is_empty());
    assert!(!h.videos.join("movie-1").exists());
}

#[tokio::test]
async fn validation_failure_keeps_existing_asset() {
    let h = harness(FakeTranscoder::default(), FakePackager::default());
    h.orchestrator.execute(request(&h)).await.unwrap();
    std::fs::write(&h.input, b"").unwrap();

    let err = h.orchestrator.execute(request(&h)).await.unwrap_err();
    assert_eq!(err.phase, Phase::Validation);
    assert_matches!(err.source, Error::Validation(_));
    assert!(h.videos.join("movie-1").join("manifest.mpd").exists());
}

#[tokio::test]
async fn duplicate_run_is_rejected_without_touching_statistics() {
    let h = harness(FakeTranscoder::default(), FakePackager::default());
    h.orchestrator.execute(request(&h)).await.unwrap();
    let completed = h.orchestrator.get_processing_statistics(&vid()).unwrap();

    let release = Arc::new(Notify::new());
    *h.transcoder.gate.lock().unwrap() = Some(release.clone());

    let in_flight = h.orchestrator.execute(request(&h));
    let duplicate = async {
        h.transcoder.started.notified().await;
        let err = h.orchestrator.execute(request(&h)).await.unwrap_err();
        let during = h.orchestrator.get_processing_statistics(&vid()).unwrap();
        let workspace_kept = h.videos.join("movie-1").is_dir();
        release.notify_one();
        (err, during, workspace_kept)
    };
    let (first, (err, during, workspace_kept)) = tokio::join!(in_flight, duplicate);

    assert_eq!(err.phase, Phase::Validation);
    assert_matches!(
        err.source,
        Error::Validation(ref msg) if msg.contains("already being processed")
    );
    assert_eq!(err.statistics.failed_phase, Some(Phase::Validation));
    assert!(workspace_kept, "rejected run must not clean up the active workspace");

    // The cache still holds the last completed run while the second one is going.
    assert!(during.succeeded);
    assert_eq!(during.failed_phase, None);
    assert_eq!(during.started_at, completed.started_at);

    let second = first.unwrap();
    let cached = h.orchestrator.get_processing_statistics(&vid()).unwrap();
    assert!(cached.succeeded);
    assert_eq!(cached.started_at, second.statistics.started_at);
    assert_eq!(h.transcoder.requests.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn failed_cleanup_after_failure_keeps_original_error() {
    let h = harness(FakeTranscoder::default(), FakePackager::default());
    // A file where the videos directory should be: setup fails and so does
    // the removal of the half-created tree.
    std::fs::write(&h.videos, b"not a directory").unwrap();

    let err = h.orchestrator.execute(request(&h)).await.unwrap_err();
    assert_eq!(err.phase, Phase::WorkspaceSetup);
    assert_matches!(err.source, Error::WorkspaceCreation { .. });
    assert_eq!(err.code(), "WORKSPACE_CREATION_ERROR");

    let report = h.orchestrator.workspaces().cleanup_workspace(&vid()).await;
    assert!(!report.is_clean());

    let stats = h.statistics.get(&vid()).expect("failed run recorded");
    assert_eq!(stats.failed_phase, Some(Phase::WorkspaceSetup));
    assert!(h.transcoder.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn insufficient_space_is_rejected_before_transcoding() {
    let config = Config {
        keys: key_config(),
        ..Default::default()
    };
    let h = harness_with(FakeTranscoder::default(), FakePackager::default(), config, 1e18);

    let err = h.orchestrator.execute(request(&h)).await.unwrap_err();
    assert_eq!(err.phase, Phase::Validation);
    assert_matches!(
        err.source,
        Error::InsufficientSpace { required, available } if required > available
    );
    assert!(h.transcoder.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn invalid_options_fail_validation() {
    let h = harness(FakeTranscoder::default(), FakePackager::default());
    let mut req = request(&h);
    let mut opts = EnhancedOptions::from_analysis(&req.video_analysis, "libx264");
    opts.quality_value = 99;
    req.encoding_options = opts.into();

    let err = h.orchestrator.execute(req).await.unwrap_err();
    assert_eq!(err.phase, Phase::Validation);
    assert_matches!(err.source, Error::Validation(_));
}

#[tokio::test]
async fn thumbnail_is_encrypted_and_original_removed() {
    let mut config = Config {
        keys: key_config(),
        ..Default::default()
    };
    config.thumbnail.encrypt = true;
    let h = harness_with(FakeTranscoder::default(), FakePackager::default(), config, 3.0);

    let req = request(&h).with_thumbnail(true).with_cleanup_original(true);
    let result = h.orchestrator.execute(req).await.unwrap();

    let thumb = result.thumbnail_path.clone().unwrap();
    let stored = std::fs::read(&thumb).unwrap();
    assert_ne!(stored, THUMBNAIL);
    let key = h.orchestrator.keys().retrieve_key(&vid()).await.unwrap();
    assert_eq!(vs_pipeline::xor_transform(&stored, &key, 0), THUMBNAIL);

    assert!(result.statistics.phase_durations.get(Phase::Thumbnail) > Duration::ZERO);
    assert!(!h.input.exists(), "original upload should be removed");
}

#[tokio::test]
async fn unencrypted_run_stores_no_key() {
    let mut config = Config {
        keys: key_config(),
        ..Default::default()
    };
    config.packaging.encryption_scheme = "none".into();
    let h = harness_with(FakeTranscoder::default(), FakePackager::default(), config, 3.0);

    let result = h.orchestrator.execute(request(&h)).await.unwrap();
    assert_eq!(result.key_path, None);
    assert!(!h.videos.join("movie-1").join("key.bin").exists());
    let encryption = h.packager.encryption.lock().unwrap().clone().unwrap();
    assert!(!encryption.is_enabled());
}

#[tokio::test]
async fn progress_moves_forward_through_phases() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let mut h = harness(FakeTranscoder::default(), FakePackager::default());
    h.orchestrator = h.orchestrator.with_progress(ProgressSender::new(move |phase, pct| {
        sink.lock().unwrap().push((phase, pct))
    }));

    h.orchestrator.execute(request(&h)).await.unwrap();

    let seen = seen.lock().unwrap();
    let phases: Vec<Phase> = seen.iter().map(|(p, _)| *p).collect();
    assert_eq!(phases.first(), Some(&Phase::Validation));
    assert!(phases.contains(&Phase::Packaging));
    assert!(!phases.contains(&Phase::Thumbnail));
    assert!(seen.windows(2).all(|w| w[0].1 <= w[1].1));
    assert_eq!(seen.last().map(|(_, pct)| *pct), Some(100.0));
}

#[tokio::test]
async fn requirements_never_fail() {
    let h = harness(FakeTranscoder::default(), FakePackager::default());
    let req = h.orchestrator.check_system_requirements().await;
    assert!(!req.ffmpeg.available);
    assert!(!req.packager.available);
    assert!(!req.gpu.available);
}

#[test]
fn request_defaults() {
    let req = OrchestrationRequest::new(
        vid(),
        Path::new("/in.mp4"),
        EncodingOptions::Legacy(LegacyOptions {
            encoder: LegacyEncoder::GpuH265,
        }),
        VideoAnalysis::default(),
    );
    assert!(!req.generate_thumbnail);
    assert!(!req.cleanup_original);
}
