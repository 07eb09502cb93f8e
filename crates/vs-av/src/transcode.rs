//! Transcoding adapter.
//!
//! Turns [`EnhancedOptions`] into ffmpeg command lines and runs them through
//! the [`ProcessRunner`]. Hardware encoders are probed once per codec before
//! first use; a failed probe fails the job instead of silently falling back
//! to a software encoder.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use vs_core::config::TranscodingConfig;
use vs_core::{Cache, Error, Result};

use crate::classify::{classify_transcode_failure, summarize_stderr};
use crate::command::{ExecOptions, ProcessRunner};
use crate::encoding::{EnhancedOptions, RateControl, VideoAnalysis};
use crate::progress::ProgressCallback;
use crate::tools::{ToolRegistry, FFMPEG};
use crate::workspace::TWO_PASS_LOG_PREFIX;

#[cfg(windows)]
const NULL_SINK: &str = "NUL";
#[cfg(not(windows))]
const NULL_SINK: &str = "/dev/null";

/// Synthetic source for the hardware probe: one second of black frames at
/// the smallest size every hardware encoder accepts.
const PROBE_SOURCE: &str = "color=c=black:s=256x256:d=1";

/// Cached outcome of a hardware encoder probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderAvailability {
    /// Whether the encoder produced a frame on this host.
    pub available: bool,
    /// Why it is unusable, usually the tail of the probe's stderr.
    pub reason: Option<String>,
}

impl EncoderAvailability {
    pub fn available() -> Self {
        Self {
            available: true,
            reason: None,
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            reason: Some(reason.into()),
        }
    }
}

/// Decides whether an encoder can actually be used on this host.
#[async_trait]
pub trait EncoderProber: Send + Sync {
    async fn probe(&self, codec: &str) -> EncoderAvailability;
}

/// Probes by encoding a single synthetic frame with ffmpeg.
pub struct FfmpegEncoderProber {
    runner: Arc<ProcessRunner>,
    ffmpeg: Option<PathBuf>,
    timeout: Duration,
}

impl FfmpegEncoderProber {
    pub fn new(runner: Arc<ProcessRunner>, ffmpeg: Option<PathBuf>, timeout: Duration) -> Self {
        Self {
            runner,
            ffmpeg,
            timeout,
        }
    }

    pub fn probe_args(codec: &str) -> Vec<String> {
        [
            "-hide_banner",
            "-loglevel",
            "error",
            "-f",
            "lavfi",
            "-i",
            PROBE_SOURCE,
            "-frames:v",
            "1",
            "-c:v",
            codec,
            "-f",
            "null",
            "-",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

#[async_trait]
impl EncoderProber for FfmpegEncoderProber {
    async fn probe(&self, codec: &str) -> EncoderAvailability {
        let Some(ref ffmpeg) = self.ffmpeg else {
            return EncoderAvailability::unavailable("ffmpeg not found");
        };
        let opts = ExecOptions::new().timeout(self.timeout);
        match self
            .runner
            .execute(ffmpeg, &Self::probe_args(codec), &opts)
            .await
        {
            Ok(_) => EncoderAvailability::available(),
            Err(Error::ProcessExecution { stderr, .. }) if !stderr.is_empty() => {
                EncoderAvailability::unavailable(summarize_stderr(&stderr))
            }
            Err(e) => EncoderAvailability::unavailable(e.to_string()),
        }
    }
}

/// One encode job.
#[derive(Clone)]
pub struct TranscodeRequest {
    /// Source file.
    pub input: PathBuf,
    /// Intermediate MP4 to write.
    pub output: PathBuf,
    /// Encoder, quality and audio settings.
    pub options: EnhancedOptions,
    /// Source properties; `height` picks the bitrate tier and `duration`
    /// turns progress lines into percentages.
    pub analysis: VideoAnalysis,
    /// Directory receiving two-pass statistics files.
    pub passlog_dir: PathBuf,
    /// Kill label for the engine process.
    pub label: Option<String>,
    /// Called for every parsed progress line.
    pub progress: Option<ProgressCallback>,
}

/// Outcome of a successful encode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscodeResult {
    /// The encoded file, same as the request's `output`.
    pub output_path: PathBuf,
    /// Wall-clock time of all passes.
    pub duration: Duration,
    /// Whether a hardware encoder was used.
    pub used_gpu: bool,
    /// Encoder name passed to the engine.
    pub codec: String,
    /// Size of the output in bytes, never zero.
    pub file_size: u64,
    /// Whether the encode ran an analysis pass first.
    pub two_pass: bool,
}

/// Seam between the orchestrator and the encode implementation.
#[async_trait]
pub trait VideoTranscoder: Send + Sync {
    async fn transcode(&self, request: TranscodeRequest) -> Result<TranscodeResult>;

    /// Whether `codec` is usable; cached after the first call.
    async fn check_encoder(&self, codec: &str) -> EncoderAvailability;
}

/// Which invocation of a (possibly two-pass) encode an argument list is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodePass {
    Single,
    /// Analysis pass writing statistics to the given prefix.
    First(PathBuf),
    /// Output pass reading statistics from the given prefix.
    Second(PathBuf),
}

/// Build the ffmpeg argument list for one pass.
pub fn build_encode_args(
    input: &Path,
    output: &Path,
    options: &EnhancedOptions,
    rate: RateControl,
    pass: &EncodePass,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-y".into(),
        "-hide_banner".into(),
        "-i".into(),
        input.to_string_lossy().into_owned(),
        "-c:v".into(),
        options.codec.clone(),
        options.quality_param.flag().into(),
        options.quality_value.to_string(),
        "-preset".into(),
        options.preset.clone(),
    ];
    args.extend(rate.to_args());

    let audio = options.audio_settings.clone().unwrap_or_default();
    args.extend(audio.to_args());
    args.extend(options.additional_flags.iter().cloned());

    match pass {
        EncodePass::Single => {}
        EncodePass::First(prefix) | EncodePass::Second(prefix) => {
            let n = if matches!(pass, EncodePass::First(_)) { "1" } else { "2" };
            args.extend([
                "-pass".into(),
                n.into(),
                "-passlogfile".into(),
                prefix.to_string_lossy().into_owned(),
            ]);
        }
    }

    if matches!(pass, EncodePass::First(_)) {
        args.extend(["-f".into(), "null".into(), NULL_SINK.into()]);
    } else {
        args.extend([
            "-f".into(),
            "mp4".into(),
            "-movflags".into(),
            "+faststart".into(),
            output.to_string_lossy().into_owned(),
        ]);
    }
    args
}

/// ffmpeg-backed [`VideoTranscoder`].
pub struct Transcoder {
    runner: Arc<ProcessRunner>,
    ffmpeg: Option<PathBuf>,
    prober: Arc<dyn EncoderProber>,
    encoder_cache: Arc<dyn Cache<String, EncoderAvailability>>,
    probe_lock: tokio::sync::Mutex<()>,
    timeout: Duration,
}

impl Transcoder {
    pub fn new(
        runner: Arc<ProcessRunner>,
        tools: &ToolRegistry,
        encoder_cache: Arc<dyn Cache<String, EncoderAvailability>>,
        config: &TranscodingConfig,
    ) -> Self {
        let ffmpeg = tools.path(FFMPEG).map(Path::to_path_buf);
        let prober = Arc::new(FfmpegEncoderProber::new(
            runner.clone(),
            ffmpeg.clone(),
            Duration::from_secs(config.hw_probe_timeout_secs),
        ));
        Self {
            runner,
            ffmpeg,
            prober,
            encoder_cache,
            probe_lock: tokio::sync::Mutex::new(()),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Replace the hardware prober.
    pub fn with_prober(mut self, prober: Arc<dyn EncoderProber>) -> Self {
        self.prober = prober;
        self
    }

    pub fn encoder_cache(&self) -> &Arc<dyn Cache<String, EncoderAvailability>> {
        &self.encoder_cache
    }

    async fn run_pass(
        &self,
        ffmpeg: &Path,
        args: &[String],
        request: &TranscodeRequest,
    ) -> Result<()> {
        let mut opts = ExecOptions::new().timeout(self.timeout).capture(false, true);
        if let Some(ref label) = request.label {
            opts = opts.label(label.clone());
        }

        let result = match request.progress {
            Some(ref callback) => {
                let total = (request.analysis.duration > 0.0).then_some(request.analysis.duration);
                self.runner
                    .execute_with_streaming(ffmpeg, args, &opts, total, |update| {
                        callback(&update)
                    })
                    .await
            }
            None => self.runner.execute(ffmpeg, args, &opts).await,
        };

        result
            .map(|_| ())
            .map_err(|e| classify_transcode_failure(e, &request.options.codec))
    }

    async fn encode(
        &self,
        ffmpeg: &Path,
        request: &TranscodeRequest,
        rate: RateControl,
        two_pass: bool,
    ) -> Result<()> {
        let opts = &request.options;
        let args_for = |pass: EncodePass| {
            build_encode_args(&request.input, &request.output, opts, rate, &pass)
        };
        if !two_pass {
            return self.run_pass(ffmpeg, &args_for(EncodePass::Single), request).await;
        }

        let prefix = request.passlog_dir.join(TWO_PASS_LOG_PREFIX);
        let outcome = async {
            tracing::info!(codec = %opts.codec, "Two-pass encode: analysis pass");
            let first = args_for(EncodePass::First(prefix.clone()));
            self.run_pass(ffmpeg, &first, request).await?;

            tracing::info!(codec = %opts.codec, "Two-pass encode: output pass");
            let second = args_for(EncodePass::Second(prefix.clone()));
            self.run_pass(ffmpeg, &second, request).await
        }
        .await;

        remove_pass_logs(&prefix).await;
        outcome
    }
}

/// Remove `<prefix>-0.log` and `<prefix>-0.log.mbtree`, ignoring absence.
async fn remove_pass_logs(prefix: &Path) {
    let base = prefix.to_string_lossy();
    for suffix in ["-0.log", "-0.log.mbtree"] {
        let path = PathBuf::from(format!("{base}{suffix}"));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => tracing::debug!(path = %path.display(), "Removed two-pass log"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), "Failed to remove two-pass log: {e}")
            }
        }
    }
}

#[async_trait]
impl VideoTranscoder for Transcoder {
    async fn check_encoder(&self, codec: &str) -> EncoderAvailability {
        let key = codec.to_string();
        if let Some(hit) = self.encoder_cache.get(&key) {
            return hit;
        }

        // Serialize first probes so each codec is probed at most once.
        let _guard = self.probe_lock.lock().await;
        if let Some(hit) = self.encoder_cache.get(&key) {
            return hit;
        }

        let result = self.prober.probe(codec).await;
        if result.available {
            tracing::info!(codec, "Hardware encoder available");
        } else {
            tracing::warn!(codec, reason = ?result.reason, "Hardware encoder unavailable");
        }
        self.encoder_cache.insert(key, result.clone());
        result
    }

    async fn transcode(&self, request: TranscodeRequest) -> Result<TranscodeResult> {
        let ffmpeg = self
            .ffmpeg
            .clone()
            .ok_or_else(|| Error::TranscodingUnavailable("ffmpeg not found".into()))?;
        let opts = &request.options;
        opts.validate()?;

        let used_gpu = opts.is_hardware();
        if used_gpu {
            let availability = self.check_encoder(&opts.codec).await;
            if !availability.available {
                return Err(Error::TranscodingUnavailable(format!(
                    "hardware encoder {} is not usable: {}",
                    opts.codec,
                    availability.reason.as_deref().unwrap_or("probe failed")
                )));
            }
        }

        let rate = RateControl::for_options(opts, request.analysis.height);
        let two_pass = opts.requires_two_pass();

        tracing::info!(
            input = %request.input.display(),
            output = %request.output.display(),
            codec = %opts.codec,
            preset = %opts.preset,
            quality = opts.quality_value,
            bitrate_kbps = rate.bitrate_kbps,
            maxrate_kbps = rate.maxrate_kbps,
            two_pass,
            "Starting transcode"
        );

        let started = Instant::now();
        self.encode(&ffmpeg, &request, rate, two_pass).await?;
        let duration = started.elapsed();

        let file_size = match tokio::fs::metadata(&request.output).await {
            Ok(meta) if meta.len() > 0 => meta.len(),
            _ => {
                return Err(Error::TranscodingFailed(format!(
                    "engine reported success but produced no output at {}",
                    request.output.display()
                )))
            }
        };

        tracing::info!(
            codec = %opts.codec,
            file_size,
            elapsed_ms = duration.as_millis() as u64,
            "Transcode finished"
        );

        Ok(TranscodeResult {
            output_path: request.output.clone(),
            duration,
            used_gpu,
            codec: opts.codec.clone(),
            file_size,
            two_pass,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{AudioSettings, QualityParam};
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vs_core::MemoryCache;

    struct CountingProber {
        calls: AtomicUsize,
        result: EncoderAvailability,
    }

    #[async_trait]
    impl EncoderProber for CountingProber {
        async fn probe(&self, _codec: &str) -> EncoderAvailability {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.result.clone()
        }
    }

    fn prober(result: EncoderAvailability) -> Arc<CountingProber> {
        Arc::new(CountingProber {
            calls: AtomicUsize::new(0),
            result,
        })
    }

    fn transcoder(ffmpeg: Option<PathBuf>, prober: Arc<CountingProber>) -> Transcoder {
        let tools = match ffmpeg {
            Some(p) => ToolRegistry::from_paths([(FFMPEG, p)]),
            None => ToolRegistry::default(),
        };
        Transcoder::new(
            Arc::new(ProcessRunner::new()),
            &tools,
            Arc::new(MemoryCache::<String, EncoderAvailability>::new()),
            &TranscodingConfig::default(),
        )
        .with_prober(prober)
    }

    fn options(codec: &str, quality_value: u32) -> EnhancedOptions {
        EnhancedOptions {
            codec: codec.into(),
            preset: "p4".into(),
            quality_param: QualityParam::Cq,
            quality_value,
            additional_flags: vec!["-tag:v".into(), "hvc1".into()],
            target_video_bitrate: Some(3_000),
            audio_settings: Some(AudioSettings::copy()),
        }
    }

    fn request(dir: &Path, opts: EnhancedOptions) -> TranscodeRequest {
        TranscodeRequest {
            input: dir.join("in.mov"),
            output: dir.join("out.mp4"),
            options: opts,
            analysis: VideoAnalysis {
                duration: 10.0,
                height: 1080,
                ..Default::default()
            },
            passlog_dir: dir.to_path_buf(),
            label: None,
            progress: None,
        }
    }

    #[test]
    fn single_pass_argument_order() {
        let opts = options("libx265", 23);
        let rate = RateControl::for_options(&opts, 1080);
        let args = build_encode_args(
            Path::new("/in.mov"),
            Path::new("/out.mp4"),
            &opts,
            rate,
            &EncodePass::Single,
        );
        assert_eq!(
            args,
            vec![
                "-y", "-hide_banner", "-i", "/in.mov", "-c:v", "libx265", "-cq", "23", "-preset",
                "p4", "-b:v", "3000k", "-maxrate", "6000k", "-bufsize", "12000k", "-c:a", "copy",
                "-tag:v", "hvc1", "-f", "mp4", "-movflags", "+faststart", "/out.mp4",
            ]
        );
    }

    #[test]
    fn first_pass_goes_to_null_muxer() {
        let opts = options("hevc_nvenc", 18);
        let rate = RateControl::for_options(&opts, 1080);
        let args = build_encode_args(
            Path::new("/in.mov"),
            Path::new("/out.mp4"),
            &opts,
            rate,
            &EncodePass::First(PathBuf::from("/tmp/ffmpeg2pass")),
        );
        let tail: Vec<&str> = args[args.len() - 7..].iter().map(String::as_str).collect();
        assert_eq!(
            tail,
            vec!["-pass", "1", "-passlogfile", "/tmp/ffmpeg2pass", "-f", "null", NULL_SINK]
        );
        assert!(args.contains(&"7200k".to_string()));
        assert!(!args.contains(&"/out.mp4".to_string()));
    }

    #[test]
    fn legacy_defaults_reencode_audio() {
        let mut opts = options("libx265", 23);
        opts.audio_settings = None;
        let args = build_encode_args(
            Path::new("in"),
            Path::new("out"),
            &opts,
            RateControl::for_options(&opts, 720),
            &EncodePass::Single,
        );
        let joined = args.join(" ");
        assert!(joined.contains("-c:a aac -b:a 128k"), "{joined}");
    }

    #[tokio::test]
    async fn probe_result_is_cached() {
        let fake = prober(EncoderAvailability::unavailable("No NVENC capable devices found"));
        let t = transcoder(None, fake.clone());

        let first = t.check_encoder("hevc_nvenc").await;
        let second = t.check_encoder("hevc_nvenc").await;
        assert!(!first.available);
        assert_eq!(first, second);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
        assert_eq!(t.encoder_cache().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_first_probes_run_once() {
        let fake = prober(EncoderAvailability::available());
        let t = transcoder(None, fake.clone());
        let (a, b) = tokio::join!(t.check_encoder("h264_qsv"), t.check_encoder("h264_qsv"));
        assert!(a.available && b.available);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unavailable_gpu_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let fake = prober(EncoderAvailability::unavailable("no device"));
        // The engine path does not exist: reaching it would surface as a
        // process error instead.
        let t = transcoder(Some(dir.path().join("missing-ffmpeg")), fake.clone());

        let err = t
            .transcode(request(dir.path(), options("hevc_nvenc", 23)))
            .await
            .unwrap_err();
        assert_matches!(err, Error::TranscodingUnavailable(ref m) if m.contains("no device"));
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_engine_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let t = transcoder(None, prober(EncoderAvailability::available()));
        let err = t
            .transcode(request(dir.path(), options("libx265", 23)))
            .await
            .unwrap_err();
        assert_matches!(err, Error::TranscodingUnavailable(_));
    }

    /// Shell stand-in for ffmpeg. Writes the pass logs it is pointed at and
    /// exits 1 on `failing_pass`, if given.
    #[cfg(unix)]
    fn fake_ffmpeg(dir: &Path, failing_pass: Option<u8>) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let script = dir.join("fake-ffmpeg");
        let body = format!(
            r#"#!/bin/sh
echo "$@" >> "{calls}"
prev=""
pass=""
for a in "$@"; do
  if [ "$prev" = "-passlogfile" ]; then
    echo stats > "$a-0.log"
    echo tree > "$a-0.log.mbtree"
  fi
  if [ "$prev" = "-pass" ]; then pass="$a"; fi
  prev="$a"
  last="$a"
done
echo "frame=  10 fps=5 time=00:00:05.00 speed=1.0x" >&2
if [ -n "$pass" ] && [ "$pass" = "{fail}" ]; then
  echo "Conversion failed!" >&2
  exit 1
fi
if [ "$last" != "{null}" ]; then printf encoded > "$last"; fi
"#,
            calls = dir.join("calls").display(),
            null = NULL_SINK,
            fail = failing_pass.map(|p| p.to_string()).unwrap_or_default(),
        );
        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn two_pass_runs_twice_and_removes_logs() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = fake_ffmpeg(dir.path(), None);
        let t = transcoder(Some(ffmpeg), prober(EncoderAvailability::available()));

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut req = request(dir.path(), options("hevc_nvenc", 18));
        req.progress = Some(Arc::new(move |u: &crate::ProgressUpdate| {
            sink.lock().unwrap().push(u.percent)
        }));

        let result = t.transcode(req).await.unwrap();
        assert!(result.two_pass);
        assert!(result.used_gpu);
        assert_eq!(result.file_size, 7);

        let calls = std::fs::read_to_string(dir.path().join("calls")).unwrap();
        let calls: Vec<&str> = calls.lines().collect();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].contains("-pass 1"));
        assert!(calls[1].contains("-pass 2"));

        assert!(!dir.path().join("ffmpeg2pass-0.log").exists());
        assert!(!dir.path().join("ffmpeg2pass-0.log.mbtree").exists());
        assert!(seen.lock().unwrap().contains(&Some(50.0)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_output_pass_still_removes_logs() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = fake_ffmpeg(dir.path(), Some(2));
        let t = transcoder(Some(ffmpeg), prober(EncoderAvailability::available()));

        let err = t
            .transcode(request(dir.path(), options("hevc_nvenc", 18)))
            .await
            .unwrap_err();
        assert_matches!(err, Error::TranscodingFailed(ref m) if m.contains("Conversion failed!"));

        let calls = std::fs::read_to_string(dir.path().join("calls")).unwrap();
        assert_eq!(calls.lines().count(), 2, "analysis pass should have completed");
        assert!(!dir.path().join("ffmpeg2pass-0.log").exists());
        assert!(!dir.path().join("ffmpeg2pass-0.log.mbtree").exists());
        assert!(!dir.path().join("out.mp4").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn software_encode_is_single_pass() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = fake_ffmpeg(dir.path(), None);
        let fake = prober(EncoderAvailability::available());
        let t = transcoder(Some(ffmpeg), fake.clone());

        let result = t
            .transcode(request(dir.path(), options("libx265", 10)))
            .await
            .unwrap();
        assert!(!result.two_pass);
        assert!(!result.used_gpu);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
        let calls = std::fs::read_to_string(dir.path().join("calls")).unwrap();
        assert_eq!(calls.lines().count(), 1);
    }
}
