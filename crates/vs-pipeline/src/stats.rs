//! Phase bookkeeping for one orchestration run.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use vs_core::VideoId;

/// The pipeline phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Validation,
    WorkspaceSetup,
    KeyGeneration,
    Transcoding,
    Packaging,
    Thumbnail,
    Cleanup,
}

impl Phase {
    pub const ALL: [Phase; 7] = [
        Phase::Validation,
        Phase::WorkspaceSetup,
        Phase::KeyGeneration,
        Phase::Transcoding,
        Phase::Packaging,
        Phase::Thumbnail,
        Phase::Cleanup,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Validation => "validation",
            Phase::WorkspaceSetup => "workspace-setup",
            Phase::KeyGeneration => "key-generation",
            Phase::Transcoding => "transcoding",
            Phase::Packaging => "packaging",
            Phase::Thumbnail => "thumbnail",
            Phase::Cleanup => "cleanup",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accumulated wall time per phase. Serialized as a map of phase name to
/// milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhaseDurations {
    entries: [Duration; 7],
}

impl PhaseDurations {
    pub fn get(&self, phase: Phase) -> Duration {
        self.entries[phase.index()]
    }

    /// Add `elapsed` to `phase`. A phase that ran never records zero.
    pub fn record(&mut self, phase: Phase, elapsed: Duration) {
        self.entries[phase.index()] += elapsed.max(Duration::from_nanos(1));
    }

    pub fn iter(&self) -> impl Iterator<Item = (Phase, Duration)> + '_ {
        Phase::ALL.into_iter().map(move |p| (p, self.get(p)))
    }

    pub fn total(&self) -> Duration {
        self.entries.iter().sum()
    }
}

impl Serialize for PhaseDurations {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(Phase::ALL.len()))?;
        for (phase, elapsed) in self.iter() {
            map.serialize_entry(phase.as_str(), &as_millis(elapsed))?;
        }
        map.end()
    }
}

fn as_millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn serialize_millis<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(as_millis(*d))
}

/// Timing and outcome of one run, successful or not.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingStatistics {
    pub video_id: VideoId,
    pub phase_durations: PhaseDurations,
    #[serde(rename = "total_duration_ms", serialize_with = "serialize_millis")]
    pub total_duration: Duration,
    pub used_gpu: bool,
    pub codec_used: Option<String>,
    pub segment_count: usize,
    /// `input_size / output_size`, once both are known.
    pub compression_ratio: Option<f64>,
    pub input_size: u64,
    pub output_size: u64,
    pub succeeded: bool,
    pub failed_phase: Option<Phase>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ProcessingStatistics {
    pub fn new(video_id: VideoId) -> Self {
        Self {
            video_id,
            phase_durations: PhaseDurations::default(),
            total_duration: Duration::ZERO,
            used_gpu: false,
            codec_used: None,
            segment_count: 0,
            compression_ratio: None,
            input_size: 0,
            output_size: 0,
            succeeded: false,
            failed_phase: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Record the transcoded size and recompute the ratio.
    pub fn set_output_size(&mut self, output_size: u64) {
        self.output_size = output_size;
        self.compression_ratio =
            (output_size > 0).then(|| self.input_size as f64 / output_size as f64);
    }

    /// Stamp the end of the run. `failed_phase` is `None` on success.
    pub fn finish(&mut self, total: Duration, failed_phase: Option<Phase>) {
        self.total_duration = total;
        self.succeeded = failed_phase.is_none();
        self.failed_phase = failed_phase;
        self.finished_at = Some(Utc::now());
    }
}
