use crate::stats::Phase;

/// Receives pipeline progress: the current phase and an overall
/// percentage (0.0 -- 100.0).
pub struct ProgressSender {
    callback: Box<dyn Fn(Phase, f32) + Send + Sync>,
}

impl ProgressSender {
    pub fn new(callback: impl Fn(Phase, f32) + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }

    /// A sender that discards every report.
    pub fn noop() -> Self {
        Self {
            callback: Box::new(|_, _| {}),
        }
    }

    pub fn send(&self, phase: Phase, percent: f32) {
        (self.callback)(phase, percent.clamp(0.0, 100.0));
    }
}

impl std::fmt::Debug for ProgressSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSender").finish_non_exhaustive()
    }
}

/// Share of the overall progress bar given to each phase. Transcoding
/// dominates wall time, packaging comes second.
pub(crate) fn phase_span(phase: Phase) -> (f32, f32) {
    match phase {
        Phase::Validation => (0.0, 1.0),
        Phase::WorkspaceSetup => (1.0, 2.0),
        Phase::KeyGeneration => (2.0, 5.0),
        Phase::Transcoding => (5.0, 85.0),
        Phase::Packaging => (85.0, 96.0),
        Phase::Thumbnail => (96.0, 99.0),
        Phase::Cleanup => (99.0, 100.0),
    }
}

/// Map a within-phase percentage onto the overall scale.
pub(crate) fn overall_percent(phase: Phase, within: f64) -> f32 {
    let (start, end) = phase_span(phase);
    start + (end - start) * (within.clamp(0.0, 100.0) as f32 / 100.0)
}
