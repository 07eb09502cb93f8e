use thiserror::Error;
use vs_core::VideoId;

use crate::stats::{Phase, ProcessingStatistics};

/// A failed orchestration run, tagged with the phase that failed.
#[derive(Debug, Error)]
#[error("{phase} failed for video {video_id}: {source}")]
pub struct OrchestrationError {
    pub phase: Phase,
    pub video_id: VideoId,
    #[source]
    pub source: vs_core::Error,
    /// Statistics of the failed run, as recorded in the statistics cache.
    pub statistics: Box<ProcessingStatistics>,
}

impl OrchestrationError {
    /// Stable machine code of the underlying error.
    pub fn code(&self) -> &'static str {
        self.source.code()
    }
}
