//! Best-effort progress extraction from tool output.
//!
//! Two shapes are recognised: the engine status line
//! (`frame= 120 fps=24 ... time=00:00:05.00 ... speed=2.0x`) and a generic
//! `NN%` / `NN.N%` token as printed by the packager. Anything else yields
//! `None`; progress is informational and never affects the outcome.

use std::sync::{Arc, LazyLock};

use regex::Regex;

static PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3}(?:\.\d+)?)\s*%").expect("valid regex"));
static FRAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"frame=\s*(\d+)").expect("valid regex"));
static FPS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"fps=\s*(\d+(?:\.\d+)?)").expect("valid regex"));
static TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"time=\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("valid regex")
});
static SPEED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"speed=\s*(\d+(?:\.\d+)?)x").expect("valid regex"));

/// Callback receiving progress updates from a long-running tool.
pub type ProgressCallback = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;

/// Progress information extracted from one chunk of output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    /// 0.0 -- 100.0
    pub percent: Option<f64>,
    pub frame: Option<u64>,
    pub fps: Option<f64>,
    /// Media time processed so far, in seconds.
    pub time_secs: Option<f64>,
    /// Processing speed as a multiple of real time.
    pub speed: Option<f64>,
    /// Remaining time, `MM:SS` or `HH:MM:SS`.
    pub eta: Option<String>,
}

/// Parse a chunk of tool output.
///
/// When a chunk holds several status lines the last one wins. With
/// `total_duration_secs`, engine output also yields `percent` (clamped to
/// 0..=100) and, when a speed is known, `eta`.
pub fn parse_progress(chunk: &str, total_duration_secs: Option<f64>) -> Option<ProgressUpdate> {
    let mut update = ProgressUpdate {
        frame: last_capture(&FRAME_RE, chunk).and_then(|c| c.parse().ok()),
        fps: last_capture(&FPS_RE, chunk).and_then(|c| c.parse().ok()),
        time_secs: TIME_RE
            .captures_iter(chunk)
            .last()
            .and_then(|caps| {
                let h: f64 = caps[1].parse().ok()?;
                let m: f64 = caps[2].parse().ok()?;
                let s: f64 = caps[3].parse().ok()?;
                Some(h * 3600.0 + m * 60.0 + s)
            }),
        speed: last_capture(&SPEED_RE, chunk).and_then(|c| c.parse().ok()),
        ..Default::default()
    };

    match (update.time_secs, total_duration_secs) {
        (Some(current), Some(total)) if total > 0.0 => {
            update.percent = Some((current / total * 100.0).clamp(0.0, 100.0));
            if let Some(speed) = update.speed.filter(|s| *s > 0.0) {
                let remaining = ((total - current) / speed).max(0.0);
                update.eta = Some(format_eta(remaining));
            }
        }
        _ => {
            if update.time_secs.is_none() {
                update.percent = last_capture(&PERCENT_RE, chunk)
                    .and_then(|c| c.parse::<f64>().ok())
                    .map(|p| p.clamp(0.0, 100.0));
            }
        }
    }

    if update == ProgressUpdate::default() {
        None
    } else {
        Some(update)
    }
}

/// Format seconds as `MM:SS`, or `HH:MM:SS` from one hour upwards.
pub fn format_eta(secs: f64) -> String {
    let total = secs.max(0.0) as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h:02}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}

fn last_capture<'a>(re: &Regex, text: &'a str) -> Option<&'a str> {
    re.captures_iter(text)
        .last()
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}
