//! Encoding parameter model.
//!
//! [`EncodingOptions`] is an explicitly tagged choice between the legacy
//! preset shape and the enhanced shape. Everything downstream works on
//! [`EnhancedOptions`]; legacy requests are converted with
//! [`EncodingOptions::to_enhanced`].

use serde::{Deserialize, Serialize};

/// Hardware encoders whose quality value is at or below this run two-pass.
pub const TWO_PASS_MAX_QUALITY: u32 = 19;

/// Lower bound for an analysis-derived target video bitrate (kbps).
pub const MIN_TARGET_VIDEO_KBPS: u32 = 500;

/// Audio bitrate used when the source audio is re-encoded (kbps).
pub const DEFAULT_AUDIO_KBPS: u32 = 128;

/// Highest source AAC bitrate that is stream-copied instead of re-encoded.
const MAX_COPY_AUDIO_KBPS: u32 = 256;

/// Container overhead subtracted from the source bitrate (kbps).
const CONTAINER_OVERHEAD_KBPS: u32 = 50;

const HARDWARE_SUFFIXES: &[&str] = &["_nvenc", "_qsv", "_vaapi", "_videotoolbox", "_amf"];

/// Whether `codec` names a GPU / fixed-function encoder.
pub fn is_hardware_encoder(codec: &str) -> bool {
    HARDWARE_SUFFIXES.iter().any(|s| codec.ends_with(s))
}

/// Maximum video bitrate (kbps) for a source of the given height.
///
/// - 2160p and up: 15000
/// - 1440p: 9000
/// - 1080p: 6000
/// - 720p: 4000
/// - 480p: 2500
/// - below: 1500
///
/// Hardware encoders get a further 20% since they compress less
/// efficiently at equal bitrate.
pub fn bitrate_ladder_kbps(height: u32, hardware: bool) -> u32 {
    let base = match height {
        h if h >= 2160 => 15_000,
        h if h >= 1440 => 9_000,
        h if h >= 1080 => 6_000,
        h if h >= 720 => 4_000,
        h if h >= 480 => 2_500,
        _ => 1_500,
    };
    if hardware {
        base * 6 / 5
    } else {
        base
    }
}

/// Rate-control parameter selecting the quality flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityParam {
    Crf,
    Cq,
    Qp,
}

impl QualityParam {
    /// The engine flag for this parameter.
    pub fn flag(self) -> &'static str {
        match self {
            QualityParam::Crf => "-crf",
            QualityParam::Cq => "-cq",
            QualityParam::Qp => "-qp",
        }
    }
}

/// Audio stream handling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioSettings {
    /// `copy` or an encoder name.
    pub codec: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate_kbps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
}

impl AudioSettings {
    /// Stream-copy the source audio.
    pub fn copy() -> Self {
        Self {
            codec: "copy".into(),
            bitrate_kbps: None,
            channels: None,
            sample_rate: None,
        }
    }

    /// Re-encode to AAC at `bitrate_kbps`.
    pub fn aac(bitrate_kbps: u32) -> Self {
        Self {
            codec: "aac".into(),
            bitrate_kbps: Some(bitrate_kbps),
            channels: None,
            sample_rate: None,
        }
    }

    pub fn is_copy(&self) -> bool {
        self.codec == "copy"
    }

    /// `-c:a ...` plus bitrate, channel and sample-rate flags. Stream copy
    /// takes no further flags.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec!["-c:a".to_string(), self.codec.clone()];
        if self.is_copy() {
            return args;
        }
        if let Some(b) = self.bitrate_kbps {
            args.extend(["-b:a".to_string(), format!("{b}k")]);
        }
        if let Some(ch) = self.channels {
            args.extend(["-ac".to_string(), ch.to_string()]);
        }
        if let Some(sr) = self.sample_rate {
            args.extend(["-ar".to_string(), sr.to_string()]);
        }
        args
    }
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self::aac(DEFAULT_AUDIO_KBPS)
    }
}

/// Properties of the source file, supplied by the analysis collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoAnalysis {
    /// Seconds.
    pub duration: f64,
    /// Overall bitrate, kbps.
    pub bitrate: u32,
    /// Audio bitrate, kbps.
    pub audio_bitrate: u32,
    pub audio_codec: String,
    pub video_codec: String,
    /// Bytes.
    pub file_size: u64,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
}

/// Preset-based options kept for older callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LegacyEncoder {
    #[serde(rename = "cpu-h265")]
    CpuH265,
    #[serde(rename = "gpu-h265")]
    GpuH265,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyOptions {
    pub encoder: LegacyEncoder,
}

/// Full encoding parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnhancedOptions {
    /// Engine encoder name, e.g. `libx265` or `hevc_nvenc`.
    pub codec: String,
    pub preset: String,
    pub quality_param: QualityParam,
    pub quality_value: u32,
    /// Free-form flags inserted after the audio flags.
    #[serde(default)]
    pub additional_flags: Vec<String>,
    /// kbps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_video_bitrate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_settings: Option<AudioSettings>,
}

impl EnhancedOptions {
    /// Derive options for `codec` from a source analysis.
    ///
    /// Source AAC at up to 256 kbps is stream-copied; anything else is
    /// re-encoded to AAC 128k. The video target is the source bitrate minus
    /// audio and container overhead, never below 500 kbps.
    pub fn from_analysis(analysis: &VideoAnalysis, codec: &str) -> Self {
        let copy_audio = analysis.audio_codec.eq_ignore_ascii_case("aac")
            && analysis.audio_bitrate > 0
            && analysis.audio_bitrate <= MAX_COPY_AUDIO_KBPS;

        let (audio, audio_kbps) = if copy_audio {
            (AudioSettings::copy(), analysis.audio_bitrate)
        } else {
            (AudioSettings::aac(DEFAULT_AUDIO_KBPS), DEFAULT_AUDIO_KBPS)
        };

        let target = analysis
            .bitrate
            .saturating_sub(audio_kbps + CONTAINER_OVERHEAD_KBPS)
            .max(MIN_TARGET_VIDEO_KBPS);

        let (preset, quality_param) = default_rate_control(codec);
        Self {
            codec: codec.to_string(),
            preset: preset.to_string(),
            quality_param,
            quality_value: 23,
            additional_flags: Vec::new(),
            target_video_bitrate: Some(target),
            audio_settings: Some(audio),
        }
    }

    pub fn is_hardware(&self) -> bool {
        is_hardware_encoder(&self.codec)
    }

    /// Two-pass encoding applies to hardware encoders at near-lossless quality.
    pub fn requires_two_pass(&self) -> bool {
        self.is_hardware() && self.quality_value <= TWO_PASS_MAX_QUALITY
    }

    /// Reject options that would produce a malformed command line.
    pub fn validate(&self) -> vs_core::Result<()> {
        let invalid = |msg: String| Err(vs_core::Error::Validation(msg));

        if self.codec.trim().is_empty() || self.codec.contains(char::is_whitespace) {
            return invalid(format!("invalid video codec {:?}", self.codec));
        }
        if self.preset.trim().is_empty() || self.preset.contains(char::is_whitespace) {
            return invalid(format!("invalid preset {:?}", self.preset));
        }
        if self.quality_value > 51 {
            return invalid(format!(
                "quality value {} out of range 0-51",
                self.quality_value
            ));
        }
        if self.target_video_bitrate == Some(0) {
            return invalid("target video bitrate must be positive".into());
        }
        if self.additional_flags.iter().any(|f| f.is_empty()) {
            return invalid("additional flags must not contain empty entries".into());
        }
        if let Some(ref audio) = self.audio_settings {
            if audio.codec.trim().is_empty() {
                return invalid("audio codec must not be empty".into());
            }
            if audio.bitrate_kbps == Some(0) {
                return invalid("audio bitrate must be positive".into());
            }
        }
        Ok(())
    }
}

/// Default preset and quality parameter for an encoder family.
fn default_rate_control(codec: &str) -> (&'static str, QualityParam) {
    if codec.ends_with("_nvenc") {
        ("p4", QualityParam::Cq)
    } else if is_hardware_encoder(codec) {
        ("medium", QualityParam::Qp)
    } else {
        ("medium", QualityParam::Crf)
    }
}

/// Encoding options as accepted from callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum EncodingOptions {
    Legacy(LegacyOptions),
    Enhanced(EnhancedOptions),
}

impl EncodingOptions {
    /// The canonical enhanced form.
    pub fn to_enhanced(&self) -> EnhancedOptions {
        match self {
            EncodingOptions::Enhanced(opts) => opts.clone(),
            EncodingOptions::Legacy(LegacyOptions { encoder }) => {
                let (codec, preset, quality_param) = match encoder {
                    LegacyEncoder::CpuH265 => ("libx265", "medium", QualityParam::Crf),
                    LegacyEncoder::GpuH265 => ("hevc_nvenc", "p4", QualityParam::Cq),
                };
                EnhancedOptions {
                    codec: codec.into(),
                    preset: preset.into(),
                    quality_param,
                    quality_value: 23,
                    additional_flags: Vec::new(),
                    target_video_bitrate: None,
                    audio_settings: None,
                }
            }
        }
    }

    pub fn validate(&self) -> vs_core::Result<()> {
        self.to_enhanced().validate()
    }
}

impl From<EnhancedOptions> for EncodingOptions {
    fn from(opts: EnhancedOptions) -> Self {
        EncodingOptions::Enhanced(opts)
    }
}

/// Bitrate flags for one encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateControl {
    pub bitrate_kbps: u32,
    pub maxrate_kbps: u32,
    pub bufsize_kbps: u32,
}

impl RateControl {
    /// `-b:v` is the requested target capped at the ladder value, maxrate is
    /// the ladder value and bufsize twice that.
    pub fn for_options(opts: &EnhancedOptions, height: u32) -> Self {
        let ladder = bitrate_ladder_kbps(height, opts.is_hardware());
        let bitrate = opts
            .target_video_bitrate
            .map_or(ladder, |target| target.min(ladder));
        Self {
            bitrate_kbps: bitrate,
            maxrate_kbps: ladder,
            bufsize_kbps: ladder * 2,
        }
    }

    pub fn to_args(self) -> Vec<String> {
        vec![
            "-b:v".into(),
            format!("{}k", self.bitrate_kbps),
            "-maxrate".into(),
            format!("{}k", self.maxrate_kbps),
            "-bufsize".into(),
            format!("{}k", self.bufsize_kbps),
        ]
    }
}
