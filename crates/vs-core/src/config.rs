//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from JSON and carries all
//! sub-configs for storage, tools, keys, transcoding, packaging and
//! thumbnails. Every section defaults sensibly so a completely empty `{}`
//! file is valid. A handful of settings can be overridden from the
//! environment via [`Config::apply_env_overrides`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::Error;

/// Seed used when nothing else is configured. [`Config::validate`] warns
/// about it.
pub const DEV_MASTER_SEED: &str = "vaultstream-development-seed";

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub tools: ToolsConfig,
    pub keys: KeyConfig,
    pub transcoding: TranscodingConfig,
    pub packaging: PackagingConfig,
    pub thumbnail: ThumbnailConfig,
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist. Environment overrides are
    /// applied on top in every case.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let mut config = match path {
            None => Self::default(),
            Some(path) => match std::fs::read_to_string(path) {
                Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                    tracing::warn!("Failed to parse config file {}: {e}", path.display());
                    Self::default()
                }),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::info!("No config file at {}; using defaults", path.display());
                    Self::default()
                }
                Err(e) => {
                    tracing::warn!("Failed to read config file {}: {e}", path.display());
                    Self::default()
                }
            },
        };
        config.apply_env_overrides();
        config
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// Unparseable numeric values are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("SEGMENT_DURATION") {
            match v.trim().parse::<u32>() {
                Ok(secs) if secs > 0 => self.packaging.segment_duration_secs = secs,
                _ => tracing::warn!("Ignoring invalid SEGMENT_DURATION value {v:?}"),
            }
        }
        if let Some(v) = lookup("VIDEO_KEY_MASTER_SEED") {
            self.keys.master_seed = v;
        }
        if let Some(v) = lookup("VIDEOS_DIR") {
            self.storage.videos_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FFMPEG_PATH") {
            self.tools.ffmpeg_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("FFPROBE_PATH") {
            self.tools.ffprobe_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("PACKAGER_PATH") {
            self.tools.packager_path = Some(PathBuf::from(v));
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.keys.master_seed.is_empty() {
            warnings.push("keys.master_seed is empty; key generation will fail".into());
        } else if self.keys.master_seed == DEV_MASTER_SEED {
            warnings.push(
                "keys.master_seed is the development default; set VIDEO_KEY_MASTER_SEED".into(),
            );
        }

        if self.keys.rounds < 10_000 {
            warnings.push(format!(
                "keys.rounds is {}; at least 10000 is recommended",
                self.keys.rounds
            ));
        }

        if self.storage.space_multiplier < 1.0 {
            warnings.push(format!(
                "storage.space_multiplier {} is below 1.0; disk checks will underestimate",
                self.storage.space_multiplier
            ));
        }

        if self.packaging.segment_duration_secs == 0 {
            warnings.push("packaging.segment_duration_secs is 0".into());
        }

        let valid = ["cenc", "cbcs", "none"];
        if !valid.contains(&self.packaging.encryption_scheme.as_str()) {
            warnings.push(format!(
                "packaging.encryption_scheme '{}' is not recognized (valid: {})",
                self.packaging.encryption_scheme,
                valid.join(", ")
            ));
        }

        if self.packaging.encryption_scheme != "none" && self.keys.master_seed.is_empty() {
            warnings.push("encryption is enabled but no master seed is configured".into());
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Where processed videos live and how much headroom a job needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root under which every video gets its own workspace directory.
    pub videos_dir: PathBuf,
    /// Required free space as a multiple of the input file size.
    pub space_multiplier: f64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            videos_dir: PathBuf::from("./data/videos"),
            space_multiplier: 3.0,
        }
    }
}

/// Paths to external CLI tools. Unset entries are looked up in `PATH`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
    pub packager_path: Option<PathBuf>,
    pub nvidia_smi_path: Option<PathBuf>,
}

/// Per-video key derivation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    pub master_seed: String,
    pub salt_prefix: String,
    pub rounds: u32,
    /// Base URL written to line 1 of `keyinfo.txt`.
    pub key_url_base: String,
    /// Whether to write the legacy `keyinfo.txt` companion file.
    pub legacy_keyinfo: bool,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            master_seed: DEV_MASTER_SEED.into(),
            salt_prefix: "video-key-salt-".into(),
            rounds: 100_000,
            key_url_base: "/api/videos".into(),
            legacy_keyinfo: true,
        }
    }
}

/// Transcoding engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodingConfig {
    /// Per-invocation timeout for an encode pass.
    pub timeout_secs: u64,
    /// Timeout for the 1-frame hardware encoder probe.
    pub hw_probe_timeout_secs: u64,
}

impl Default for TranscodingConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 86_400,
            hw_probe_timeout_secs: 15,
        }
    }
}

/// Segment packager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackagingConfig {
    pub segment_duration_secs: u32,
    /// `cenc`, `cbcs` or `none`.
    pub encryption_scheme: String,
    pub drm_label: Option<String>,
    pub static_live_manifest: bool,
    pub timeout_secs: u64,
}

impl Default for PackagingConfig {
    fn default() -> Self {
        Self {
            segment_duration_secs: 10,
            encryption_scheme: "cenc".into(),
            drm_label: None,
            static_live_manifest: false,
            timeout_secs: 3_600,
        }
    }
}

/// Thumbnail extraction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThumbnailConfig {
    pub width: u32,
    /// Position of the grabbed frame as a fraction of the duration.
    pub seek_fraction: f64,
    /// XOR-obfuscate the thumbnail with the per-video key.
    pub encrypt: bool,
    pub timeout_secs: u64,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            width: 640,
            seek_fraction: 0.1,
            encrypt: false,
            timeout_secs: 60,
        }
    }
}
