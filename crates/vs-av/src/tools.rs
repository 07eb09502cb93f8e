//! External tool detection and management.
//!
//! The [`ToolRegistry`] discovers the locations of the external CLI tools the
//! pipeline drives (ffmpeg, ffprobe, the Shaka packager, nvidia-smi) and
//! provides lookup methods for the rest of the crate.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::command::{ExecOptions, ProcessRunner};

/// Timeout for `--version` style invocations.
const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Logical tool names managed by the registry.
pub const FFMPEG: &str = "ffmpeg";
pub const FFPROBE: &str = "ffprobe";
pub const PACKAGER: &str = "packager";
pub const NVIDIA_SMI: &str = "nvidia-smi";

const KNOWN_TOOLS: &[&str] = &[FFMPEG, FFPROBE, PACKAGER, NVIDIA_SMI];

/// Executable names searched in `PATH` for each logical tool.
fn candidates(name: &str) -> &'static [&'static str] {
    match name {
        FFMPEG => &["ffmpeg"],
        FFPROBE => &["ffprobe"],
        PACKAGER => &["packager", "shaka-packager"],
        NVIDIA_SMI => &["nvidia-smi"],
        _ => &[],
    }
}

/// Availability information for a tool, returned by [`ToolRegistry::check_all`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInfo {
    /// Tool name.
    pub name: String,
    /// Whether the tool was found.
    pub available: bool,
    /// Version string (first line of the version output), if available.
    pub version: Option<String>,
    /// Resolved path to the executable.
    pub path: Option<PathBuf>,
}

impl ToolInfo {
    fn missing(name: &str) -> Self {
        Self {
            name: name.to_string(),
            available: false,
            version: None,
            path: None,
        }
    }
}

/// Registry holding discovered tool paths.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, PathBuf>,
}

impl ToolRegistry {
    /// Discover tools by searching `PATH` (or using overrides from config).
    ///
    /// A configured path is used when it exists; otherwise the candidate
    /// executable names are looked up with [`which::which`]. Tools that are
    /// not found are omitted from the registry.
    pub fn discover(tools_config: &vs_core::config::ToolsConfig) -> Self {
        let mut tools = HashMap::new();

        for &name in KNOWN_TOOLS {
            let custom_path = match name {
                FFMPEG => tools_config.ffmpeg_path.as_deref(),
                FFPROBE => tools_config.ffprobe_path.as_deref(),
                PACKAGER => tools_config.packager_path.as_deref(),
                NVIDIA_SMI => tools_config.nvidia_smi_path.as_deref(),
                _ => None,
            };

            let resolved = match custom_path {
                Some(p) if p.exists() => Some(p.to_path_buf()),
                Some(p) => {
                    tracing::warn!(
                        tool = name,
                        path = %p.display(),
                        "Configured tool path does not exist; searching PATH"
                    );
                    search_path(name)
                }
                None => search_path(name),
            };

            match resolved {
                Some(path) => {
                    tracing::debug!(tool = name, path = %path.display(), "Discovered tool");
                    tools.insert(name.to_string(), path);
                }
                None => tracing::debug!(tool = name, "Tool not found"),
            }
        }

        Self { tools }
    }

    /// Build a registry from explicit paths, bypassing discovery.
    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = (S, PathBuf)>,
        S: Into<String>,
    {
        Self {
            tools: paths.into_iter().map(|(n, p)| (n.into(), p)).collect(),
        }
    }

    /// Resolved path for `name`, if the tool was found.
    pub fn path(&self, name: &str) -> Option<&Path> {
        self.tools.get(name).map(PathBuf::as_path)
    }

    /// Resolved path for `name`, or [`vs_core::Error::NotFound`].
    pub fn require(&self, name: &str) -> vs_core::Result<&Path> {
        self.path(name).ok_or_else(|| {
            vs_core::Error::not_found("tool", format!("{name}; is it installed and in PATH?"))
        })
    }

    /// Check a single tool, detecting its version.
    pub async fn check(&self, runner: &ProcessRunner, name: &str) -> ToolInfo {
        match self.tools.get(name) {
            Some(path) => ToolInfo {
                name: name.to_string(),
                available: true,
                version: detect_version(runner, name, path).await,
                path: Some(path.clone()),
            },
            None => ToolInfo::missing(name),
        }
    }

    /// Check all known tools and return availability information.
    pub async fn check_all(&self, runner: &ProcessRunner) -> Vec<ToolInfo> {
        let mut infos = Vec::with_capacity(KNOWN_TOOLS.len());
        for &name in KNOWN_TOOLS {
            infos.push(self.check(runner, name).await);
        }
        infos
    }

    /// Iterate over all registered tools.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &PathBuf)> {
        self.tools.iter()
    }
}

fn search_path(name: &str) -> Option<PathBuf> {
    candidates(name)
        .iter()
        .find_map(|candidate| which::which(candidate).ok())
}

/// Run the tool's version query and return the first non-empty line.
async fn detect_version(runner: &ProcessRunner, name: &str, path: &Path) -> Option<String> {
    let args: Vec<String> = match name {
        FFMPEG | FFPROBE => vec!["-version".into()],
        NVIDIA_SMI => vec!["--query-gpu=driver_version".into(), "--format=csv,noheader".into()],
        _ => vec!["--version".into()],
    };

    let opts = ExecOptions::new().timeout(VERSION_TIMEOUT);
    let output = match runner.execute(path, &args, &opts).await {
        Ok(output) => output,
        Err(e) => {
            tracing::debug!(tool = name, "Version query failed: {e}");
            return None;
        }
    };

    // The packager prints its version on stderr.
    let text = output
        .stdout
        .filter(|s| !s.trim().is_empty())
        .or(output.stderr)?;
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}
