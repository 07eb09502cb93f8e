//! Best-effort report of what the host can run.

use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use vs_av::tools::{FFMPEG, FFPROBE, NVIDIA_SMI, PACKAGER};
use vs_av::{ExecOptions, ProcessRunner, ToolInfo, ToolRegistry, WorkspaceManager};

const GPU_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiskStatus {
    pub available_bytes: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GpuStatus {
    pub available: bool,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemRequirements {
    pub ffmpeg: ToolInfo,
    pub ffprobe: ToolInfo,
    pub packager: ToolInfo,
    pub disk: DiskStatus,
    pub gpu: GpuStatus,
}

impl SystemRequirements {
    /// Whether the mandatory tools are all present.
    pub fn can_process(&self) -> bool {
        self.ffmpeg.available && self.packager.available
    }

    /// Probe every requirement. Individual failures are reported as
    /// unavailable, never returned as errors.
    pub async fn probe(
        runner: &ProcessRunner,
        tools: &ToolRegistry,
        workspaces: &WorkspaceManager,
    ) -> Self {
        let disk = match workspaces.disk_usage().await {
            Ok(usage) => DiskStatus {
                available_bytes: usage.available_bytes,
                total_bytes: usage.total_bytes,
            },
            Err(e) => {
                tracing::warn!(
                    dir = %workspaces.base_dir().display(),
                    "Disk usage query failed: {e}"
                );
                DiskStatus::default()
            }
        };

        let gpu = match tools.path(NVIDIA_SMI) {
            Some(path) => query_gpu(runner, path).await,
            None => GpuStatus::default(),
        };

        Self {
            ffmpeg: tools.check(runner, FFMPEG).await,
            ffprobe: tools.check(runner, FFPROBE).await,
            packager: tools.check(runner, PACKAGER).await,
            disk,
            gpu,
        }
    }
}

async fn query_gpu(runner: &ProcessRunner, nvidia_smi: &Path) -> GpuStatus {
    let args = ["--query-gpu=name".to_string(), "--format=csv,noheader".to_string()];
    let opts = ExecOptions::new().timeout(GPU_QUERY_TIMEOUT);
    match runner.execute(nvidia_smi, &args, &opts).await {
        Ok(output) => {
            let name = output
                .stdout
                .as_deref()
                .and_then(|s| s.lines().map(str::trim).find(|l| !l.is_empty()))
                .map(str::to_string);
            GpuStatus {
                available: name.is_some(),
                name,
            }
        }
        Err(e) => {
            tracing::debug!("GPU query failed: {e}");
            GpuStatus::default()
        }
    }
}
