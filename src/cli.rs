use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "vaultstream")]
#[command(author, version, about = "Transcode, encrypt and package videos as DASH assets")]
pub struct Cli {
    /// Path to config file (JSON)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Preset encoders accepted by `--encoder`.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum EncoderPreset {
    CpuH265,
    GpuH265,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the full pipeline for one video
    Process {
        /// Video id; becomes the workspace directory name
        video_id: String,

        /// Uploaded source file
        input: PathBuf,

        /// JSON file with the source analysis
        #[arg(long)]
        analysis: Option<PathBuf>,

        /// JSON file with explicit encoding options (tagged by "kind")
        #[arg(long, conflicts_with_all = ["encoder", "codec"])]
        options: Option<PathBuf>,

        /// Preset encoder, used when neither --options nor --analysis is given
        #[arg(long, value_enum, default_value = "cpu-h265")]
        encoder: EncoderPreset,

        /// Encoder for options derived from --analysis
        #[arg(long, requires = "analysis")]
        codec: Option<String>,

        /// Extract a thumbnail
        #[arg(long)]
        thumbnail: bool,

        /// Delete the input after a successful run
        #[arg(long)]
        cleanup_original: bool,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Report tool, disk and GPU availability
    Check {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Derive the content key for a video
    Key {
        video_id: String,

        /// Also write key.bin into the video workspace
        #[arg(long)]
        store: bool,
    },

    /// Remove a video workspace
    Cleanup {
        video_id: String,

        /// Only remove intermediate and temporary files
        #[arg(long)]
        temp_only: bool,
    },

    /// Show the encoding options derived from an analysis
    Options {
        /// JSON file with the source analysis
        analysis: PathBuf,

        /// Encoder to derive options for
        #[arg(long, default_value = "libx265")]
        codec: String,
    },

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses --config if not specified)
        config: Option<PathBuf>,
    },
}
