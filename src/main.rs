mod cli;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands, EncoderPreset};
use vs_av::{EncodingOptions, EnhancedOptions, LegacyEncoder, LegacyOptions, VideoAnalysis};
use vs_core::config::Config;
use vs_core::VideoId;
use vs_pipeline::{OrchestrationRequest, Orchestrator, ProgressSender};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG if set, otherwise pick levels from the verbose flag.
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "vaultstream=trace,vs_pipeline=trace,vs_av=debug,vs_core=debug".to_string()
        } else {
            "vaultstream=info,vs_pipeline=info,vs_av=info,vs_core=warn".to_string()
        }
    });

    // Logs go to stderr so --json output stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load_or_default(cli.config.as_deref());
    let rt = tokio::runtime::Runtime::new()?;

    match cli.command {
        Commands::Process {
            video_id,
            input,
            analysis,
            options,
            encoder,
            codec,
            thumbnail,
            cleanup_original,
            json,
        } => {
            let video_id = VideoId::new(video_id)?;
            let analysis = match analysis {
                Some(path) => read_json::<VideoAnalysis>(&path)?,
                None => VideoAnalysis::default(),
            };
            let encoding_options = match (options, codec) {
                (Some(path), _) => read_json::<EncodingOptions>(&path)?,
                (None, Some(codec)) => EnhancedOptions::from_analysis(&analysis, &codec).into(),
                (None, None) => legacy_options(encoder),
            };
            let request = OrchestrationRequest::new(video_id, input, encoding_options, analysis)
                .with_thumbnail(thumbnail)
                .with_cleanup_original(cleanup_original);
            rt.block_on(process(&config, request, json))
        }
        Commands::Check { json } => rt.block_on(check(&config, json)),
        Commands::Key { video_id, store } => rt.block_on(key(&config, &video_id, store)),
        Commands::Cleanup { video_id, temp_only } => {
            rt.block_on(cleanup(&config, &video_id, temp_only))
        }
        Commands::Options { analysis, codec } => show_options(&analysis, &codec),
        Commands::Validate { config: path } => {
            let path = path.or(cli.config);
            validate_config(path.as_deref())
        }
    }
}

fn legacy_options(encoder: EncoderPreset) -> EncodingOptions {
    let encoder = match encoder {
        EncoderPreset::CpuH265 => LegacyEncoder::CpuH265,
        EncoderPreset::GpuH265 => LegacyEncoder::GpuH265,
    };
    EncodingOptions::Legacy(LegacyOptions { encoder })
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

fn orchestrator(config: &Config) -> Result<Orchestrator> {
    for warning in config.validate() {
        tracing::warn!("Config: {warning}");
    }
    Ok(Orchestrator::from_config(config)?)
}

async fn process(config: &Config, request: OrchestrationRequest, json: bool) -> Result<()> {
    let orchestrator = orchestrator(config)?.with_progress(ProgressSender::new(|phase, pct| {
        tracing::debug!(phase = %phase, percent = format!("{pct:.1}"), "Progress");
    }));

    let video_id = request.video_id.clone();
    let result = match orchestrator.execute(request).await {
        Ok(result) => result,
        Err(e) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&e.statistics)?);
            }
            anyhow::bail!(
                "processing {video_id} failed in phase {} [{}]: {}",
                e.phase,
                e.code(),
                e.source
            );
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    let stats = &result.statistics;
    println!("Video: {}", result.video_id);
    println!("Manifest: {}", result.manifest_path.display());
    if let Some(ref path) = result.thumbnail_path {
        println!("Thumbnail: {}", path.display());
    }
    if let Some(ref path) = result.key_path {
        println!("Key: {}", path.display());
    }
    println!(
        "Codec: {} ({})",
        stats.codec_used.as_deref().unwrap_or("unknown"),
        if stats.used_gpu { "GPU" } else { "CPU" }
    );
    println!("Segments: {}", stats.segment_count);
    if let Some(ratio) = stats.compression_ratio {
        println!("Compression: {ratio:.2}x");
    }
    println!("\nPhase timings:");
    for (phase, elapsed) in stats.phase_durations.iter() {
        println!("  {:<16} {:>10.1} ms", phase.as_str(), elapsed.as_secs_f64() * 1000.0);
    }
    println!("  {:<16} {:>10.1} ms", "total", stats.total_duration.as_secs_f64() * 1000.0);
    Ok(())
}

async fn check(config: &Config, json: bool) -> Result<()> {
    let report = orchestrator(config)?.check_system_requirements().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Checking external tools...\n");
    for tool in [&report.ffmpeg, &report.ffprobe, &report.packager] {
        let status = if tool.available { "✓" } else { "✗" };
        print!("{} {}", status, tool.name);
        if let Some(ref version) = tool.version {
            print!(" ({version})");
        }
        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }
        println!();
    }

    match report.gpu.name {
        Some(ref name) => println!("✓ GPU ({name})"),
        None => println!("✗ GPU (none detected)"),
    }
    println!(
        "\nDisk: {} of {} bytes available",
        report.disk.available_bytes, report.disk.total_bytes
    );

    println!();
    if report.can_process() {
        println!("All required tools are available!");
    } else {
        println!(
            "Some tools are missing. Install ffmpeg and the Shaka packager to process videos."
        );
    }
    Ok(())
}

async fn key(config: &Config, video_id: &str, store: bool) -> Result<()> {
    let video_id = VideoId::new(video_id)?;
    let orchestrator = orchestrator(config)?;
    let keys = orchestrator.keys();

    if store {
        let material = keys.generate_and_store_key(&video_id).await?;
        println!("{}", material.key_path.display());
    } else {
        let key = keys.derive_key(&video_id).await?;
        println!("{}", hex::encode(key));
    }
    Ok(())
}

async fn cleanup(config: &Config, video_id: &str, temp_only: bool) -> Result<()> {
    let video_id = VideoId::new(video_id)?;
    let orchestrator = orchestrator(config)?;
    let workspaces = orchestrator.workspaces();

    let report = if temp_only {
        let ws = workspaces.get_workspace(&video_id).await?;
        orchestrator.keys().cleanup_temp_files(&video_id).await?;
        workspaces.cleanup_temp_files(&ws).await
    } else {
        workspaces.cleanup_workspace(&video_id).await
    };

    println!("Freed {} bytes ({} items)", report.bytes_freed, report.removed.len());
    for error in &report.errors {
        eprintln!("  error: {error}");
    }
    if !report.is_clean() {
        anyhow::bail!("cleanup of {video_id} was incomplete");
    }
    Ok(())
}

fn show_options(analysis: &Path, codec: &str) -> Result<()> {
    let analysis = read_json::<VideoAnalysis>(analysis)?;
    let options: EncodingOptions = EnhancedOptions::from_analysis(&analysis, codec).into();
    options.validate()?;
    println!("{}", serde_json::to_string_pretty(&options)?);
    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {}", p.display());
            let text = std::fs::read_to_string(p)
                .with_context(|| format!("failed to read {}", p.display()))?;
            let mut config = Config::from_json(&text)?;
            config.apply_env_overrides();
            config
        }
        None => {
            println!("No config file specified, using defaults");
            Config::load_or_default(None)
        }
    };

    let warnings = config.validate();
    if warnings.is_empty() {
        println!("✓ Configuration is valid");
    } else {
        for warning in &warnings {
            println!("! {warning}");
        }
    }
    println!("  Videos dir: {}", config.storage.videos_dir.display());
    println!("  Encryption: {}", config.packaging.encryption_scheme);
    println!("  Segment duration: {}s", config.packaging.segment_duration_secs);
    println!("  PBKDF2 rounds: {}", config.keys.rounds);
    Ok(())
}
