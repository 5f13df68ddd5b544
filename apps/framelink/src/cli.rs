// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use framelink_api::LinkGraph;
use framelink_engine::Engine;
use schemars::schema_for;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config;
use crate::run::{self, RunOptions};

type LogInitFn =
    fn(
        &config::LogConfig,
        &config::TelemetryConfig,
    )
        -> Result<Option<tracing_appender::non_blocking::WorkerGuard>, Box<dyn std::error::Error>>;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "framelink.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs a pipeline and prints its statistics when it stops
    Run {
        /// Pipeline YAML; defaults to `run.pipeline` from the config
        pipeline: Option<PathBuf>,
        /// Seconds to run; defaults to `run.duration_secs`, then Ctrl-C
        #[arg(short, long)]
        duration: Option<u64>,
    },
    /// Compiles a pipeline and prints the resulting links without running it
    Validate {
        pipeline: PathBuf,
    },
    /// Lists the registered link kinds
    Links {
        /// Print full definitions, including parameter schemas, as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Generate a default config file and print it to stdout
    Default,
    /// Generate a JSON schema for the config and print it to stdout
    Schema,
}

/// Initialize telemetry (metrics) if enabled in configuration
/// Returns the meter provider that must be kept alive
#[allow(clippy::collection_is_never_read)] // Meter provider must be kept alive
fn init_telemetry_if_enabled(
    config: &config::Config,
) -> Option<opentelemetry_sdk::metrics::SdkMeterProvider> {
    if !config.telemetry.enable {
        return None;
    }

    match crate::telemetry::init_metrics(&config.telemetry) {
        Ok(provider) => {
            info!("OpenTelemetry metrics enabled");
            Some(provider)
        },
        Err(e) => {
            warn!(error = %e, "Failed to initialize OpenTelemetry metrics");
            None
        },
    }
}

fn pipeline_path(arg: Option<&Path>, config: &config::Config) -> anyhow::Result<PathBuf> {
    arg.map(Path::to_path_buf)
        .or_else(|| config.run.pipeline.as_ref().map(PathBuf::from))
        .ok_or_else(|| anyhow!("No pipeline given and `run.pipeline` is not configured"))
}

// Allow println for CLI output to stdout (intentional)
#[allow(clippy::disallowed_macros)]
async fn run_command(
    config: &config::Config,
    pipeline: Option<&Path>,
    duration: Option<u64>,
) -> anyhow::Result<()> {
    let path = pipeline_path(pipeline, config)?;
    let graph = run::load_graph(&path)?;
    let options = RunOptions {
        duration: duration.or(config.run.duration_secs).map(Duration::from_secs),
        stats_interval: (config.engine.stats_interval_secs > 0)
            .then(|| Duration::from_secs(config.engine.stats_interval_secs)),
    };

    info!(
        pipeline = %path.display(),
        links = graph.links.len(),
        contexts = ?graph.contexts(),
        mailbox_capacity = ?config.engine.resolved_mailbox_capacity(),
        "Starting FrameLink"
    );

    let engine = Engine::new();
    let system = engine.start_system(config.system_config()).context("Failed to start system")?;
    let result = run::run_graph(&system, &graph, &options).await;
    if let Err(e) = system.shutdown_and_wait().await {
        warn!(error = %e, "System shutdown was not clean");
    }

    let stats = result?;
    if config.run.print_stats_on_exit {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    }
    Ok(())
}

// Allow println for CLI output to stdout (intentional)
#[allow(clippy::disallowed_macros)]
fn print_graph(graph: &LinkGraph) {
    println!("Pipeline: {}", graph.name.as_deref().unwrap_or("(unnamed)"));
    if let Some(description) = &graph.description {
        println!("  {description}");
    }
    println!("Contexts: {}", graph.contexts().join(", "));
    println!("Links (creation order):");
    for link in &graph.links {
        let inputs: Vec<String> = link
            .params
            .in_queues
            .iter()
            .map(|q| {
                let producer = graph.link_by_id(q.prev_link).map_or("?", |l| l.name.as_str());
                format!("{producer}:{}", q.prev_queue)
            })
            .collect();
        println!(
            "  {:>3}  {:<32} {:<12} @{:<10} <- [{}]",
            link.id.0,
            link.name,
            link.kind,
            link.context,
            inputs.join(", ")
        );
    }
    for channel in &graph.ipc_channels {
        println!(
            "IPC channel {}: link {} -> link {} (ring {}, slots {})",
            channel.id, channel.out_link, channel.in_link, channel.config.ring_capacity, channel.config.slots
        );
    }
}

fn validate_command(pipeline: &Path) -> anyhow::Result<()> {
    let graph = run::load_graph(pipeline)?;
    let engine = Engine::new();
    let unknown: Vec<&str> =
        graph.links.iter().map(|l| l.kind.as_str()).filter(|k| !engine.plugins.contains(k)).collect();
    if !unknown.is_empty() {
        return Err(anyhow!("Unknown link kinds: {}", unknown.join(", ")));
    }
    print_graph(&graph);
    Ok(())
}

// Allow println for CLI output to stdout (intentional)
#[allow(clippy::disallowed_macros)]
fn links_command(json: bool) -> anyhow::Result<()> {
    let definitions = Engine::new().definitions();
    if json {
        println!("{}", serde_json::to_string_pretty(&definitions)?);
        return Ok(());
    }
    for definition in definitions {
        println!(
            "{:<12} [{}] {}",
            definition.kind,
            definition.categories.join(", "),
            definition.description.unwrap_or_default()
        );
    }
    Ok(())
}

/// Handle the "config default" command - print default config to stdout
// Allow println for CLI output to stdout (intentional)
#[allow(clippy::disallowed_macros)]
fn handle_config_default_command() -> anyhow::Result<()> {
    let toml_string = config::generate_default().context("Failed to generate default config")?;
    println!("# Default FrameLink configuration file");
    println!("{toml_string}");
    Ok(())
}

/// Handle the "config schema" command - print JSON schema to stdout
// Allow println for CLI output to stdout (intentional)
#[allow(clippy::disallowed_macros)]
fn handle_config_schema_command() -> anyhow::Result<()> {
    let schema = schema_for!(config::Config);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

/// Handle CLI commands
///
/// Exits the process with status 1 on error.
// Allow eprintln before logging is initialized (for CLI output)
#[allow(clippy::disallowed_macros)]
pub async fn handle_command(cli: &Cli, init_logging: LogInitFn) {
    let default_run = Commands::Run { pipeline: None, duration: None };
    let result = match cli.command.as_ref().unwrap_or(&default_run) {
        Commands::Run { pipeline, duration } => {
            let config_result = match config::load(&cli.config) {
                Ok(result) => result,
                Err(e) => {
                    eprintln!("Failed to load configuration: {e}");
                    std::process::exit(1);
                },
            };

            let _log_guard =
                match init_logging(&config_result.config.log, &config_result.config.telemetry) {
                    Ok(guard) => guard,
                    Err(e) => {
                        eprintln!("Failed to initialize logging: {e}");
                        std::process::exit(1);
                    },
                };
            let _meter_provider = init_telemetry_if_enabled(&config_result.config);

            if let Some(missing_file) = &config_result.file_missing {
                warn!(config_path = %missing_file, "Config file not found, using defaults");
            }

            let result = run_command(&config_result.config, pipeline.as_deref(), *duration).await;
            if let Err(e) = &result {
                error!(error = %format!("{e:#}"), "Run failed");
            }
            result
        },
        Commands::Validate { pipeline } => validate_command(pipeline),
        Commands::Links { json } => links_command(*json),
        Commands::Config(ConfigCommands::Default) => handle_config_default_command(),
        Commands::Config(ConfigCommands::Schema) => handle_config_schema_command(),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
