use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::path::PathBuf;
use upstream_guard::{config::AppConfig, logging, simulate, LogFormat, SimulationOptions};
use upstream_guard_pipeline::RequestPipeline;

#[derive(Debug, Parser)]
#[command(name = "upstream-guard", version, about = "Resilient upstream data access")]
struct Cli {
    /// Directory holding `default.toml` and an optional `local.toml`.
    #[arg(long, global = true, default_value = "config", env = "UPSTREAM_GUARD_CONFIG_DIR")]
    config_dir: PathBuf,

    /// Overrides `log.format` from the configuration.
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a synthetic flaky upstream through the pipeline and print per-key stats.
    Simulate {
        #[command(flatten)]
        options: SimulationOptions,

        /// Print the Prometheus exposition after the run.
        #[arg(long)]
        metrics: bool,
    },

    /// Load, validate and print the effective configuration.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config_dir)?;
    logging::init(cli.log_format.unwrap_or(config.log.format), &config.log.level)?;
    tracing::info!(config_dir = %cli.config_dir.display(), "configuration loaded");

    match cli.command {
        Command::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::Simulate { options, metrics } => {
            let handle = if metrics { Some(install_metrics()?) } else { None };

            let pipeline = RequestPipeline::new(config.pipeline)
                .context("pipeline rejected the configuration")?;
            let report = simulate::run(&pipeline, &options).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);

            if let Some(handle) = handle {
                print!("{}", handle.render());
            }
        }
    }

    Ok(())
}

fn install_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("upstream_guard_fetch_duration_seconds".to_string()),
            &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
        )
        .context("invalid histogram buckets")?
        .install_recorder()
        .context("failed to install Prometheus recorder")?;
    Ok(handle)
}
