use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use wallet_cache::config::Config;

mod logging;
mod stresstest;
mod workloads;

use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

/// Command line interface parser.
#[derive(Parser)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = humantime::parse_duration)]
    duration: Duration,

    /// Enable tracing and metrics, sending them to a local sink.
    ///
    /// Otherwise logs and metrics are set up from the configuration file.
    #[arg(long)]
    instrumented: bool,
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        wallet_cache::logging::ensure_log_error(&error);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    let config = Config::get(cli.config.as_deref())?;

    let mut logging_guard = logging::init(logging::Config {
        sentry_dsn: config.sentry_dsn.clone(),
        tracing: cli.instrumented,
        metrics: cli.instrumented,
    })?;
    if let Some(udp_sink) = logging_guard.udp_sink.take() {
        tokio::spawn(udp_sink);
    }
    if !cli.instrumented {
        wallet_cache::logging::init_logging(&config);
        wallet_cache::metrics::init_metrics(&config.metrics)?;
    }

    perform_stresstest(config, workloads, cli.duration).await
}
