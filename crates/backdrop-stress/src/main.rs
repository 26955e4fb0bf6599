use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use backdrop_service::config::Config as ServiceConfig;
use backdrop_service::logging::ensure_log_error;

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

    /// Enable all the `tracing` instrumentation, but discard its output.
    #[arg(long)]
    tracing: bool,

    /// Report metrics to a local sink, unless statsd is configured.
    #[arg(long)]
    metrics: bool,
}

fn main() {
    match execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}

fn execute() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    let service_config = ServiceConfig::get(cli.config.as_deref())?;

    let logging_config = logging::Config {
        tracing: cli.tracing,
        metrics: cli.metrics,
    };
    // SAFETY: no other thread has been spawned yet.
    let _guard = unsafe { logging::init(logging_config, &service_config)? };

    perform_stresstest(service_config, workloads, cli.duration)
}
