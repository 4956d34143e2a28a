use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use humantime::parse_duration;

use rescache::config::Config;

mod logging;
mod stresstest;
mod workloads;

use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

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
    #[arg(long, short, value_parser = parse_duration)]
    duration: Duration,

    /// Enable Sentry, reporting into a local sink.
    #[arg(long)]
    sentry: bool,

    /// Enable JSON logging into the void, with all the tracing machinery active.
    ///
    /// Without this flag, logs are written as configured in the config file.
    #[arg(long)]
    tracing: bool,

    /// Enable metrics, reporting into a local sink instead of the configured statsd server.
    #[arg(long)]
    metrics: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    let config = Config::get(cli.config.as_deref())?;

    // SAFETY: The runtime has not been started yet, so this is single-threaded.
    let guard = unsafe {
        logging::init(
            logging::Config {
                sentry: cli.sentry,
                tracing: cli.tracing,
                metrics: cli.metrics,
            },
            &config,
        )?
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    if let Some(http_sink) = guard.http_sink {
        runtime.spawn(http_sink);
    }
    if let Some(udp_sink) = guard.udp_sink {
        runtime.spawn(udp_sink);
    }

    runtime.block_on(perform_stresstest(config, workloads, cli.duration))
}
