//! Command line entry point.

use std::ffi::OsString;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use crate::af_packet;
use crate::api::FanoutGroupId;
use crate::config::Config;
use crate::exporter;
use crate::logging;
use crate::probe::{Probe, ShutdownReport};
use crate::shutdown::ShutdownSignal;

/// Command line options.
#[derive(Parser, Debug)]
#[clap(author, version, about = "Network traffic inspection probe", long_about = None)]
pub struct Args {
    /// Path to the TOML configuration file.
    #[clap(short, long)]
    pub config: PathBuf,
}

/// Runs the probe with the given arguments and returns the process exit
/// code. No worker thread is started unless the configuration is valid.
pub fn run<I, T>(args: I) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let args = match Args::try_parse_from(args) {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return e.exit_code();
        }
    };
    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return 1;
        }
    };
    if let Err(e) = logging::init(&config.logging) {
        eprintln!("error: {e:#}");
        return 1;
    }
    match serve(&config) {
        Ok(report) if report.workers.iter().all(|w| w.error.is_none()) => 0,
        Ok(_) => 1,
        Err(e) => {
            error!(error = %format!("{e:#}"), "probe failed");
            eprintln!("error: {e:#}");
            1
        }
    }
}

fn serve(config: &Config) -> anyhow::Result<ShutdownReport> {
    let signal = ShutdownSignal::global();
    signal.install_handlers()?;

    let cpus = num_cpus::get();
    if config.capture.workers > cpus {
        warn!(workers = config.capture.workers, cpus, "more workers than CPUs");
    }

    let group = FanoutGroupId::from_process();
    info!(
        device = %config.capture.device,
        workers = config.capture.workers,
        %group,
        endpoint = %config.collector.endpoint,
        "starting probe"
    );
    let session = exporter::connect(&config.collector.endpoint, config.collector.send_hwm)?;
    let factory = config.flow_meter();
    let mut probe = Probe::<af_packet::Sock>::launch(
        config.capture.workers,
        &config.capture.device,
        group,
        &config.capture_flags(),
        &factory,
        session,
    )
    .context("failed to start capture workers")?;

    probe.run_until(signal);
    Ok(probe.shutdown())
}
