use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use sheetload::config::{default_base_dir, default_config_path, load_config, Config};
use sheetload::service::{install_shutdown_handler, Service};
use sheetload::{init_logging, Result};

/// Loads spreadsheet files from the pending directory into the target table.
#[derive(Debug, Parser)]
#[command(name = "sheetload", version, about)]
struct Args {
    /// Path to the JSON configuration file (default: ~/.sheetload/config.json)
    #[arg(short, long, env = "SHEETLOAD_CONFIG")]
    config: Option<PathBuf>,

    /// Run a single scan, wait for the queue to drain, then exit
    #[arg(long)]
    once: bool,
}

fn resolve_config(args: &Args) -> Result<(Config, Option<PathBuf>)> {
    match &args.config {
        Some(path) => Ok((load_config(path)?, Some(path.clone()))),
        None => {
            let path = default_config_path();
            if path.exists() {
                Ok((load_config(&path)?, Some(path)))
            } else {
                Ok((Config::with_base_dir(default_base_dir()), None))
            }
        }
    }
}

fn run(args: Args) -> Result<()> {
    let (config, source) = resolve_config(&args)?;
    init_logging(&config.logging)?;

    match source {
        Some(path) => info!("Loaded configuration from {}", path.display()),
        None => info!("No configuration file found, using defaults"),
    }

    let shutdown = install_shutdown_handler()?;
    let mut service = Service::from_config(config)?;

    if args.once {
        let report = service.run_to_completion(&shutdown)?;
        info!("Queued {} file(s)", report.submitted);
    } else {
        service.run(&shutdown)?;
    }

    info!("Shutdown complete");
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
