//! meshbench - all-to-all transport bandwidth benchmark
//!
//! Entry point: parses the CLI, loads configuration, sets up logging and
//! runs the selected role on a current-thread runtime.

mod bandwidth;
mod cli;
mod config;
mod error;
mod framing;
mod launcher;
mod logging;
mod net;
mod protocol;
mod rendezvous;
mod transport;
mod version;
mod worker;

use std::path::Path;

use clap::Parser;
use tracing::{error, info};

use crate::cli::{Cli, ClusterArgs, Commands, ConfigSubcommand};
use crate::config::BenchConfig;
use crate::error::{Error, Result};
use crate::launcher::LaunchOptions;

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        error!("{}", e.format_for_log());
        eprint!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }
}

fn run(cli: Cli) -> Result<()> {
    // Commands that don't need a full config
    match &cli.command {
        Commands::Version => {
            version::print_version();
            return Ok(());
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            return handle_config_command(subcommand.clone());
        }
        _ => {}
    }

    let config = load_config(&cli.command)?;
    let _log_guards = logging::init_logging(&config.logging, cli.verbose, cli.quiet)?;

    let build = version::build_info();
    info!(
        version = %build.full_version(),
        target = %build.target,
        profile = %build.profile,
        "Starting meshbench"
    );

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create runtime: {}", e)))?;

    match cli.command {
        Commands::Worker { ordinal, output, .. } => {
            if ordinal >= config.cluster.num_workers {
                return Err(Error::config_field_invalid(
                    "ordinal",
                    format!(
                        "ordinal {} out of range for {} workers",
                        ordinal, config.cluster.num_workers
                    ),
                ));
            }
            rt.block_on(launcher::run_worker(
                &config,
                ordinal,
                output.as_deref().map(Path::new),
            ))?;
        }
        Commands::Monitor { .. } => {
            rt.block_on(launcher::run_monitor(&config))?;
        }
        Commands::Launch {
            monitor,
            in_process,
            output,
            cluster,
        } => {
            if in_process {
                let outcome = rt.block_on(launcher::run_in_process(&config, monitor))?;
                launcher::print_reports(&outcome.reports);
                if let Some(path) = output {
                    let json = serde_json::to_string_pretty(&outcome.reports)?;
                    std::fs::write(&path, json).map_err(|source| Error::IoWrite {
                        path: path.into(),
                        source,
                    })?;
                }
            } else {
                let options = LaunchOptions {
                    monitor,
                    config_path: cluster.config,
                    verbose: cli.verbose,
                };
                rt.block_on(launcher::launch(&config, &options))?;
            }
        }
        Commands::Version | Commands::Config { .. } => unreachable!(),
    }

    Ok(())
}

/// Load the config file, then apply command-line overrides and re-validate
fn load_config(command: &Commands) -> Result<BenchConfig> {
    let empty = ClusterArgs::default();
    let cluster = match command {
        Commands::Worker { cluster, .. }
        | Commands::Monitor { cluster, .. }
        | Commands::Launch { cluster, .. } => cluster,
        _ => &empty,
    };

    let mut config = BenchConfig::load(cluster.config.as_deref())?;
    cluster.apply(&mut config);

    match command {
        Commands::Worker {
            monitor_port,
            monitor_host,
            ..
        } => {
            if let Some(port) = monitor_port {
                config.cluster.monitor_port = *port;
            }
            if let Some(host) = monitor_host {
                config.cluster.monitor_host = Some(host.clone());
            }
        }
        Commands::Monitor { port, .. } => {
            config.cluster.monitor_port = port.unwrap_or(0);
        }
        _ => {}
    }

    config.validate()?;
    Ok(config)
}

/// Handle configuration subcommands
fn handle_config_command(subcommand: ConfigSubcommand) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = BenchConfig::load(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            let written = config::init_config(path.as_deref(), force)?;
            println!("Configuration written to {}", written.display());
        }
        ConfigSubcommand::Validate { config } => {
            BenchConfig::load(config.as_deref())?;
            println!("Configuration is valid.");
        }
    }

    Ok(())
}
