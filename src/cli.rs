//! CLI argument parsing using clap v4
//!
//! Flags given here override the configuration file and `MESHBENCH_*`
//! environment variables.

use clap::{Args, Parser, Subcommand};

use crate::config::BenchConfig;
use crate::transport::TransportKind;

/// meshbench - all-to-all transport bandwidth benchmark
///
/// Every worker connects to every other worker, exchanges fixed-size
/// payloads over the selected transport and reports per-peer bandwidth.
#[derive(Parser, Debug)]
#[command(name = "meshbench")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Overrides shared by every role
#[derive(Args, Debug, Clone, Default)]
pub struct ClusterArgs {
    /// Path to configuration file
    #[arg(short, long, env = "MESHBENCH_CONFIG")]
    pub config: Option<String>,

    /// Number of workers in the cluster
    #[arg(short = 'n', long)]
    pub workers: Option<usize>,

    /// Connections per peer pair (endpoint slots)
    #[arg(short, long)]
    pub endpoints: Option<usize>,

    /// Transport variant
    #[arg(short, long, value_enum)]
    pub transport: Option<TransportKind>,

    /// Shared board file for shared-state rendezvous
    #[arg(long)]
    pub board: Option<String>,

    /// Payload size in bytes
    #[arg(long)]
    pub payload_size: Option<usize>,

    /// Timed round trips per connection
    #[arg(short, long)]
    pub iterations: Option<usize>,

    /// Send and receive each round trip's payloads concurrently
    #[arg(long)]
    pub gather: bool,
}

impl ClusterArgs {
    /// Apply flags on top of a loaded configuration
    pub fn apply(&self, config: &mut BenchConfig) {
        if let Some(n) = self.workers {
            config.cluster.num_workers = n;
        }
        if let Some(e) = self.endpoints {
            config.cluster.endpoints = e;
        }
        if let Some(t) = self.transport {
            config.transport.backend = t;
        }
        if let Some(ref b) = self.board {
            config.cluster.board = Some(b.clone());
        }
        if let Some(size) = self.payload_size {
            config.exchange.payload_size = size;
        }
        if let Some(iterations) = self.iterations {
            config.exchange.iterations = iterations;
        }
        if self.gather {
            config.exchange.gather = true;
        }
    }
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one worker
    Worker {
        /// This worker's ordinal in [0, workers)
        #[arg(long)]
        ordinal: usize,

        /// Monitor port; enables monitor-mediated rendezvous
        #[arg(long)]
        monitor_port: Option<u16>,

        /// Monitor host (defaults to this worker's host)
        #[arg(long)]
        monitor_host: Option<String>,

        /// Write the run report as JSON
        #[arg(short, long)]
        output: Option<String>,

        #[command(flatten)]
        cluster: ClusterArgs,
    },

    /// Run the rendezvous monitor
    Monitor {
        /// Listen port (ephemeral if omitted)
        #[arg(long)]
        port: Option<u16>,

        #[command(flatten)]
        cluster: ClusterArgs,
    },

    /// Start a whole cluster on this machine
    Launch {
        /// Rendezvous through a monitor instead of the shared board
        #[arg(long)]
        monitor: bool,

        /// Run every role as a task in this process
        #[arg(long)]
        in_process: bool,

        /// Write all run reports as a JSON array (in-process only)
        #[arg(short, long, requires = "in_process")]
        output: Option<String>,

        #[command(flatten)]
        cluster: ClusterArgs,
    },

    /// Display version and build information
    Version,

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the current configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}
