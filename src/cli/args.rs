use crate::domain::config::StoreBackend;
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Command line arguments for Tether
#[derive(Parser, Debug)]
#[command(
    name = "tether",
    version = env!("CARGO_PKG_VERSION"),
    about = "Session lifecycle and metadata persistence toolkit",
    long_about = "Manages reference-counted, identity-bound sessions with pluggable metadata stores. The CLI inspects configuration and runs in-process simulations against each store backend."
)]
pub struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress logging
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Configuration file path (skips global/project discovery)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text", global = true)]
    pub output: OutputFormat,

    /// Command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Configuration management commands
    Config(ConfigArgs),
    /// Drive an in-process registry through a concurrent workload
    Simulate(SimulateArgs),
    /// Display version information
    Version,
}

/// Output format options
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output
    Json,
    /// Table output
    Table,
}

/// Configuration management arguments
#[derive(ClapArgs, Debug)]
pub struct ConfigArgs {
    /// Configuration subcommand
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Configuration subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show the effective configuration
    Show,
    /// Print the configuration file locations
    Path,
    /// Create a default configuration
    Init {
        /// Directory to create `.tether/config.toml` in (default: current directory)
        #[arg(short, long)]
        dir: Option<PathBuf>,
        /// Write the global configuration instead
        #[arg(short, long)]
        global: bool,
    },
}

/// Store backend selectable on the command line
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendArg {
    /// In-process maps
    Local,
    /// Transactional key/value client
    Transactional,
    /// Eventually-consistent cache client
    Cache,
}

impl From<BackendArg> for StoreBackend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Local => StoreBackend::Local,
            BackendArg::Transactional => StoreBackend::Transactional,
            BackendArg::Cache => StoreBackend::Cache,
        }
    }
}

/// Simulation arguments
#[derive(ClapArgs, Debug, Clone)]
pub struct SimulateArgs {
    /// Store backend (default: from configuration)
    #[arg(short, long, value_enum)]
    pub backend: Option<BackendArg>,

    /// Number of sessions to create
    #[arg(short, long, default_value = "8")]
    pub sessions: usize,

    /// Requests issued against each session
    #[arg(short, long, default_value = "32")]
    pub requests: usize,

    /// Concurrent workers per session
    #[arg(long, default_value = "4")]
    pub workers: usize,

    /// Distinct users competing for anonymous sessions
    #[arg(short, long, default_value = "2")]
    pub users: usize,

    /// Seconds of virtual time to advance before pruning
    #[arg(long, default_value = "0")]
    pub advance_secs: u64,

    /// Pruning ticks to run after the workload
    #[arg(long, default_value = "1")]
    pub ticks: usize,

    /// Idle timeout override in seconds
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,
}

impl Default for SimulateArgs {
    fn default() -> Self {
        Self {
            backend: None,
            sessions: 8,
            requests: 32,
            workers: 4,
            users: 2,
            advance_secs: 0,
            ticks: 1,
            idle_timeout_secs: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulate_defaults() {
        let args = Args::try_parse_from(["tether", "simulate"]).unwrap();
        match args.command {
            Command::Simulate(sim) => {
                assert_eq!(sim.sessions, 8);
                assert_eq!(sim.workers, 4);
                assert!(sim.backend.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert_eq!(args.output, OutputFormat::Text);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = Args::try_parse_from([
            "tether", "simulate", "--backend", "cache", "-o", "json", "--verbose",
        ])
        .unwrap();
        assert!(args.verbose);
        assert_eq!(args.output, OutputFormat::Json);
        match args.command {
            Command::Simulate(sim) => assert_eq!(sim.backend, Some(BackendArg::Cache)),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_config_init_flags() {
        let args = Args::try_parse_from(["tether", "config", "init", "--global"]).unwrap();
        match args.command {
            Command::Config(ConfigArgs {
                command: ConfigCommand::Init { dir, global },
            }) => {
                assert!(global);
                assert!(dir.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_backend_rejected() {
        assert!(Args::try_parse_from(["tether", "simulate", "--backend", "redis"]).is_err());
    }

    #[test]
    fn test_backend_arg_maps_to_store_backend() {
        assert_eq!(StoreBackend::from(BackendArg::Transactional), StoreBackend::Transactional);
    }
}
