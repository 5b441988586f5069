//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// envctl - developer environment control plane
#[derive(Debug, Parser)]
#[command(name = "envctl", version, about, long_about = None)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "ENVCTL_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text or json)
    #[arg(long, global = true, env = "ENVCTL_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the control plane and aggregator endpoint
    Serve {
        /// Configuration file (YAML)
        #[arg(short, long, env = "ENVCTL_CONFIG")]
        config: Option<PathBuf>,

        /// Bind host override
        #[arg(long)]
        host: Option<String>,

        /// Bind port override
        #[arg(short, long)]
        port: Option<u16>,

        /// Disable destructive-tool blocking
        #[arg(long)]
        yolo: bool,
    },

    /// Validate configuration and ServiceClass definitions
    Validate {
        /// Configuration file (YAML)
        #[arg(short, long, env = "ENVCTL_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Generate shell completions
    Completions {
        /// Target shell
        shell: Shell,
    },
}
