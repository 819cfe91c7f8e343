//! CLI command definitions using clap

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Hotload - run and hot-swap plugin modules
#[derive(Parser)]
#[command(name = "hotload")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Configuration file path
    #[arg(short = 'c', long, global = true, env = "HOTLOAD_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load every module in a directory and hot-reload them as they change
    Run {
        /// Plugin directory
        #[arg(default_value = "plugins")]
        dir: PathBuf,

        /// Directory modules are copied into before loading
        #[arg(long)]
        staging_dir: Option<PathBuf>,

        /// Restart plugins on change instead of carrying their state over
        #[arg(long)]
        no_hotload: bool,
    },

    /// Print the types a module declares
    Inspect {
        /// Module file
        module: PathBuf,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Delete stale module copies left in a staging directory
    Purge {
        /// Staging directory
        dir: PathBuf,
    },
}
