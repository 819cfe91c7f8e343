//! Hotload CLI - run, watch and inspect hot-swappable plugin modules

mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use hotload_host::{HostConfig, logging};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => HostConfig::load(path)?,
        None => HostConfig::default(),
    };
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    if cli.json_logs {
        config.logging.json = true;
    }
    logging::init(&config.logging);

    let rt = tokio::runtime::Runtime::new()?;
    match cli.command {
        Commands::Run {
            dir,
            staging_dir,
            no_hotload,
        } => {
            if let Some(staging_dir) = staging_dir {
                config.hotload.staging_dir = Some(staging_dir);
            }
            if no_hotload {
                config.hotload.enable_hotloading = false;
            }
            rt.block_on(commands::run::run(&dir, config))
        }
        Commands::Inspect { module, json } => commands::inspect::run(&module, &config, json),
        Commands::Purge { dir } => commands::purge::run(&dir),
    }
}
