//! CLI commands for `nova-extd`.
//!
//! Provides developer tooling: list installed extensions, run one worker
//! against queries typed on stdin, or serve every extension by keyword.

pub mod list;
pub mod run;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "nova-extd")]
#[command(about = "Run Nova launcher extension workers", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: ~/.config/nova/extensions.toml)
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Extensions directory, overriding the config file
    #[arg(long, value_name = "DIR", global = true)]
    pub extensions_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List installed extensions and their triggers
    List,

    /// Start one extension and send it the queries read from stdin
    Run {
        /// Extension name
        id: String,
    },

    /// Start all extensions and route stdin queries by keyword
    Serve,
}

impl Cli {
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load_from(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => Config::load(),
        };
        if let Some(dir) = &self.extensions_dir {
            config.general.extensions_dir = Some(dir.clone());
        }
        Ok(config)
    }
}

/// Parse arguments and run the selected command to completion.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    match cli.command {
        Commands::List => list::run_list(&config),
        Commands::Run { id } => run::block_on(run::run_extension(config, id)),
        Commands::Serve => run::block_on(run::serve(config)),
    }
}
