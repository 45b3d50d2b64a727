//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use crate::config::EngineConfig;

/// CLI arguments for the torrent engine
#[derive(Debug, Parser)]
#[command(name = "torrent-engine")]
#[command(about = "Download a torrent from a .torrent file, URL or magnet link", long_about = None)]
pub struct CliArgs {
    /// Path to a .torrent file, an http(s) URL or a magnet URI
    #[arg(value_name = "SOURCE")]
    pub source: String,

    /// Maximum number of peer connections
    #[arg(short = 'c', long, value_name = "N")]
    pub connections: Option<usize>,

    /// Parent directory for the piece buffer
    #[arg(short = 'b', long, value_name = "DIR")]
    pub buffer_dir: Option<PathBuf>,

    /// Do not hash-check data already in the buffer
    #[arg(short = 'n', long)]
    pub no_verify: bool,

    /// DHT lookup timeout in milliseconds (0 disables DHT)
    #[arg(short = 'd', long, value_name = "MS")]
    pub dht_timeout: Option<u64>,

    /// Do not announce to trackers
    #[arg(short = 't', long)]
    pub no_trackers: bool,

    /// Keep pieces in memory and skip writing files
    #[arg(short = 'e', long)]
    pub ephemeral: bool,

    /// Start with no file selected
    #[arg(short = 'w', long)]
    pub wait: bool,

    /// File index to select once metadata is known (repeatable)
    #[arg(long = "select", value_name = "INDEX")]
    pub select: Vec<usize>,

    /// Extra peer address (repeatable)
    #[arg(short = 'p', long = "peer", value_name = "ADDR")]
    pub peers: Vec<SocketAddr>,

    /// Directory completed files are written to
    #[arg(short = 'o', long, value_name = "DIR", default_value = ".")]
    pub output_dir: PathBuf,

    /// Remove the piece buffer after finishing
    #[arg(long)]
    pub purge: bool,

    /// JSON engine configuration; flags override its values
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long)]
    pub quiet: bool,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }

    /// Build the engine configuration from `--config` and the flags
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_json_file(path)?,
            None => EngineConfig::default(),
        };

        if let Some(connections) = self.connections {
            config.max_connections = connections;
        }
        if let Some(dir) = &self.buffer_dir {
            config.download_directory = Some(dir.clone());
        }
        if self.no_verify {
            config.verify_existing = false;
        }
        match self.dht_timeout {
            Some(0) => config.dht_bootstrap_timeout = None,
            Some(ms) => config.dht_bootstrap_timeout = Some(Duration::from_millis(ms)),
            None => {}
        }
        if self.no_trackers {
            config.use_trackers = false;
        }
        if self.ephemeral {
            config.ephemeral = true;
        }
        if self.wait {
            config.wait_for_selection = true;
        }
        config.manual_peers.extend(self.peers.iter().copied());

        config.validate()?;
        Ok(config)
    }
}
