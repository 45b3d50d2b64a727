//! CLI module
//!
//! Command-line interface for the torrent engine.

pub mod args;
pub mod progress;

pub use args::CliArgs;
pub use progress::{format_bytes, ProgressDisplay};
