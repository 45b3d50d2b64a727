//! Progress display module
//!
//! Renders engine progress snapshots on a single terminal line.

use std::io::{self, Write};
use std::time::{Duration, Instant};

use crate::engine::Progress;

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

pub fn format_speed(bytes_per_sec: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec))
}

pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Time left at the current speed, if there is a speed to go by
pub fn calculate_eta(downloaded: u64, total: u64, speed: u64) -> Option<Duration> {
    if speed == 0 || downloaded >= total {
        return None;
    }
    Some(Duration::from_secs(total.saturating_sub(downloaded) / speed))
}

/// Progress display for CLI
pub struct ProgressDisplay {
    start_time: Instant,
    last_update: Option<Instant>,
    update_interval: Duration,
    quiet: bool,
}

impl ProgressDisplay {
    pub fn new(quiet: bool) -> Self {
        Self::with_interval(quiet, Duration::from_millis(500))
    }

    pub fn with_interval(quiet: bool, interval: Duration) -> Self {
        Self {
            start_time: Instant::now(),
            last_update: None,
            update_interval: interval,
            quiet,
        }
    }

    /// Redraw the progress line, at most once per interval
    pub fn update(&mut self, progress: &Progress) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        if self
            .last_update
            .is_some_and(|last| last.elapsed() < self.update_interval)
        {
            return Ok(());
        }
        self.last_update = Some(Instant::now());

        print!("\r\x1b[2K{}", Self::render(progress));
        io::stdout().flush()
    }

    /// One progress line without terminal control codes
    pub fn render(progress: &Progress) -> String {
        if !progress.ready {
            return format!("Fetching metadata | Peers: {}", progress.peers);
        }

        let percent = progress.percent_complete() as usize;
        let bar_width: usize = 40;
        let filled = percent * bar_width / 100;
        let bar = "=".repeat(filled) + &" ".repeat(bar_width - filled);

        let downloaded = progress.downloaded_bytes();
        let eta = calculate_eta(downloaded, progress.total_bytes, progress.download_speed)
            .map(format_duration)
            .unwrap_or_else(|| "∞".to_string());

        let mut line = format!(
            "[{}] {}% | {} / {} | ↓ {} | Peers: {} | ETA: {}",
            bar,
            percent,
            format_bytes(downloaded),
            format_bytes(progress.total_bytes),
            format_speed(progress.download_speed),
            progress.peers,
            eta,
        );
        if progress.paused {
            line.push_str(" | paused");
        }
        line
    }

    pub fn print_complete(&self, progress: &Progress) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        print!("\r\x1b[2K");
        io::stdout().flush()?;

        println!("Download Complete!");
        println!("  Verified: {}", format_bytes(progress.verified_bytes));
        println!("  Received: {}", format_bytes(progress.total_downloaded));
        println!("  Elapsed Time: {}", format_duration(self.start_time.elapsed()));
        Ok(())
    }

    /// Print a status message
    pub fn print_status(&self, message: &str) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        println!("\r\x1b[2K{}", message);
        Ok(())
    }

    /// Print an error message
    pub fn print_error(&self, message: &str) -> io::Result<()> {
        eprintln!("\r\x1b[2KError: {}", message);
        Ok(())
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}
