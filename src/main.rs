//! torrent-engine - Main entry point
//!
//! Downloads one torrent and writes its files to the output directory.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use torrent_engine::{
    cli::format_bytes, CliArgs, CompletedFile, EngineEvent, MagnetLink, ProgressDisplay, TorrentEngine,
    TorrentError, TorrentSource,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        match panic_info.location() {
            Some(location) => error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            ),
            None => error!("PANIC occurred at an unknown location"),
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args);
    debug!("CLI arguments: {:?}", args);

    let config = args.engine_config().context("Invalid configuration")?;
    let source = resolve_source(&args.source).await?;

    let mut engine = TorrentEngine::new(config)?;
    let mut events = engine.subscribe();
    let mut progress = ProgressDisplay::new(args.is_quiet());

    engine.load(source).await.context("Failed to load torrent")?;
    if let Some(id) = engine.id() {
        progress.print_status(&format!("Loaded torrent {}", id))?;
    }

    let mut redraw = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(EngineEvent::Ready { total_pieces, finished_pieces, .. }) => {
                    info!("Ready: {}/{} pieces already verified", finished_pieces, total_pieces);
                    for &index in &args.select {
                        if let Err(e) = engine.select_file(index).await {
                            warn!("Could not select file {}: {}", index, e);
                        }
                    }
                }
                Some(EngineEvent::PieceCorrupt { index }) => debug!("Piece {} failed verification", index),
                Some(EngineEvent::PeerSourceDegraded { source, reason }) => {
                    debug!("Peer source {} degraded: {}", source, reason)
                }
                Some(EngineEvent::Done) => {
                    progress.print_complete(&engine.progress())?;
                    if !engine.config().ephemeral {
                        let files = engine.completed_files().await?;
                        write_files(&files, &args.output_dir).await?;
                    }
                    engine.shutdown(args.purge).await?;
                    break;
                }
                Some(EngineEvent::Fatal { message }) => {
                    progress.print_error(&message)?;
                    engine.shutdown(false).await?;
                    return Err(TorrentError::engine(message).into());
                }
                Some(_) => {}
                None => break,
            },
            _ = redraw.tick() => progress.update(&engine.progress())?,
            _ = tokio::signal::ctrl_c() => {
                progress.print_status("Interrupted, shutting down")?;
                engine.shutdown(false).await?;
                break;
            }
        }
    }

    info!("torrent-engine finished");
    Ok(())
}

/// Initialize logging based on verbosity settings
///
/// `RUST_LOG` takes precedence over `-v`/`-q` when it is set.
fn init_logging(args: &CliArgs) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level().to_string().to_lowercase()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.is_verbose() {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }
}

/// Turn the positional argument into descriptor bytes or a magnet URI
async fn resolve_source(input: &str) -> Result<TorrentSource> {
    if MagnetLink::is_magnet_link(input) {
        return Ok(TorrentSource::Magnet(input.trim().to_string()));
    }

    if input.starts_with("http://") || input.starts_with("https://") {
        info!("Fetching torrent from {}", input);
        let response = reqwest::get(input)
            .await
            .map_err(|e| TorrentError::network_with_address(format!("Request failed: {}", e), input))?;
        if !response.status().is_success() {
            return Err(TorrentError::network_with_address(
                format!("Server returned status {}", response.status()),
                input,
            )
            .into());
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| TorrentError::network_with_address(format!("Failed to read body: {}", e), input))?;
        return Ok(TorrentSource::from_input(body.to_vec()));
    }

    let data = tokio::fs::read(input)
        .await
        .with_context(|| format!("Failed to read torrent file '{}'", input))?;
    debug!("Torrent file size: {} bytes", data.len());
    Ok(TorrentSource::from_input(data))
}

/// Stream every completed file into `output_dir`
async fn write_files(files: &[CompletedFile], output_dir: &Path) -> Result<()> {
    for file in files {
        let target = output_dir.join(&file.path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                TorrentError::storage_with_path(
                    format!("Failed to create directory: {}", e),
                    parent.display().to_string(),
                )
            })?;
        }

        let mut out = tokio::fs::File::create(&target).await.map_err(|e| {
            TorrentError::storage_with_path(format!("Failed to create file: {}", e), target.display().to_string())
        })?;
        let mut chunks = file.stream();
        while let Some(chunk) = chunks.next().await {
            out.write_all(&chunk?).await?;
        }
        out.flush().await?;
        info!("Wrote {} ({})", target.display(), format_bytes(file.length));
    }
    Ok(())
}
