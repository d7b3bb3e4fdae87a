//! CLI entry point for the download engine binary.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use downloader_core::{
    ChannelObserver, ConfigOverrides, DownloadFolderRequest, DownloadRequest, DownloadState,
    Engine, EngineEvent, NullObserver, Store,
};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing::{debug, error, info, warn};

mod cli;

use cli::{Args, Command};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), downloader_core::EngineError> {
    let overrides = ConfigOverrides {
        download_path: args.download_path.clone(),
        max_parallel_downloads: args.max_parallel_downloads,
        max_chunk_concurrency: args.max_chunk_concurrency,
        rate_limit_min_time_ms: args.rate_limit_min_time_ms,
        auto_resume_downloads: args.no_auto_resume.then_some(false),
    };

    let config_path = args
        .config_path
        .clone()
        .or_else(downloader_core::config::resolve_default_config_path);
    let file_config = match config_path {
        Some(path) => downloader_core::config::load_file_config(&path)?,
        None => None,
    };
    let config = downloader_core::config::resolve_config(file_config.as_ref(), &overrides)?;

    let db_path = args.db_path.clone().unwrap_or_else(default_db_path);
    if let Some(parent) = db_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let store = Store::open(&db_path).await?;

    // `download`/`download-folder` get a live progress renderer wired to a
    // ChannelObserver; every other subcommand is fire-and-forget against a
    // NullObserver since there is nothing left to watch after the RPC returns.
    let watches_progress = matches!(
        args.command,
        Command::Download { .. } | Command::DownloadFolder { .. }
    );

    if watches_progress {
        let (observer, receiver) = ChannelObserver::new();
        let engine = Engine::new(config, store, Arc::new(observer), None);
        engine.start().await?;
        let render_handle = tokio::spawn(render_progress(receiver));

        let watch_id = dispatch(&engine, args.command).await?;

        if let Some(id) = watch_id {
            wait_for_terminal(&engine, &id).await?;
        }
        engine.shutdown();
        let _ = render_handle.await;
    } else {
        let engine = Engine::new(config, store, Arc::new(NullObserver), None);
        engine.start().await?;
        dispatch(&engine, args.command).await?;
        engine.shutdown();
    }

    Ok(())
}

/// Runs one subcommand's RPC and returns the download id to wait on, if any.
async fn dispatch(
    engine: &Engine,
    command: Command,
) -> Result<Option<String>, downloader_core::EngineError> {
    match command {
        Command::Download {
            id,
            title,
            url,
            total_bytes,
            force_overwrite,
        } => {
            engine
                .download(DownloadRequest {
                    id: id.clone(),
                    title,
                    url,
                    total_bytes_hint: total_bytes,
                    download_path: None,
                    preserve_structure: None,
                    force_overwrite,
                })
                .await?;
            Ok(Some(id))
        }
        Command::DownloadFolder {
            folder_id,
            force_overwrite,
        } => {
            let summary = engine
                .download_folder(DownloadFolderRequest {
                    folder_id,
                    download_path: None,
                    preserve_structure: None,
                    force_overwrite,
                })
                .await?;
            info!(
                folder = %summary.folder_title,
                total = summary.total_files,
                added = summary.added,
                skipped = summary.skipped,
                "folder expansion complete"
            );
            Ok(None)
        }
        Command::Pause { id } => {
            engine.pause(&id).await?;
            Ok(None)
        }
        Command::Resume { id } => {
            engine.resume(&id).await?;
            Ok(None)
        }
        Command::Cancel { id } => {
            engine.cancel(&id).await?;
            Ok(None)
        }
        Command::Retry { id } => {
            engine.retry(&id).await?;
            Ok(None)
        }
        Command::ConfirmOverwrite { id } => {
            engine.confirm_overwrite(&id).await?;
            Ok(None)
        }
        Command::Delete { id } => {
            engine.delete(&id).await?;
            Ok(None)
        }
        Command::CleanHistory { days_old } => {
            let count = engine.clean_history(days_old).await?;
            info!(count, "history cleaned");
            Ok(None)
        }
        Command::Status { id } => {
            let row = engine.get_download(&id).await?;
            println!(
                "{}\t{}\t{}/{}\t{:.1}%",
                row.id,
                row.state_str,
                row.downloaded_bytes,
                row.total_bytes.unwrap_or(0),
                row.progress * 100.0
            );
            Ok(None)
        }
        Command::Stats => {
            let stats = engine.get_download_stats().await?;
            println!("active: {}", stats.active_ids.join(", "));
            println!("queued: {}", stats.queued_ids.join(", "));
            Ok(None)
        }
    }
}

/// Polls the engine until `id` reaches a terminal state, or ctrl-c is pressed.
async fn wait_for_terminal(
    engine: &Engine,
    id: &str,
) -> Result<(), downloader_core::EngineError> {
    loop {
        tokio::select! {
            row = engine.get_download(id) => {
                let row = row?;
                // `awaiting-confirmation` is not terminal, but it blocks on a
                // separate `confirm-overwrite`/`cancel` invocation, so this
                // process has nothing left to usefully wait for either.
                let stop = row
                    .state()
                    .map(|s| s.is_terminal() || s == DownloadState::AwaitingConfirmation)
                    .unwrap_or(true);
                if stop {
                    println!("{}: {}", row.id, row.state_str);
                    return Ok(());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted, pausing in-flight download");
                engine.pause(id).await?;
                return Ok(());
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
}

/// Renders progress-batch events with one `indicatif` bar per download id
/// until the channel closes (the engine shut down).
async fn render_progress(mut receiver: tokio::sync::mpsc::UnboundedReceiver<EngineEvent>) {
    let multi = MultiProgress::new();
    let style = ProgressStyle::with_template(
        "{prefix:.bold} [{bar:30}] {bytes}/{total_bytes} ({bytes_per_sec})",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar());

    let mut bars: std::collections::HashMap<String, ProgressBar> = std::collections::HashMap::new();

    while let Some(event) = receiver.recv().await {
        match event {
            EngineEvent::ProgressBatch(samples) => {
                for sample in samples {
                    let bar = bars.entry(sample.id.clone()).or_insert_with(|| {
                        let bar = multi.add(ProgressBar::new(sample.total_bytes.unwrap_or(0)));
                        bar.set_style(style.clone());
                        bar.set_prefix(sample.id.clone());
                        bar
                    });
                    if let Some(total) = sample.total_bytes {
                        bar.set_length(total);
                    }
                    bar.set_position(sample.downloaded_bytes);
                }
            }
            EngineEvent::StateChange { id, to, .. } => {
                if to.is_terminal() {
                    if let Some(bar) = bars.get(&id) {
                        bar.finish_with_message(to.to_string());
                    }
                }
            }
            EngineEvent::Restored(ids) => {
                if !ids.is_empty() {
                    info!(count = ids.len(), "downloads restored from a previous run");
                }
            }
            EngineEvent::HistoryCleaned(count) => {
                info!(count, "history cleaned");
            }
            EngineEvent::Error { id, kind, message } => {
                warn!(?id, ?kind, message, "engine reported an error");
            }
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("download-engine")
        .join("downloads.sqlite3")
}
