use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use frameindex::cancel::CancellationToken;
use frameindex::config::Config;
use frameindex::eid::Eid;
use frameindex::frame::extractor::FfmpegExtractor;
use frameindex::queue::SpoolQueue;
use frameindex::report::ErrorReporter;
use frameindex::service::VideoService;
use frameindex::store::FrameStore;

mod cli;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = cli::Args::parse();
    let config = Config::load_with(&args.base_path)
        .with_context(|| format!("failed to load config from {}", args.base_path.display()))?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?
        .block_on(run(args.command, config))
}

/// Cancel `cancel` on the first Ctrl-C.
fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                log::warn!("interrupted, shutting down");
                cancel.cancel();
            }
            Err(e) => log::error!("failed to install Ctrl+C handler: {}", e),
        }
    });
}

/// SQLite file urls are relative to the base path.
fn database_url(config: &Config) -> String {
    match config.database_url.strip_prefix("sqlite://") {
        Some(path) if !path.starts_with('/') && !path.starts_with(':') => format!(
            "sqlite://{}",
            config.resolve(std::path::Path::new(path)).display()
        ),
        _ => config.database_url.clone(),
    }
}

async fn run(command: cli::Command, config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    if let cli::Command::Keyframes { video, out_dir } = &command {
        let extractor = FfmpegExtractor::new(&config.extractor);
        let keyframes = extractor
            .extract_keyframes(video, out_dir, &cancel)
            .await
            .context("keyframe extraction failed")?;
        for path in keyframes {
            println!("{}", path.display());
        }
        return Ok(());
    }

    let store = FrameStore::connect(
        &database_url(&config),
        config.connect_attempts,
        Duration::from_secs(config.connect_backoff_secs),
    )
    .await
    .context("failed to open database")?;

    let (reporter, reporter_task) = ErrorReporter::spawn(config.reporter_capacity);
    let (service, _registry) = VideoService::from_config(&config, store.clone(), reporter.clone())
        .context("failed to set up pipeline")?;
    let service = Arc::new(service);

    let flusher_cancel = CancellationToken::new();
    let flusher = service
        .index()
        .spawn_flusher(flusher_cancel.clone(), reporter.clone());

    let result = execute(command, &config, &service, &store, &cancel).await;

    flusher_cancel.cancel();
    if let Err(e) = flusher.await {
        log::error!("vector flusher failed: {}", e);
    }

    drop(service);
    drop(reporter);
    match tokio::time::timeout(Duration::from_secs(5), reporter_task).await {
        Ok(Ok(handled)) if handled > 0 => log::info!("{} errors reported", handled),
        Ok(_) => {}
        Err(_) => log::warn!("error reporter did not drain in time"),
    }

    store.close().await;
    result
}

async fn execute(
    command: cli::Command,
    config: &Config,
    service: &Arc<VideoService>,
    store: &FrameStore,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    match command {
        cli::Command::Ingest { video } => {
            let registered = service.register_video(&video).await?;

            let progress = ProgressBar::new(0);
            progress.set_style(
                ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} frames")
                    .context("invalid progress template")?,
            );
            let summary = service
                .process_video(&registered.id, cancel, &progress)
                .await;
            progress.finish_and_clear();

            let summary = summary.with_context(|| format!("video {} failed", registered.id))?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }

        cli::Command::Enqueue { video } => {
            let registered = service.register_video(&video).await?;
            let queue = SpoolQueue::new(
                config.resolve(&config.queue_dir),
                Duration::from_millis(config.queue_poll_ms),
            )?;
            queue.enqueue(&registered.id).await?;
            println!("{}", registered.id);
            Ok(())
        }

        cli::Command::Daemon {} => {
            let queue = SpoolQueue::new(
                config.resolve(&config.queue_dir),
                Duration::from_millis(config.queue_poll_ms),
            )?;

            let worker = {
                let service = Arc::clone(service);
                let cancel = cancel.clone();
                tokio::spawn(async move { service.run(&queue, &cancel).await })
            };

            cancel.cancelled().await;
            let grace = Duration::from_secs(config.shutdown_grace_secs);
            log::warn!("waiting up to {:?} for the current video", grace);
            match tokio::time::timeout(grace, worker).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(anyhow::anyhow!("video loop failed: {}", e)),
                Err(_) => {
                    log::error!("shutdown grace period elapsed, abandoning current video");
                    Ok(())
                }
            }
        }

        cli::Command::Similar { frame_id, limit } => {
            let frame_id: Eid = frame_id.parse()?;
            let Some(vector) = service.index().get(&frame_id).await? else {
                bail!("frame {} has no stored vector", frame_id);
            };

            let mut results = service
                .index()
                .find_similar_scored(&vector, limit + 1)
                .await?;
            results.retain(|r| r.id != frame_id);
            results.truncate(limit);

            for result in results {
                println!("{}\t{:.4}", result.id, result.score);
            }
            Ok(())
        }

        cli::Command::Frames { video_id } => {
            let video_id: Eid = video_id.parse()?;
            let frames = store.frames_by_video(&video_id).await?;
            println!("{}", serde_json::to_string_pretty(&frames)?);
            Ok(())
        }

        cli::Command::Keyframes { .. } => Ok(()),
    }
}
