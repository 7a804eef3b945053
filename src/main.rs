// src/main.rs

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use offline_coordinator::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Downloads one media item for offline playback. An interrupted download is
/// resumed or discarded per `--resume`/`--discard`, otherwise the user is asked.
#[derive(Debug, Parser)]
#[command(name = "offline-coordinator", version)]
struct Cli {
    /// JSON configuration file.
    #[arg(short, long, default_value = "offline.json")]
    config: PathBuf,

    /// Resume a pending download without asking.
    #[arg(long, conflicts_with = "discard")]
    resume: bool,

    /// Throw away a pending download instead of resuming it.
    #[arg(long)]
    discard: bool,
}

/// Asks on stdin whether to resume; an empty answer means yes.
async fn ask_resume(path: &Path) -> Result<bool> {
    println!("A download is pending in {}. Resume it? [Y/n]", path.display());
    let mut answer = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut answer)
        .await
        .context("reading answer")?;
    Ok(!matches!(answer.trim().to_ascii_lowercase().as_str(), "n" | "no"))
}

/// Stand-in for a DRM runtime: accepts any non-empty service token.
struct TokenFileLicense;

#[async_trait]
impl LicenseProvider for TokenFileLicense {
    async fn initialize(&self, data_dir: &Path) -> Result<(), BackendError> {
        tokio::fs::create_dir_all(data_dir).await?;
        Ok(())
    }

    async fn is_personalized(&self) -> Result<bool, BackendError> {
        Ok(true)
    }

    async fn personalize(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn process_service_token(&self, _token: &str) -> Result<(), BackendError> {
        Ok(())
    }
}

struct LogPlayback;

#[async_trait]
impl PlaybackSink for LogPlayback {
    async fn ready_for_playback(&self, request: PlaybackRequest) {
        tracing::info!(
            media = %request.media_uri,
            subtitles = request.subtitle_uri.as_deref().unwrap_or("none"),
            mime = request.content_type.mime_type(),
            "Playback source ready"
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = CoordinatorConfig::from_file(&cli.config)
        .await
        .with_context(|| format!("loading {}", cli.config.display()))?;

    acquire_license(&TokenFileLicense, &config.license)
        .await
        .context("license acquisition failed")?;

    let downloader = HttpDownloader::open(&config.ledger_path)
        .await
        .context("opening download ledger")?;
    let (coordinator, mut events) =
        DownloadLifecycleCoordinator::new(config, Arc::new(downloader), Arc::new(FsContentStore));
    let coordinator = Arc::new(coordinator.with_playback_sink(Arc::new(LogPlayback)));

    match coordinator.bootstrap().await? {
        Startup::ResumePrompt { path } => {
            let resume = if cli.resume || cli.discard {
                cli.resume
            } else {
                ask_resume(&path).await?
            };
            if resume {
                tracing::info!(path = %path.display(), "Resuming pending download");
                coordinator.resume().await?;
            } else {
                tracing::info!(path = %path.display(), "Discarding pending download");
                coordinator.decline_resume().await?;
                let config = coordinator.config();
                coordinator
                    .start_fresh(&config.target, &config.primary_dir)
                    .await?;
            }
        }
        Startup::OfflineAvailable { path } => {
            tracing::info!(path = %path.display(), "Nothing to download");
        }
        Startup::Started => {}
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(CoordinatorEvent::ReadyForPlayback(status)) => {
                    tracing::info!(path = %status.path.display(), "Download ready to play");
                    break;
                }
                Some(CoordinatorEvent::Progress { path, percentage }) => {
                    tracing::info!(path = %path.display(), "{percentage}%");
                }
                Some(CoordinatorEvent::DownloadFailing(path)) => {
                    tracing::warn!(path = %path.display(), "Media download failing");
                }
                Some(other) => tracing::debug!(event = ?other, "Coordinator event"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, the download can be resumed on the next start");
                break;
            }
        }
    }

    coordinator.shutdown().await;
    Ok(())
}
