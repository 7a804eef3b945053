// src/coordinator.rs

use crate::capability::{
    BackendError, ContentStore, Downloader, DownloaderNotification, NotificationReceiver,
    PlaybackRequest, PlaybackSink,
};
use crate::config::{CoordinatorConfig, DownloadMode};
use crate::events::{CoordinatorEvent, EventReceiver, EventSender};
use crate::models::{
    ContentState, ContentStatus, CoordinatorState, DownloadConstraints, DownloadTarget,
    DownloaderState,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("downloader unavailable during {operation}: {source}")]
    BackendUnavailable {
        operation: &'static str,
        #[source]
        source: BackendError,
    },
    #[error("constraints cannot change once downloads have started")]
    ConstraintsLocked,
}

/// Outcome of `DownloadLifecycleCoordinator::bootstrap`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Startup {
    /// A paused download was found at `path`. Call `resume` or `decline_resume`.
    ResumePrompt { path: PathBuf },
    /// The media file is already on disk and was handed to playback.
    OfflineAvailable { path: PathBuf },
    Started,
}

struct Inner {
    state: CoordinatorState,
    statuses: BTreeMap<PathBuf, ContentStatus>,
    /// Media and subtitle file names cleanup removes from a directory.
    known_files: BTreeSet<String>,
    resumable: Option<PathBuf>,
    playback_triggered: bool,
    playback_task: Option<JoinHandle<()>>,
}

/// Sequences resume detection, cleanup, fresh starts and the playback
/// hand-off on top of a `Downloader` backend.
///
/// Every operation runs under one lock, so notifications delivered from the
/// backend's own tasks never interleave with a cleanup or a fresh start.
pub struct DownloadLifecycleCoordinator {
    config: CoordinatorConfig,
    downloader: Arc<dyn Downloader>,
    store: Arc<dyn ContentStore>,
    playback: Option<Arc<dyn PlaybackSink>>,
    events: EventSender,
    inner: Mutex<Inner>,
    shutdown: CancellationToken,
    listener_task: Mutex<Option<JoinHandle<()>>>,
}

impl DownloadLifecycleCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        downloader: Arc<dyn Downloader>,
        store: Arc<dyn ContentStore>,
    ) -> (Self, EventReceiver) {
        let (events, rx) = EventSender::channel();
        let known_files = config.target.file_names().map(str::to_owned).collect();
        let coordinator = Self {
            config,
            downloader,
            store,
            playback: None,
            events,
            inner: Mutex::new(Inner {
                state: CoordinatorState::Uninitialized,
                statuses: BTreeMap::new(),
                known_files,
                resumable: None,
                playback_triggered: false,
                playback_task: None,
            }),
            shutdown: CancellationToken::new(),
            listener_task: Mutex::new(None),
        };
        (coordinator, rx)
    }

    pub fn with_playback_sink(mut self, sink: Arc<dyn PlaybackSink>) -> Self {
        self.playback = Some(sink);
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub async fn state(&self) -> CoordinatorState {
        self.inner.lock().await.state
    }

    /// The path `detect_resumable` settled on, until it is resumed or cleaned.
    pub async fn resumable_path(&self) -> Option<PathBuf> {
        self.inner.lock().await.resumable.clone()
    }

    pub async fn playback_triggered(&self) -> bool {
        self.inner.lock().await.playback_triggered
    }

    /// Statuses of every tracked path, ordered by path.
    pub async fn snapshot(&self) -> Vec<ContentStatus> {
        self.inner.lock().await.statuses.values().cloned().collect()
    }

    pub async fn apply_constraints(
        &self,
        constraints: DownloadConstraints,
    ) -> Result<(), CoordinatorError> {
        let inner = self.inner.lock().await;
        if matches!(inner.state, CoordinatorState::Running | CoordinatorState::Done) {
            return Err(CoordinatorError::ConstraintsLocked);
        }
        self.downloader
            .set_constraints(constraints)
            .await
            .map_err(|e| self.backend_failure("set_constraints", e))?;
        tracing::debug!(
            max_bandwidth_bps = constraints.max_bandwidth_bps,
            max_connections = constraints.max_connections,
            "Constraints applied"
        );
        Ok(())
    }

    /// True when the backend is paused with a pending entry under the primary
    /// directory. Paths are scanned in lexicographic order and the first
    /// match is the one reported.
    pub async fn detect_resumable(&self) -> Result<bool, CoordinatorError> {
        let mut inner = self.inner.lock().await;
        let status = self
            .downloader
            .query_status()
            .await
            .map_err(|e| self.backend_failure("query_status", e))?;

        let mut paths = status.paths;
        paths.sort();
        paths.dedup();

        let mut statuses = BTreeMap::new();
        let mut candidates = Vec::new();
        for path in paths {
            let content = self
                .downloader
                .query_content_status(&path)
                .await
                .map_err(|e| self.backend_failure("query_content_status", e))?;
            tracing::info!(
                path = %path.display(),
                state = ?content.state,
                percentage = content.downloaded_percentage,
                "Tracked content"
            );
            if status.state == DownloaderState::Paused
                && content.state == ContentState::Pending
                && self.is_primary(&path)
            {
                candidates.push(path.clone());
            }
            statuses.insert(path, content);
        }

        for target in statuses.values().filter_map(|s| s.content.as_ref()) {
            inner
                .known_files
                .extend(target.file_names().map(str::to_owned));
        }
        inner.statuses = statuses;

        let chosen = candidates.first().cloned();
        if let Some(chosen) = &chosen {
            tracing::info!(path = %chosen.display(), "Resumable download found");
            if candidates.len() > 1 {
                tracing::warn!(count = candidates.len(), "Several resumable downloads, using the first");
                self.events.emit(CoordinatorEvent::ResumeAmbiguous {
                    candidates: candidates.clone(),
                    chosen: chosen.clone(),
                });
            }
        }
        inner.resumable = chosen.clone();

        let next = if chosen.is_some() {
            CoordinatorState::ResumablePendingDecision
        } else {
            CoordinatorState::Fresh
        };
        self.transition(&mut inner, next);
        Ok(chosen.is_some())
    }

    /// Moves the backend from paused to running, keeping its entries.
    pub async fn resume(&self) -> Result<(), CoordinatorError> {
        let mut inner = self.inner.lock().await;
        self.downloader
            .resume()
            .await
            .map_err(|e| self.backend_failure("resume", e))?;
        inner.resumable = None;
        self.transition(&mut inner, CoordinatorState::Running);
        Ok(())
    }

    /// The user declined to resume: clean the primary directory.
    pub async fn decline_resume(&self) -> Result<(), CoordinatorError> {
        let mut inner = self.inner.lock().await;
        let primary = self.config.primary_dir.clone();
        self.cleanup_locked(&mut inner, &primary).await
    }

    /// Cleans `dir`, then registers `target` there and starts the backend.
    pub async fn start_fresh(
        &self,
        target: &DownloadTarget,
        dir: &Path,
    ) -> Result<(), CoordinatorError> {
        let mut inner = self.inner.lock().await;
        inner
            .known_files
            .extend(target.file_names().map(str::to_owned));
        self.cleanup_locked(&mut inner, dir).await?;
        self.register_locked(&mut inner, target, dir).await
    }

    /// Registers another download next to the running ones without cleaning.
    pub async fn add_download(
        &self,
        target: &DownloadTarget,
        dir: &Path,
    ) -> Result<(), CoordinatorError> {
        let mut inner = self.inner.lock().await;
        inner
            .known_files
            .extend(target.file_names().map(str::to_owned));
        self.register_locked(&mut inner, target, dir).await
    }

    /// Deletes known media and subtitle files in `dir`, then cancels every
    /// entry the backend tracks. Safe to call on an already clean directory.
    pub async fn cleanup(&self, dir: &Path) -> Result<(), CoordinatorError> {
        let mut inner = self.inner.lock().await;
        self.cleanup_locked(&mut inner, dir).await
    }

    /// Entry point for every status change the backend reports. Statuses for
    /// paths that are not tracked, or were cleaned up meanwhile, are dropped.
    pub async fn on_progress(&self, status: ContentStatus) {
        let mut inner = self.inner.lock().await;
        let mut status = status;
        status.downloaded_percentage = status.downloaded_percentage.min(100);

        let Some(previous) = inner.statuses.get(&status.path) else {
            tracing::debug!(
                path = %status.path.display(),
                state = ?status.state,
                "Ignoring status for untracked path"
            );
            return;
        };
        if status.state == ContentState::Downloading
            && previous.state == ContentState::Downloading
            && status.downloaded_percentage < previous.downloaded_percentage
        {
            status.downloaded_percentage = previous.downloaded_percentage;
        }
        if status.content.is_none() {
            status.content = previous.content.clone();
        }
        if let Some(target) = &status.content {
            inner
                .known_files
                .extend(target.file_names().map(str::to_owned));
        }
        inner.statuses.insert(status.path.clone(), status.clone());

        let primary = self.is_primary(&status.path);
        if primary {
            self.events.emit(CoordinatorEvent::Progress {
                path: status.path.clone(),
                percentage: status.downloaded_percentage,
            });
        }

        match status.state {
            ContentState::Failing => {
                tracing::warn!(path = %status.path.display(), "Media download failing");
                self.events
                    .emit(CoordinatorEvent::DownloadFailing(status.path.clone()));
            }
            ContentState::Completed => {
                tracing::info!(path = %status.path.display(), "Media download complete");
                self.events
                    .emit(CoordinatorEvent::DownloadCompleted(status.path.clone()));
                let all_done = inner
                    .statuses
                    .values()
                    .all(|s| s.state == ContentState::Completed);
                if all_done && inner.state == CoordinatorState::Running {
                    self.transition(&mut inner, CoordinatorState::Done);
                }
            }
            _ => {}
        }

        if status.downloaded_percentage == 100 && primary && !inner.playback_triggered {
            inner.playback_triggered = true;
            self.hand_off(&mut inner, status);
        }
    }

    pub async fn on_downloader_state(&self, state: DownloaderState) {
        tracing::info!(?state, "Downloader state update");
        self.events
            .emit(CoordinatorEvent::DownloaderStateChanged(state));
    }

    /// Registers a listener with the backend and spawns the task that feeds
    /// its notifications into this coordinator.
    pub async fn attach(self: &Arc<Self>) -> Result<(), CoordinatorError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.downloader
            .set_listener(tx)
            .await
            .map_err(|e| self.backend_failure("set_listener", e))?;

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.pump(rx).await });
        if let Some(previous) = self.listener_task.lock().await.replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Stops the listener task and waits for a playback hand-off still in
    /// flight.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.listener_task.lock().await.take() {
            let _ = handle.await;
        }
        let playback = self.inner.lock().await.playback_task.take();
        if let Some(handle) = playback {
            let _ = handle.await;
        }
    }

    /// Startup sequence: constraints, listener, then resume detection, an
    /// offline file check or a fresh download depending on the mode.
    pub async fn bootstrap(self: &Arc<Self>) -> Result<Startup, CoordinatorError> {
        self.apply_constraints(self.config.constraints).await?;
        self.attach().await?;

        let primary = self.config.primary_dir.clone();
        let target = self.config.target.clone();

        match &self.config.mode {
            DownloadMode::Single => {
                if self.detect_resumable().await? {
                    let path = self.resumable_path().await.unwrap_or(primary);
                    return Ok(Startup::ResumePrompt { path });
                }
                let offline = self.config.offline_media_path();
                if self.store.exists(&offline).await {
                    tracing::info!(path = %offline.display(), "Offline media already available");
                    self.play_offline().await;
                    return Ok(Startup::OfflineAvailable { path: offline });
                }
                self.start_fresh(&target, &primary).await?;
            }
            DownloadMode::Parallel {
                secondary_dir,
                stagger_secs,
            } => {
                {
                    let mut inner = self.inner.lock().await;
                    self.transition(&mut inner, CoordinatorState::Fresh);
                }
                self.cleanup(secondary_dir).await?;
                self.start_fresh(&target, &primary).await?;
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(*stagger_secs)) => {}
                    _ = self.shutdown.cancelled() => return Ok(Startup::Started),
                }
                self.add_download(&target, secondary_dir).await?;
            }
        }
        Ok(Startup::Started)
    }

    async fn play_offline(&self) {
        let mut inner = self.inner.lock().await;
        if inner.playback_triggered {
            return;
        }
        inner.playback_triggered = true;
        let status = ContentStatus::new(&self.config.primary_dir, ContentState::Completed, 100)
            .with_content(self.config.target.clone());
        self.hand_off(&mut inner, status);
        self.transition(&mut inner, CoordinatorState::Done);
    }

    async fn pump(self: Arc<Self>, mut rx: NotificationReceiver) {
        let stall = self.config.stall_timeout();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = rx.recv() => match received {
                    Some(DownloaderNotification::Progress(status)) => self.on_progress(status).await,
                    Some(DownloaderNotification::State(state)) => self.on_downloader_state(state).await,
                    None => {
                        tracing::debug!("Downloader dropped its listener");
                        break;
                    }
                },
                _ = stall_timer(stall) => {
                    if let Some(idle) = stall {
                        if self.state().await == CoordinatorState::Running {
                            tracing::warn!(idle_secs = idle.as_secs(), "No download progress");
                            self.events.emit(CoordinatorEvent::DownloadStalled { idle });
                        }
                    }
                }
            }
        }
    }

    async fn cleanup_locked(&self, inner: &mut Inner, dir: &Path) -> Result<(), CoordinatorError> {
        for name in &inner.known_files {
            let path = dir.join(name);
            match self.store.delete_if_exists(&path).await {
                Ok(true) => tracing::info!(path = %path.display(), "Deleted file"),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Could not delete file");
                    self.events.emit(CoordinatorEvent::FileSystemError {
                        path,
                        reason: e.to_string(),
                    });
                }
            }
        }

        let status = self
            .downloader
            .query_status()
            .await
            .map_err(|e| self.backend_failure("query_status", e))?;
        for path in &status.paths {
            self.downloader
                .cancel_content(path)
                .await
                .map_err(|e| self.backend_failure("cancel_content", e))?;
            tracing::info!(path = %path.display(), "Cancelled content");
        }

        inner.statuses.clear();
        inner.resumable = None;
        self.transition(inner, CoordinatorState::Cleaned);
        Ok(())
    }

    async fn register_locked(
        &self,
        inner: &mut Inner,
        target: &DownloadTarget,
        dir: &Path,
    ) -> Result<(), CoordinatorError> {
        self.downloader
            .resume()
            .await
            .map_err(|e| self.backend_failure("resume", e))?;
        self.downloader
            .add_content(dir, target)
            .await
            .map_err(|e| self.backend_failure("add_content", e))?;
        tracing::info!(dir = %dir.display(), url = target.url(), "Download registered");

        inner.statuses.insert(
            dir.to_path_buf(),
            ContentStatus::new(dir, ContentState::Pending, 0).with_content(target.clone()),
        );
        self.transition(inner, CoordinatorState::Running);
        Ok(())
    }

    fn hand_off(&self, inner: &mut Inner, status: ContentStatus) {
        tracing::info!(path = %status.path.display(), "Ready for playback");
        self.events
            .emit(CoordinatorEvent::ReadyForPlayback(status.clone()));

        let Some(sink) = self.playback.clone() else {
            return;
        };
        let Some(media_uri) = status.media_uri() else {
            tracing::warn!(path = %status.path.display(), "No media file known, playback skipped");
            return;
        };
        let request = PlaybackRequest {
            subtitle_uri: status.subtitle_uri(),
            path: status.path,
            media_uri,
            content_type: self.config.content_type(),
        };
        inner.playback_task = Some(tokio::spawn(async move {
            sink.ready_for_playback(request).await
        }));
    }

    fn transition(&self, inner: &mut Inner, to: CoordinatorState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        tracing::debug!(?from, ?to, "Coordinator state changed");
        self.events.emit(CoordinatorEvent::StateChanged { from, to });
    }

    fn backend_failure(&self, operation: &'static str, source: BackendError) -> CoordinatorError {
        tracing::error!(operation, error = %source, "Downloader call failed");
        self.events.emit(CoordinatorEvent::BackendUnavailable {
            operation,
            reason: source.to_string(),
        });
        CoordinatorError::BackendUnavailable { operation, source }
    }

    fn is_primary(&self, path: &Path) -> bool {
        path.starts_with(&self.config.primary_dir)
    }
}

async fn stall_timer(stall: Option<Duration>) {
    match stall {
        Some(idle) => tokio::time::sleep(idle).await,
        None => std::future::pending().await,
    }
}
