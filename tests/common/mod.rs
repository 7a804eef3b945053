#![allow(dead_code)]

use async_trait::async_trait;
use offline_coordinator::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::mpsc::error::TryRecvError;

/// In-memory downloader that records calls and only changes state when told.
pub struct FakeDownloader {
    inner: Mutex<FakeState>,
}

struct FakeState {
    state: DownloaderState,
    contents: BTreeMap<PathBuf, ContentStatus>,
    listener: Option<NotificationSender>,
    constraints: Option<DownloadConstraints>,
    calls: Vec<String>,
    failing: HashSet<&'static str>,
}

impl FakeDownloader {
    pub fn new(state: DownloaderState) -> Self {
        Self {
            inner: Mutex::new(FakeState {
                state,
                contents: BTreeMap::new(),
                listener: None,
                constraints: None,
                calls: Vec::new(),
                failing: HashSet::new(),
            }),
        }
    }

    pub fn with_content(self, status: ContentStatus) -> Self {
        self.inner
            .lock()
            .unwrap()
            .contents
            .insert(status.path.clone(), status);
        self
    }

    pub fn fail_on(&self, operation: &'static str) {
        self.inner.lock().unwrap().failing.insert(operation);
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn state(&self) -> DownloaderState {
        self.inner.lock().unwrap().state
    }

    pub fn tracked(&self) -> Vec<PathBuf> {
        self.inner.lock().unwrap().contents.keys().cloned().collect()
    }

    pub fn constraints(&self) -> Option<DownloadConstraints> {
        self.inner.lock().unwrap().constraints
    }

    /// Pushes a notification through the registered listener.
    pub fn emit(&self, notification: DownloaderNotification) {
        let inner = self.inner.lock().unwrap();
        inner
            .listener
            .as_ref()
            .expect("no listener registered")
            .send(notification)
            .unwrap();
    }

    fn enter(&self, operation: &'static str) -> Result<std::sync::MutexGuard<'_, FakeState>, BackendError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(operation.to_string());
        if inner.failing.contains(operation) {
            return Err(BackendError::Rejected {
                operation,
                reason: "fake failure".into(),
            });
        }
        Ok(inner)
    }
}

#[async_trait]
impl Downloader for FakeDownloader {
    async fn add_content(&self, dir: &Path, target: &DownloadTarget) -> Result<(), BackendError> {
        let mut inner = self.enter("add_content")?;
        inner.contents.insert(
            dir.to_path_buf(),
            ContentStatus::new(dir, ContentState::Pending, 0).with_content(target.clone()),
        );
        Ok(())
    }

    async fn resume(&self) -> Result<(), BackendError> {
        self.enter("resume")?.state = DownloaderState::Running;
        Ok(())
    }

    async fn pause(&self) -> Result<(), BackendError> {
        self.enter("pause")?.state = DownloaderState::Paused;
        Ok(())
    }

    async fn query_status(&self) -> Result<DownloaderStatus, BackendError> {
        let inner = self.enter("query_status")?;
        // Reverse order so the coordinator has to sort for itself.
        let paths = inner.contents.keys().rev().cloned().collect();
        Ok(DownloaderStatus {
            state: inner.state,
            paths,
        })
    }

    async fn query_content_status(&self, path: &Path) -> Result<ContentStatus, BackendError> {
        let inner = self.enter("query_content_status")?;
        inner
            .contents
            .get(path)
            .cloned()
            .ok_or_else(|| BackendError::UnknownPath(path.to_path_buf()))
    }

    async fn cancel_content(&self, path: &Path) -> Result<(), BackendError> {
        let mut inner = self.enter("cancel_content")?;
        inner
            .contents
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| BackendError::UnknownPath(path.to_path_buf()))
    }

    async fn set_listener(&self, listener: NotificationSender) -> Result<(), BackendError> {
        self.enter("set_listener")?.listener = Some(listener);
        Ok(())
    }

    async fn set_constraints(&self, constraints: DownloadConstraints) -> Result<(), BackendError> {
        self.enter("set_constraints")?.constraints = Some(constraints);
        Ok(())
    }
}

/// Store whose deletions always fail.
pub struct ReadOnlyStore;

#[async_trait]
impl ContentStore for ReadOnlyStore {
    async fn exists(&self, _path: &Path) -> bool {
        true
    }

    async fn delete_if_exists(&self, _path: &Path) -> std::io::Result<bool> {
        Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "read-only",
        ))
    }
}

pub fn target(dir: &Path) -> DownloadTarget {
    DownloadTarget::new(
        "http://content.example.com/Frozen-OnDemand/stream.mpd",
        SourceType::Dash,
        dir,
        "media.m4f",
    )
    .with_subtitle("subtitles.vtt")
    .with_tracks(["video-avc1", "audio-und-mp4a", "subtitles/fr"])
}

pub fn config(primary: &Path) -> CoordinatorConfig {
    CoordinatorConfig::new(primary, target(primary))
}

/// Everything queued on the event channel right now.
pub fn drain(rx: &mut EventReceiver) -> Vec<CoordinatorEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => return events,
        }
    }
}

pub fn ready_count(events: &[CoordinatorEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, CoordinatorEvent::ReadyForPlayback(_)))
        .count()
}
