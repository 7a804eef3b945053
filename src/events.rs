// src/events.rs

use crate::models::{ContentStatus, CoordinatorState, DownloaderState};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// Everything the coordinator tells its subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    StateChanged {
        from: CoordinatorState,
        to: CoordinatorState,
    },
    DownloaderStateChanged(DownloaderState),
    /// Percentage update for content under the primary directory.
    Progress {
        path: PathBuf,
        percentage: u8,
    },
    /// Non-fatal; the download may recover or the user has to retry.
    DownloadFailing(PathBuf),
    DownloadCompleted(PathBuf),
    /// Emitted at most once per coordinator.
    ReadyForPlayback(ContentStatus),
    /// No backend notification arrived for `idle` while running.
    DownloadStalled {
        idle: Duration,
    },
    /// More than one paused entry qualified for resume; `chosen` is the one reported.
    ResumeAmbiguous {
        candidates: Vec<PathBuf>,
        chosen: PathBuf,
    },
    BackendUnavailable {
        operation: &'static str,
        reason: String,
    },
    /// A best-effort file removal failed during cleanup.
    FileSystemError {
        path: PathBuf,
        reason: String,
    },
}

pub type EventReceiver = mpsc::UnboundedReceiver<CoordinatorEvent>;

/// Sending half handed to the coordinator. Never blocks; a dropped
/// subscriber only loses events.
#[derive(Debug, Clone)]
pub(crate) struct EventSender {
    tx: mpsc::UnboundedSender<CoordinatorEvent>,
}

impl EventSender {
    pub(crate) fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub(crate) fn emit(&self, event: CoordinatorEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("event subscriber dropped");
        }
    }
}
