// src/capability.rs

//! Collaborators the coordinator drives but does not implement.

use crate::models::{
    ContentStatus, DownloadConstraints, DownloadTarget, DownloaderState, DownloaderStatus,
    MediaContentType,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors raised by a downloader backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend rejected {operation}: {reason}")]
    Rejected { operation: &'static str, reason: String },
    #[error("no content tracked at {0}")]
    UnknownPath(PathBuf),
    #[error("unsupported source: {0}")]
    Unsupported(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a downloader pushes to its listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloaderNotification {
    State(DownloaderState),
    Progress(ContentStatus),
}

pub type NotificationSender = mpsc::UnboundedSender<DownloaderNotification>;
pub type NotificationReceiver = mpsc::UnboundedReceiver<DownloaderNotification>;

/// A media-download backend. Notifications may be delivered from any task.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn add_content(&self, dir: &Path, target: &DownloadTarget) -> Result<(), BackendError>;
    async fn resume(&self) -> Result<(), BackendError>;
    async fn pause(&self) -> Result<(), BackendError>;
    async fn query_status(&self) -> Result<DownloaderStatus, BackendError>;
    async fn query_content_status(&self, path: &Path) -> Result<ContentStatus, BackendError>;
    async fn cancel_content(&self, path: &Path) -> Result<(), BackendError>;
    /// Replaces any previously registered listener.
    async fn set_listener(&self, listener: NotificationSender) -> Result<(), BackendError>;
    async fn set_constraints(&self, constraints: DownloadConstraints) -> Result<(), BackendError>;
}

/// Filesystem access used when reconciling a download directory.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn exists(&self, path: &Path) -> bool;
    /// Returns whether a file was actually removed. A missing file is not an error.
    async fn delete_if_exists(&self, path: &Path) -> std::io::Result<bool>;
}

/// The DRM runtime that grants decryption rights.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LicenseProvider: Send + Sync {
    async fn initialize(&self, data_dir: &Path) -> Result<(), BackendError>;
    async fn is_personalized(&self) -> Result<bool, BackendError>;
    async fn personalize(&self) -> Result<(), BackendError>;
    async fn process_service_token(&self, token: &str) -> Result<(), BackendError>;
}

/// What a playback sink needs to build a playable source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackRequest {
    pub path: PathBuf,
    pub media_uri: String,
    pub subtitle_uri: Option<String>,
    pub content_type: MediaContentType,
}

/// Receives the single hand-off once downloaded media can be played.
#[async_trait]
pub trait PlaybackSink: Send + Sync {
    async fn ready_for_playback(&self, request: PlaybackRequest);
}
