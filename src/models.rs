// src/models.rs

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How the source at `DownloadTarget::url` is packaged.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// Segmented DASH manifest.
    Dash,
    /// Segmented HLS playlist.
    Hls,
    /// One file fetched as a whole.
    SingleFile,
}

impl SourceType {
    pub fn is_segmented(self) -> bool {
        matches!(self, SourceType::Dash | SourceType::Hls)
    }
}

/// Media container kinds a playback sink can be handed, with their MIME types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MediaContentType {
    Dash,
    Hls,
    Pdcf,
    M4f,
    Dcf,
    Bbts,
}

impl MediaContentType {
    pub fn mime_type(self) -> &'static str {
        match self {
            MediaContentType::Dash => "application/dash+xml",
            MediaContentType::Hls => "application/vnd.apple.mpegurl",
            MediaContentType::Pdcf | MediaContentType::M4f => "video/mp4",
            MediaContentType::Dcf => "application/vnd.oma.drm.dcf",
            MediaContentType::Bbts => "video/mp2t",
        }
    }

    /// The kind of source a player has to build for this content type.
    /// Anything that is not a manifest is played as a single file.
    pub fn source_type(self) -> SourceType {
        match self {
            MediaContentType::Dash => SourceType::Dash,
            MediaContentType::Hls => SourceType::Hls,
            _ => SourceType::SingleFile,
        }
    }
}

/// Identifies one content item to fetch. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DownloadTarget {
    url: String,
    source_type: SourceType,
    destination_dir: PathBuf,
    media_file_name: String,
    #[serde(default)]
    subtitle_file_name: Option<String>,
    #[serde(default)]
    tracks: Vec<String>,
}

impl DownloadTarget {
    pub fn new(
        url: impl Into<String>,
        source_type: SourceType,
        destination_dir: impl Into<PathBuf>,
        media_file_name: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            source_type,
            destination_dir: destination_dir.into(),
            media_file_name: media_file_name.into(),
            subtitle_file_name: None,
            tracks: Vec::new(),
        }
    }

    pub fn with_subtitle(mut self, file_name: impl Into<String>) -> Self {
        self.subtitle_file_name = Some(file_name.into());
        self
    }

    pub fn with_tracks<I, S>(mut self, tracks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tracks = tracks.into_iter().map(Into::into).collect();
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn source_type(&self) -> SourceType {
        self.source_type
    }

    pub fn destination_dir(&self) -> &Path {
        &self.destination_dir
    }

    pub fn media_file_name(&self) -> &str {
        &self.media_file_name
    }

    pub fn subtitle_file_name(&self) -> Option<&str> {
        self.subtitle_file_name.as_deref()
    }

    pub fn tracks(&self) -> &[String] {
        &self.tracks
    }

    /// Every file this target leaves in a download directory.
    pub fn file_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.media_file_name.as_str()).chain(self.subtitle_file_name.as_deref())
    }
}

/// Limits handed to the downloader before anything starts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DownloadConstraints {
    /// Bytes per second, 0 means unlimited.
    pub max_bandwidth_bps: u64,
    pub max_connections: usize,
}

impl Default for DownloadConstraints {
    fn default() -> Self {
        Self {
            max_bandwidth_bps: 20 * 1024 * 1024,
            max_connections: 2,
        }
    }
}

/// Lifecycle of one tracked content entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ContentState {
    Pending,
    Downloading,
    Paused,
    Completed,
    Failing,
}

/// The backend's view of one content entry, keyed by its download directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentStatus {
    pub path: PathBuf,
    pub state: ContentState,
    /// 0..=100.
    pub downloaded_percentage: u8,
    /// The target registered at `path`, when the backend still knows it.
    pub content: Option<DownloadTarget>,
}

impl ContentStatus {
    pub fn new(path: impl Into<PathBuf>, state: ContentState, downloaded_percentage: u8) -> Self {
        Self {
            path: path.into(),
            state,
            downloaded_percentage: downloaded_percentage.min(100),
            content: None,
        }
    }

    pub fn with_content(mut self, content: DownloadTarget) -> Self {
        self.content = Some(content);
        self
    }

    /// `file://` URI of the downloaded media file.
    pub fn media_uri(&self) -> Option<String> {
        let content = self.content.as_ref()?;
        Some(file_uri(&self.path, content.media_file_name()))
    }

    /// `file://` URI of the downloaded subtitle file, if the target has one.
    pub fn subtitle_uri(&self) -> Option<String> {
        let content = self.content.as_ref()?;
        content
            .subtitle_file_name()
            .map(|name| file_uri(&self.path, name))
    }
}

fn file_uri(dir: &Path, file_name: &str) -> String {
    format!("file://{}", dir.join(file_name).display())
}

/// Aggregate state of the downloader backend across all its content.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DownloaderState {
    Running,
    Paused,
}

/// Result of `Downloader::query_status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloaderStatus {
    pub state: DownloaderState,
    pub paths: Vec<PathBuf>,
}

/// Lifecycle of the coordinator itself.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CoordinatorState {
    Uninitialized,
    /// A paused download was found; waiting for the caller to resume or decline.
    ResumablePendingDecision,
    /// Nothing to resume; a fresh download may start.
    Fresh,
    /// Previous artifacts and backend entries have been removed.
    Cleaned,
    Running,
    /// Every tracked entry completed.
    Done,
}
