pub mod capability;
pub mod config;
pub mod coordinator;
pub mod downloader;
pub mod events;
pub mod ledger;
pub mod license;
pub mod limiter;
pub mod models;
pub mod store;

/// Convenient re-exports of the types most callers need.
pub mod prelude {
    pub use crate::capability::{
        BackendError, ContentStore, Downloader, DownloaderNotification, LicenseProvider,
        NotificationSender, PlaybackRequest, PlaybackSink,
    };
    pub use crate::config::{CoordinatorConfig, DownloadMode, LicenseSettings};
    pub use crate::coordinator::{CoordinatorError, DownloadLifecycleCoordinator, Startup};
    pub use crate::downloader::HttpDownloader;
    pub use crate::events::{CoordinatorEvent, EventReceiver};
    pub use crate::license::acquire_license;
    pub use crate::models::{
        ContentState, ContentStatus, CoordinatorState, DownloadConstraints, DownloadTarget,
        DownloaderState, DownloaderStatus, MediaContentType, SourceType,
    };
    pub use crate::store::FsContentStore;
}
