// src/downloader.rs

use crate::capability::{BackendError, Downloader, DownloaderNotification, NotificationSender};
use crate::ledger::{ContentLedger, ContentRecord, LedgerError};
use crate::limiter::SpeedLimiter;
use crate::models::{
    ContentState, ContentStatus, DownloadConstraints, DownloadTarget, DownloaderState,
    DownloaderStatus,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Why a single transfer attempt stopped.
#[derive(Debug, Error)]
enum TransferError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server did not report a content length")]
    MissingLength,
    #[error("transfer ended at {got} of {expected} bytes")]
    Truncated { got: u64, expected: u64 },
    #[error("transfer cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("download ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),
}

const DEFAULT_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

struct Worker {
    id: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct Shared {
    client: Client,
    ledger: ContentLedger,
    limiter: SpeedLimiter,
    connections: Mutex<Arc<Semaphore>>,
    state: Mutex<DownloaderState>,
    records: Mutex<BTreeMap<PathBuf, ContentRecord>>,
    workers: Mutex<HashMap<PathBuf, Worker>>,
    listener: Mutex<Option<NotificationSender>>,
    next_worker_id: AtomicU64,
    retries: u32,
}

/// `Downloader` for single-file sources over HTTP(S).
///
/// Bookkeeping lives in a `ContentLedger`. A freshly opened downloader is
/// `Paused`, and anything that was downloading when the previous process
/// died is reported `Pending`, which is exactly what resume detection
/// looks for.
pub struct HttpDownloader {
    shared: Arc<Shared>,
}

impl HttpDownloader {
    pub async fn open(ledger_path: &Path) -> Result<Self, OpenError> {
        let ledger = ContentLedger::open(ledger_path).await?;
        let mut records = BTreeMap::new();
        for mut record in ledger.load_all().await? {
            if matches!(record.state, ContentState::Downloading | ContentState::Paused) {
                record.state = ContentState::Pending;
                ledger.save(&record).await?;
            }
            records.insert(record.path.clone(), record);
        }
        tracing::debug!(entries = records.len(), "Loaded download ledger");

        let constraints = DownloadConstraints::default();
        let client = Client::builder()
            .user_agent(concat!("offline-coordinator/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            shared: Arc::new(Shared {
                client,
                ledger,
                limiter: SpeedLimiter::new(constraints.max_bandwidth_bps),
                connections: Mutex::new(Arc::new(Semaphore::new(constraints.max_connections))),
                state: Mutex::new(DownloaderState::Paused),
                records: Mutex::new(records),
                workers: Mutex::new(HashMap::new()),
                listener: Mutex::new(None),
                next_worker_id: AtomicU64::new(1),
                retries: DEFAULT_RETRIES,
            }),
        })
    }
}

fn rejected(operation: &'static str) -> impl FnOnce(LedgerError) -> BackendError {
    move |e| BackendError::Rejected {
        operation,
        reason: e.to_string(),
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn add_content(&self, dir: &Path, target: &DownloadTarget) -> Result<(), BackendError> {
        if target.source_type().is_segmented() {
            return Err(BackendError::Unsupported(format!(
                "{:?} manifest at {}",
                target.source_type(),
                target.url()
            )));
        }

        let record = ContentRecord::new(dir, target.clone());
        self.shared
            .ledger
            .save(&record)
            .await
            .map_err(rejected("add_content"))?;
        let status = record.status();
        self.shared
            .records
            .lock()
            .await
            .insert(dir.to_path_buf(), record);
        tracing::info!(dir = %dir.display(), url = target.url(), "Content added");
        self.shared.notify(DownloaderNotification::Progress(status)).await;

        if *self.shared.state.lock().await == DownloaderState::Running {
            self.shared.spawn_worker(dir.to_path_buf()).await;
        }
        Ok(())
    }

    async fn resume(&self) -> Result<(), BackendError> {
        self.shared.set_state(DownloaderState::Running).await;
        let unfinished: Vec<PathBuf> = self
            .shared
            .records
            .lock()
            .await
            .values()
            .filter(|r| r.state != ContentState::Completed)
            .map(|r| r.path.clone())
            .collect();
        for path in unfinished {
            self.shared.spawn_worker(path).await;
        }
        Ok(())
    }

    async fn pause(&self) -> Result<(), BackendError> {
        self.shared.set_state(DownloaderState::Paused).await;
        for worker in self.shared.workers.lock().await.values() {
            worker.token.cancel();
        }
        Ok(())
    }

    async fn query_status(&self) -> Result<DownloaderStatus, BackendError> {
        let state = *self.shared.state.lock().await;
        let paths = self.shared.records.lock().await.keys().cloned().collect();
        Ok(DownloaderStatus { state, paths })
    }

    async fn query_content_status(&self, path: &Path) -> Result<ContentStatus, BackendError> {
        self.shared
            .records
            .lock()
            .await
            .get(path)
            .map(ContentRecord::status)
            .ok_or_else(|| BackendError::UnknownPath(path.to_path_buf()))
    }

    async fn cancel_content(&self, path: &Path) -> Result<(), BackendError> {
        // Removed before the worker stops, so its final update reports nothing.
        let removed = self.shared.records.lock().await.remove(path);
        let worker = self.shared.workers.lock().await.remove(path);
        if let Some(worker) = worker {
            worker.token.cancel();
            let _ = worker.handle.await;
        }
        if removed.is_none() {
            return Err(BackendError::UnknownPath(path.to_path_buf()));
        }
        self.shared
            .ledger
            .delete(path)
            .await
            .map_err(rejected("cancel_content"))?;
        tracing::info!(path = %path.display(), "Content cancelled");
        Ok(())
    }

    async fn set_listener(&self, listener: NotificationSender) -> Result<(), BackendError> {
        *self.shared.listener.lock().await = Some(listener);
        Ok(())
    }

    async fn set_constraints(&self, constraints: DownloadConstraints) -> Result<(), BackendError> {
        if constraints.max_connections == 0 {
            return Err(BackendError::Rejected {
                operation: "set_constraints",
                reason: "max_connections must be at least 1".into(),
            });
        }
        self.shared.limiter.set_rate(constraints.max_bandwidth_bps).await;
        *self.shared.connections.lock().await =
            Arc::new(Semaphore::new(constraints.max_connections));
        Ok(())
    }
}

impl Shared {
    async fn notify(&self, notification: DownloaderNotification) {
        if let Some(listener) = self.listener.lock().await.as_ref() {
            let _ = listener.send(notification);
        }
    }

    async fn set_state(&self, state: DownloaderState) {
        let changed = {
            let mut current = self.state.lock().await;
            let changed = *current != state;
            *current = state;
            changed
        };
        if changed {
            tracing::debug!(?state, "Downloader state changed");
            self.notify(DownloaderNotification::State(state)).await;
        }
    }

    /// Starts a worker for `path` unless a live one already exists.
    async fn spawn_worker(self: &Arc<Self>, path: PathBuf) {
        let mut workers = self.workers.lock().await;
        if let Some(existing) = workers.get(&path) {
            if !existing.handle.is_finished() && !existing.token.is_cancelled() {
                return;
            }
        }

        let id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        let shared = Arc::clone(self);
        let worker_path = path.clone();
        let worker_token = token.clone();
        let handle = tokio::spawn(async move {
            shared.run_worker(id, worker_path, worker_token).await;
        });
        workers.insert(path, Worker { id, token, handle });
    }

    async fn run_worker(self: Arc<Self>, id: u64, path: PathBuf, token: CancellationToken) {
        let semaphore = self.connections.lock().await.clone();
        let permit = tokio::select! {
            permit = semaphore.acquire_owned() => permit.ok(),
            _ = token.cancelled() => None,
        };

        let outcome = match permit {
            Some(_permit) => self.transfer_with_retries(&path, &token).await,
            None => Err(TransferError::Cancelled),
        };

        let final_state = match &outcome {
            Ok(()) => {
                tracing::info!(path = %path.display(), "Transfer finished");
                ContentState::Completed
            }
            Err(TransferError::Cancelled) => {
                tracing::debug!(path = %path.display(), "Transfer stopped");
                ContentState::Pending
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Transfer gave up");
                ContentState::Failing
            }
        };
        self.update(&path, |record| {
            record.state = final_state;
            if final_state == ContentState::Completed {
                record.downloaded_bytes = record.total_bytes;
            }
        })
        .await;

        let mut workers = self.workers.lock().await;
        if workers.get(&path).map(|w| w.id) == Some(id) {
            workers.remove(&path);
        }
    }

    async fn transfer_with_retries(
        &self,
        path: &Path,
        token: &CancellationToken,
    ) -> Result<(), TransferError> {
        let mut attempts = 0;
        loop {
            match self.transfer_once(path, token).await {
                Ok(()) => return Ok(()),
                Err(TransferError::Cancelled) => return Err(TransferError::Cancelled),
                Err(e) => {
                    attempts += 1;
                    if attempts > self.retries {
                        return Err(e);
                    }
                    tracing::warn!(path = %path.display(), attempt = attempts, error = %e, "Transfer failing, retrying");
                    self.update(path, |record| record.state = ContentState::Failing)
                        .await;
                    tokio::select! {
                        _ = tokio::time::sleep(RETRY_DELAY * attempts) => {}
                        _ = token.cancelled() => return Err(TransferError::Cancelled),
                    }
                }
            }
        }
    }

    /// One attempt: HEAD for the size, then a ranged GET appending to whatever is
    /// already on disk.
    async fn transfer_once(&self, path: &Path, token: &CancellationToken) -> Result<(), TransferError> {
        let Some(record) = self
            .update(path, |record| record.state = ContentState::Downloading)
            .await
        else {
            return Err(TransferError::Cancelled);
        };
        let url = record.target.url().to_owned();

        let head = self.client.head(&url).send().await?.error_for_status()?;
        let size = head
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or(TransferError::MissingLength)?;

        tokio::fs::create_dir_all(path).await?;
        let media_path = record.media_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&media_path)
            .await?;
        let mut written = file.metadata().await?.len();
        if written > size {
            file.set_len(0).await?;
            written = 0;
        }
        self.update(path, |record| {
            record.total_bytes = size;
            record.downloaded_bytes = written;
        })
        .await;
        if written == size {
            return Ok(());
        }

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::RANGE, format!("bytes={written}-"))
            .send()
            .await?
            .error_for_status()?;
        if written > 0 && response.status() != StatusCode::PARTIAL_CONTENT {
            tracing::debug!(path = %path.display(), "Server ignored range, restarting file");
            file.set_len(0).await?;
            written = 0;
        }

        let mut stream = response.bytes_stream();
        let mut reported = record.percentage();
        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = token.cancelled() => {
                    file.flush().await?;
                    return Err(TransferError::Cancelled);
                }
            };
            let Some(chunk) = chunk else { break };
            let bytes = chunk?;
            tokio::select! {
                _ = self.limiter.take(bytes.len() as u64) => {}
                _ = token.cancelled() => {
                    file.flush().await?;
                    return Err(TransferError::Cancelled);
                }
            }
            file.write_all(&bytes).await?;
            written += bytes.len() as u64;

            let percentage = percentage_of(written, size);
            if percentage != reported {
                reported = percentage;
                self.update(path, |record| record.downloaded_bytes = written)
                    .await;
            }
        }
        file.flush().await?;

        if written < size {
            return Err(TransferError::Truncated {
                got: written,
                expected: size,
            });
        }
        Ok(())
    }

    /// Applies `change` to the record at `path`, persists it and reports the
    /// new status. Returns `None` when the record has been cancelled.
    async fn update(
        &self,
        path: &Path,
        change: impl FnOnce(&mut ContentRecord),
    ) -> Option<ContentRecord> {
        let record = {
            let mut records = self.records.lock().await;
            let record = records.get_mut(path)?;
            change(record);
            record.clone()
        };
        if let Err(e) = self.ledger.save(&record).await {
            tracing::warn!(path = %path.display(), error = %e, "Could not persist content record");
        }
        self.notify(DownloaderNotification::Progress(record.status()))
            .await;
        Some(record)
    }
}

fn percentage_of(written: u64, size: u64) -> u8 {
    if size == 0 {
        return 0;
    }
    (written.saturating_mul(100) / size).min(99) as u8
}
