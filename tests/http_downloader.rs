use axum::extract::Request;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use offline_coordinator::ledger::{ContentLedger, ContentRecord};
use offline_coordinator::prelude::*;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const BODY_SIZE: usize = 256 * 1024;

fn body() -> Vec<u8> {
    (0..BODY_SIZE).map(|i| (i % 251) as u8).collect()
}

async fn serve_head() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_LENGTH, BODY_SIZE.to_string())],
    )
}

async fn serve_file(req: Request) -> impl IntoResponse {
    let body = body();
    let total = body.len();

    let start = req
        .headers()
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("bytes="))
        .and_then(|v| v.trim_end_matches('-').parse::<usize>().ok());

    match start {
        Some(start) if start < total => (
            StatusCode::PARTIAL_CONTENT,
            [
                (header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, total - 1, total)),
                (header::CONTENT_LENGTH, (total - start).to_string()),
            ],
            body[start..].to_vec(),
        )
            .into_response(),
        _ => (
            StatusCode::OK,
            [(header::CONTENT_LENGTH, total.to_string())],
            body,
        )
            .into_response(),
    }
}

async fn start_server() -> SocketAddr {
    let app = Router::new().route("/media.mp4", get(serve_file).head(serve_head));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn single_file(addr: SocketAddr, dir: &Path) -> DownloadTarget {
    DownloadTarget::new(
        format!("http://{addr}/media.mp4"),
        SourceType::SingleFile,
        dir,
        "media.mp4",
    )
}

async fn wait_for_completion(
    rx: &mut mpsc::UnboundedReceiver<DownloaderNotification>,
    dir: &Path,
) -> Vec<ContentStatus> {
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(20), async {
        while let Some(notification) = rx.recv().await {
            if let DownloaderNotification::Progress(status) = notification {
                let done = status.path == dir && status.state == ContentState::Completed;
                seen.push(status);
                if done {
                    return;
                }
            }
        }
    })
    .await
    .expect("download did not complete");
    seen
}

#[tokio::test]
async fn downloads_single_file_and_reports_progress() {
    let addr = start_server().await;
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("rg_offline");

    let downloader = HttpDownloader::open(&tmp.path().join("ledger.db")).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    downloader.set_listener(tx).await.unwrap();
    downloader.add_content(&dir, &single_file(addr, &dir)).await.unwrap();
    downloader.resume().await.unwrap();

    let seen = wait_for_completion(&mut rx, &dir).await;

    assert_eq!(tokio::fs::read(dir.join("media.mp4")).await.unwrap(), body());
    let percentages: Vec<u8> = seen.iter().map(|s| s.downloaded_percentage).collect();
    assert!(percentages.windows(2).all(|w| w[0] <= w[1]), "{percentages:?}");
    assert_eq!(percentages.iter().filter(|p| **p == 100).count(), 1);

    let status = downloader.query_content_status(&dir).await.unwrap();
    assert_eq!(status.state, ContentState::Completed);
    assert_eq!(status.downloaded_percentage, 100);
}

#[tokio::test]
async fn continues_a_partial_file() {
    let addr = start_server().await;
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("rg_offline");
    tokio::fs::create_dir_all(&dir).await.unwrap();
    tokio::fs::write(dir.join("media.mp4"), &body()[..BODY_SIZE / 2])
        .await
        .unwrap();

    let downloader = HttpDownloader::open(&tmp.path().join("ledger.db")).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    downloader.set_listener(tx).await.unwrap();
    downloader.add_content(&dir, &single_file(addr, &dir)).await.unwrap();
    downloader.resume().await.unwrap();

    wait_for_completion(&mut rx, &dir).await;
    assert_eq!(tokio::fs::read(dir.join("media.mp4")).await.unwrap(), body());
}

#[tokio::test]
async fn interrupted_entries_come_back_paused_and_pending() {
    let tmp = tempfile::tempdir().unwrap();
    let db = tmp.path().join("ledger.db");
    let dir = tmp.path().join("rg_offline");

    {
        let ledger = ContentLedger::open(&db).await.unwrap();
        let mut record = ContentRecord::new(
            &dir,
            DownloadTarget::new("http://127.0.0.1:9/media.mp4", SourceType::SingleFile, &dir, "media.mp4"),
        );
        record.state = ContentState::Downloading;
        record.downloaded_bytes = 50;
        record.total_bytes = 100;
        ledger.save(&record).await.unwrap();
    }

    let downloader = HttpDownloader::open(&db).await.unwrap();
    let status = downloader.query_status().await.unwrap();
    assert_eq!(status.state, DownloaderState::Paused);
    assert_eq!(status.paths, vec![dir.clone()]);

    let content = downloader.query_content_status(&dir).await.unwrap();
    assert_eq!(content.state, ContentState::Pending);
    assert_eq!(content.downloaded_percentage, 50);
}

#[tokio::test]
async fn manifests_are_left_to_external_downloaders() {
    let tmp = tempfile::tempdir().unwrap();
    let downloader = HttpDownloader::open(&tmp.path().join("ledger.db")).await.unwrap();
    let target = DownloadTarget::new("http://example.com/stream.mpd", SourceType::Dash, tmp.path(), "media.m4f");

    let err = downloader.add_content(tmp.path(), &target).await.unwrap_err();
    assert!(matches!(err, BackendError::Unsupported(_)));
    assert!(downloader.query_status().await.unwrap().paths.is_empty());
}

#[tokio::test]
async fn cancelled_content_is_forgotten_across_restarts() {
    let tmp = tempfile::tempdir().unwrap();
    let db = tmp.path().join("ledger.db");
    let dir = tmp.path().join("rg_offline");
    let target = DownloadTarget::new("http://127.0.0.1:9/media.mp4", SourceType::SingleFile, &dir, "media.mp4");

    {
        let downloader = HttpDownloader::open(&db).await.unwrap();
        downloader.add_content(&dir, &target).await.unwrap();
        downloader.cancel_content(&dir).await.unwrap();
        assert!(matches!(
            downloader.cancel_content(&dir).await,
            Err(BackendError::UnknownPath(_))
        ));
    }

    let downloader = HttpDownloader::open(&db).await.unwrap();
    assert!(downloader.query_status().await.unwrap().paths.is_empty());
}

#[tokio::test]
async fn coordinator_drives_http_download_to_playback() {
    let addr = start_server().await;
    let tmp = tempfile::tempdir().unwrap();
    let primary = tmp.path().join("rg_offline");

    let mut config = CoordinatorConfig::new(&primary, single_file(addr, &primary));
    config.constraints = DownloadConstraints {
        max_bandwidth_bps: 0,
        max_connections: 1,
    };
    let downloader = HttpDownloader::open(&tmp.path().join("ledger.db")).await.unwrap();
    let (coordinator, mut events) =
        DownloadLifecycleCoordinator::new(config, Arc::new(downloader), Arc::new(FsContentStore));
    let coordinator = Arc::new(coordinator);

    assert_eq!(coordinator.bootstrap().await.unwrap(), Startup::Started);

    let ready = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            match events.recv().await {
                Some(CoordinatorEvent::ReadyForPlayback(status)) => return status,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("no playback hand-off");

    assert_eq!(ready.path, primary);
    assert_eq!(
        ready.media_uri(),
        Some(format!("file://{}", primary.join("media.mp4").display()))
    );
    assert_eq!(tokio::fs::read(primary.join("media.mp4")).await.unwrap(), body());
    coordinator.shutdown().await;
}

#[tokio::test]
async fn cleanup_of_running_download_leaves_nothing_tracked() {
    let addr = start_server().await;
    let tmp = tempfile::tempdir().unwrap();
    let primary = tmp.path().join("rg_offline");

    let mut config = CoordinatorConfig::new(&primary, single_file(addr, &primary));
    config.constraints = DownloadConstraints {
        max_bandwidth_bps: 32 * 1024,
        max_connections: 1,
    };
    let downloader = Arc::new(HttpDownloader::open(&tmp.path().join("ledger.db")).await.unwrap());
    let (coordinator, mut events) =
        DownloadLifecycleCoordinator::new(config, downloader.clone(), Arc::new(FsContentStore));
    let coordinator = Arc::new(coordinator);

    assert_eq!(coordinator.bootstrap().await.unwrap(), Startup::Started);
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Some(CoordinatorEvent::Progress { percentage, .. }) if percentage > 0 => return,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("download never started");

    tokio::time::timeout(Duration::from_secs(5), coordinator.cleanup(&primary))
        .await
        .expect("cleanup waited on a throttled transfer")
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(coordinator.snapshot().await.is_empty());
    assert_eq!(coordinator.state().await, CoordinatorState::Cleaned);
    assert!(downloader.query_status().await.unwrap().paths.is_empty());
    assert!(!coordinator.playback_triggered().await);
    coordinator.shutdown().await;
}
