//! Acquisition against a local mock mirror
//!
//! Run with: cargo test --test binary_manager_test

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures::StreamExt;
use mediadeck_lib::binaries::{
    Arch, ArtifactDescriptor, ArtifactKey, BinaryManager, Catalog, DownloadProgress,
    DownloadStatus, MirrorCatalogs, MirrorSelector, Platform, ProgressCallback, Tool,
};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone)]
struct MockMirror {
    archive: Arc<Vec<u8>>,
    hits: Arc<Mutex<HashMap<String, usize>>>,
}

impl MockMirror {
    fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}

fn build_archive() -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default().unix_permissions(0o644);
    writer.start_file("pkg-1.0/bin/tool", options).unwrap();
    writer.write_all(b"#!/bin/sh\necho tool\n").unwrap();
    writer.start_file("pkg-1.0/README", options).unwrap();
    writer.write_all(b"readme").unwrap();
    writer.finish().unwrap().into_inner()
}

async fn handle(State(mirror): State<MockMirror>, uri: Uri) -> Response {
    let path = uri.path().to_string();
    *mirror.hits.lock().unwrap().entry(path.clone()).or_default() += 1;

    if let Some(rest) = path.strip_prefix("/redirect/") {
        let hops: usize = rest.split('/').next().unwrap().parse().unwrap();
        if hops == 0 {
            return mirror.archive.as_ref().clone().into_response();
        }
        let location = format!("/redirect/{}/tool.zip", hops - 1);
        return (StatusCode::FOUND, [(header::LOCATION, location)]).into_response();
    }

    match path.as_str() {
        "/default/tool.zip" | "/region-ok/tool.zip" => mirror.archive.as_ref().clone().into_response(),
        "/error/tool.zip" => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        "/slow/tool.zip" => {
            // One chunk, then the transfer stalls forever
            let stream = futures::stream::once(async {
                Ok::<_, std::convert::Infallible>(Bytes::from(vec![0u8; 4096]))
            })
            .chain(futures::stream::pending());
            Body::from_stream(stream).into_response()
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn serve() -> (SocketAddr, MockMirror) {
    let mirror = MockMirror {
        archive: Arc::new(build_archive()),
        hits: Arc::new(Mutex::new(HashMap::new())),
    };
    let router = Router::new().fallback(handle).with_state(mirror.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, mirror)
}

fn key() -> ArtifactKey {
    ArtifactKey::new(Tool::MediaTranscoder, Platform::Linux, Arch::X64)
}

fn descriptor(addr: SocketAddr, version: &str, path: &str) -> ArtifactDescriptor {
    ArtifactDescriptor {
        tool: Tool::MediaTranscoder,
        platform: Platform::Linux,
        arch: Arch::X64,
        version: version.to_string(),
        url: format!("http://{}{}", addr, path),
        size: 0,
        sha256: None,
        executable: "pkg-*/bin/tool".to_string(),
    }
}

fn manager(
    root: &Path,
    default: Vec<ArtifactDescriptor>,
    region: Vec<ArtifactDescriptor>,
    in_region: bool,
) -> Arc<BinaryManager> {
    let catalogs = MirrorCatalogs::new(Catalog::new(default), Catalog::new(region));
    Arc::new(
        BinaryManager::new(root, catalogs, Arc::new(MirrorSelector::fixed(in_region))).unwrap(),
    )
}

fn recorder() -> (ProgressCallback, Arc<Mutex<Vec<DownloadProgress>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback: ProgressCallback = Arc::new(move |p: &DownloadProgress| {
        sink.lock().unwrap().push(p.clone());
    });
    (callback, seen)
}

#[tokio::test]
async fn test_acquire_installs_and_is_idempotent() {
    let (addr, mirror) = serve().await;
    let dir = tempfile::tempdir().unwrap();
    let m = manager(dir.path(), vec![descriptor(addr, "1.0", "/default/tool.zip")], vec![], false);
    let (callback, seen) = recorder();

    let path = m.acquire(key(), Some(callback)).await.unwrap();
    assert_eq!(path, dir.path().join("media-transcoder/1.0-linux-x64/tool"));
    assert_eq!(std::fs::read(&path).unwrap(), b"#!/bin/sh\necho tool\n");
    assert!(m.is_installed(&key()));

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    // Temp download/extraction directory is gone
    assert!(!dir.path().join("media-transcoder/.temp/media-transcoder-linux-x64").exists());

    let statuses: Vec<_> = seen.lock().unwrap().iter().map(|p| p.status).collect();
    assert!(statuses.contains(&DownloadStatus::Downloading));
    assert!(statuses.contains(&DownloadStatus::Extracting));
    assert_eq!(statuses.last(), Some(&DownloadStatus::Completed));
    assert!(m.task(&key()).is_none());

    // Second call: no network
    let again = m.acquire(key(), None).await.unwrap();
    assert_eq!(again, path);
    assert_eq!(mirror.hits("/default/tool.zip"), 1);
}

#[tokio::test]
async fn test_follows_up_to_five_redirects() {
    let (addr, _mirror) = serve().await;
    let dir = tempfile::tempdir().unwrap();

    let m = manager(dir.path(), vec![descriptor(addr, "1.0", "/redirect/5/tool.zip")], vec![], false);
    m.acquire(key(), None).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let m = manager(dir.path(), vec![descriptor(addr, "1.0", "/redirect/6/tool.zip")], vec![], false);
    let err = m.acquire(key(), None).await.unwrap_err();
    assert_eq!(err.code(), "E_TOO_MANY_REDIRECTS");
    assert!(!m.is_installed(&key()));
}

#[tokio::test]
async fn test_http_status_failure() {
    let (addr, _mirror) = serve().await;
    let dir = tempfile::tempdir().unwrap();
    let m = manager(dir.path(), vec![descriptor(addr, "1.0", "/missing/tool.zip")], vec![], false);

    let (callback, seen) = recorder();
    let err = m.acquire(key(), Some(callback)).await.unwrap_err();
    assert_eq!(err.code(), "E_HTTP_STATUS");
    assert!(err.to_string().contains("404"));
    assert_eq!(seen.lock().unwrap().last().map(|p| p.status), Some(DownloadStatus::Error));
}

#[tokio::test]
async fn test_region_failure_falls_back_to_default() {
    let (addr, mirror) = serve().await;
    let dir = tempfile::tempdir().unwrap();
    let m = manager(
        dir.path(),
        vec![descriptor(addr, "1.0", "/default/tool.zip")],
        vec![descriptor(addr, "1.0-region", "/error/tool.zip")],
        true,
    );

    let path = m.acquire(key(), None).await.unwrap();
    assert_eq!(path, dir.path().join("media-transcoder/1.0-linux-x64/tool"));
    assert_eq!(mirror.hits("/error/tool.zip"), 1);
    assert_eq!(mirror.hits("/default/tool.zip"), 1);
}

#[tokio::test]
async fn test_region_success_uses_region_version() {
    let (addr, mirror) = serve().await;
    let dir = tempfile::tempdir().unwrap();
    let m = manager(
        dir.path(),
        vec![descriptor(addr, "1.0", "/default/tool.zip")],
        vec![descriptor(addr, "1.0-region", "/region-ok/tool.zip")],
        true,
    );

    let path = m.acquire(key(), None).await.unwrap();
    assert_eq!(path, dir.path().join("media-transcoder/1.0-region-linux-x64/tool"));
    assert_eq!(mirror.hits("/default/tool.zip"), 0);
}

#[tokio::test]
async fn test_default_failure_tries_no_other_mirror() {
    let (addr, mirror) = serve().await;
    let dir = tempfile::tempdir().unwrap();
    let m = manager(
        dir.path(),
        vec![descriptor(addr, "1.0", "/error/tool.zip")],
        vec![descriptor(addr, "1.0-region", "/region-ok/tool.zip")],
        false,
    );

    let err = m.acquire(key(), None).await.unwrap_err();
    assert_eq!(err.code(), "E_HTTP_STATUS");
    assert_eq!(mirror.hits("/error/tool.zip"), 1);
    assert_eq!(mirror.hits("/region-ok/tool.zip"), 0);
}

#[tokio::test]
async fn test_concurrent_acquire_rejected_then_cancel() {
    let (addr, _mirror) = serve().await;
    let dir = tempfile::tempdir().unwrap();
    let m = manager(
        dir.path(),
        vec![descriptor(addr, "1.0", "/default/tool.zip")],
        vec![descriptor(addr, "1.0-region", "/slow/tool.zip")],
        true,
    );

    let (callback, seen) = recorder();
    let first = tokio::spawn({
        let m = Arc::clone(&m);
        async move { m.acquire(key(), Some(callback)).await }
    });

    // Wait until the stalled transfer has reported some bytes
    let started = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(task) = m.task(&key()) {
                if task.downloaded > 0 {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("download never reported progress");
    assert_eq!(started.status, DownloadStatus::Downloading);
    assert_eq!(m.tasks().len(), 1);

    let err = m.acquire(key(), None).await.unwrap_err();
    assert_eq!(err.code(), "E_BUSY");
    let still = m.task(&key()).unwrap();
    assert_eq!(still.status, DownloadStatus::Downloading);
    assert!(still.downloaded >= started.downloaded);

    assert!(m.cancel(&key()));
    let result = first.await.unwrap();
    let err = result.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(err.code(), "E_CANCELLED");

    // Cancellation never falls back to the default mirror and leaves nothing behind
    assert!(!m.is_installed(&key()));
    assert!(m.task(&key()).is_none());
    assert!(!m.cancel(&key()));
    assert!(!dir.path().join("media-transcoder/.temp/media-transcoder-linux-x64").exists());
    assert_eq!(
        seen.lock().unwrap().last().map(|p| p.status),
        Some(DownloadStatus::Cancelled)
    );
}

#[tokio::test]
async fn test_checksum_verification() {
    let (addr, mirror) = serve().await;
    let expected = hex::encode(Sha256::digest(mirror.archive.as_slice()));

    let dir = tempfile::tempdir().unwrap();
    let mut good = descriptor(addr, "1.0", "/default/tool.zip");
    good.sha256 = Some(expected.to_uppercase());
    let m = manager(dir.path(), vec![good], vec![], false);
    m.acquire(key(), None).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let mut bad = descriptor(addr, "1.0", "/default/tool.zip");
    bad.sha256 = Some("0".repeat(64));
    let m = manager(dir.path(), vec![bad], vec![], false);
    let err = m.acquire(key(), None).await.unwrap_err();
    assert_eq!(err.code(), "E_CHECKSUM_MISMATCH");
    assert!(!m.is_installed(&key()));
}

#[tokio::test]
async fn test_missing_executable_is_failure() {
    let (addr, _mirror) = serve().await;
    let dir = tempfile::tempdir().unwrap();
    let mut d = descriptor(addr, "1.0", "/default/tool.zip");
    d.executable = "pkg-*/bin/other".to_string();
    let m = manager(dir.path(), vec![d], vec![], false);

    let err = m.acquire(key(), None).await.unwrap_err();
    assert_eq!(err.code(), "E_EXECUTABLE_MISSING");
    assert!(!dir.path().join("media-transcoder/1.0-linux-x64/other").exists());
}

#[tokio::test]
async fn test_remove_then_reacquire() {
    let (addr, mirror) = serve().await;
    let dir = tempfile::tempdir().unwrap();
    let m = manager(dir.path(), vec![descriptor(addr, "1.0", "/default/tool.zip")], vec![], false);

    m.acquire(key(), None).await.unwrap();
    assert!(m.remove(&key()).await.unwrap());
    assert!(!m.is_installed(&key()));
    assert!(!m.remove(&key()).await.unwrap());

    m.acquire(key(), None).await.unwrap();
    assert_eq!(mirror.hits("/default/tool.zip"), 2);
}
