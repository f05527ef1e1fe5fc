//! End-to-end tests for the connection and transfer engine against an
//! in-process mock device.

mod common;

use std::io::Write;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use common::MockDevice;
use ferry::chunker;
use ferry::transfer::{self, Upload, UploadSpec};
use ferry::FerryError;

fn write_patterned(path: &std::path::Path, size: usize) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let mut f = std::fs::File::create(path).unwrap();
    let mut buf = vec![0u8; 64 * 1024];
    let mut remaining = size;
    let mut val: u8 = 0;
    while remaining > 0 {
        for b in buf.iter_mut() {
            *b = val;
            val = val.wrapping_add(1);
        }
        let n = remaining.min(buf.len());
        f.write_all(&buf[..n]).unwrap();
        remaining -= n;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ping_and_storage_listing() {
    let root = tempfile::tempdir().unwrap();
    let device = MockDevice::spawn(root.path().to_path_buf()).await;

    let mut conn = device.addr().connect().await.unwrap();
    conn.ping().await.unwrap();
    let storage = conn.list_storage().await.unwrap();
    assert_eq!(storage.len(), 1);
    assert_eq!(storage[0].path, "/data0");
    assert!(storage[0].free_bytes < storage[0].total_bytes);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upload_single_file_round_trip() {
    let root = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let device = MockDevice::spawn(root.path().to_path_buf()).await;

    let local = src.path().join("payload.bin");
    write_patterned(&local, 300 * 1024);

    let cancel = CancellationToken::new();
    let mut conn = device.addr().connect().await.unwrap();
    let mut last_sample = None;
    let sent = transfer::upload_file(
        &mut conn,
        &UploadSpec::whole_file(&local, "/dst/payload.bin"),
        &cancel,
        |s| last_sample = Some(s),
    )
    .await
    .unwrap();

    assert_eq!(sent, 300 * 1024);
    // One StartUpload/EndUpload pair on one connection for a small file
    assert_eq!(device.start_offsets_for("payload.bin"), vec![0]);
    // The final 100% report is never throttled away
    let last = last_sample.unwrap();
    assert_eq!(last.bytes_sent, 300 * 1024);
    assert_eq!(last.total_bytes, 300 * 1024);

    let uploaded = std::fs::read(root.path().join("dst/payload.bin")).unwrap();
    let original = std::fs::read(&local).unwrap();
    assert_eq!(uploaded, original);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upload_sub_range_lands_at_offset() {
    let root = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let device = MockDevice::spawn(root.path().to_path_buf()).await;

    let local = src.path().join("big.bin");
    write_patterned(&local, 4096);

    let cancel = CancellationToken::new();
    let mut conn = device.addr().connect().await.unwrap();
    let spec = UploadSpec {
        local: local.clone(),
        remote: "/dst/big.bin".into(),
        offset: 1024,
        len: 512,
    };
    let sent = Upload::begin(&mut conn, &spec)
        .await
        .unwrap()
        .run(&cancel, |_| {})
        .await
        .unwrap();
    assert_eq!(sent, 512);

    // StartUpload carried the full logical size and the range offset
    let starts = device.starts.lock().clone();
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].offset, 1024);
    assert_eq!(starts[0].full_size, 4096);

    let uploaded = std::fs::read(root.path().join("dst/big.bin")).unwrap();
    let original = std::fs::read(&local).unwrap();
    // Pre-allocated to full size, with exactly the sub-range written
    assert_eq!(uploaded.len(), 4096);
    assert_eq!(&uploaded[1024..1536], &original[1024..1536]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upload_range_beyond_eof_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let device = MockDevice::spawn(root.path().to_path_buf()).await;

    let local = src.path().join("small.bin");
    write_patterned(&local, 100);

    let mut conn = device.addr().connect().await.unwrap();
    let spec = UploadSpec {
        local,
        remote: "/dst/small.bin".into(),
        offset: 50,
        len: 100,
    };
    match Upload::begin(&mut conn, &spec).await {
        Err(FerryError::Io(_)) => {}
        other => panic!("expected io error, got {:?}", other.err()),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn download_round_trip() {
    let root = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let device = MockDevice::spawn(root.path().to_path_buf()).await;

    let remote_backing = root.path().join("data/save.bin");
    write_patterned(&remote_backing, 256 * 1024);

    let cancel = CancellationToken::new();
    let mut conn = device.addr().connect().await.unwrap();
    let local = dst.path().join("save.bin");
    let got = transfer::download_file(&mut conn, "/data/save.bin", &local, &cancel, |_| {})
        .await
        .unwrap();
    assert_eq!(got, 256 * 1024);
    assert_eq!(
        std::fs::read(&local).unwrap(),
        std::fs::read(&remote_backing).unwrap()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn truncated_download_is_failure_not_partial_success() {
    let root = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let device = MockDevice::spawn(root.path().to_path_buf()).await;

    write_patterned(&root.path().join("data/movie.bin"), 1_048_576);
    *device.faults.truncate_download_at.lock() = Some(900_000);

    let cancel = CancellationToken::new();
    let mut conn = device.addr().connect().await.unwrap();
    let local = dst.path().join("movie.bin");
    let result = transfer::download_file(&mut conn, "/data/movie.bin", &local, &cancel, |_| {}).await;
    match result {
        Err(FerryError::Io(e)) => {
            assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof);
        }
        other => panic!("expected truncation failure, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn download_missing_file_is_device_error() {
    let root = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let device = MockDevice::spawn(root.path().to_path_buf()).await;

    let cancel = CancellationToken::new();
    let mut conn = device.addr().connect().await.unwrap();
    let local = dst.path().join("nope.bin");
    match transfer::download_file(&mut conn, "/data/nope.bin", &local, &cancel, |_| {}).await {
        Err(FerryError::Device(msg)) => assert!(msg.contains("not found")),
        other => panic!("expected device error, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_dir_streams_progress_then_terminal() {
    let root = tempfile::tempdir().unwrap();
    let device = MockDevice::spawn(root.path().to_path_buf()).await;

    std::fs::create_dir_all(root.path().join("data/old/sub")).unwrap();
    std::fs::write(root.path().join("data/old/a.bin"), b"x").unwrap();

    let mut conn = device.addr().connect().await.unwrap();
    let mut messages = Vec::new();
    let started = Instant::now();
    conn.delete_dir("/data/old", |msg| messages.push(msg.to_string()))
        .await
        .unwrap();

    assert!(!messages.is_empty());
    assert!(messages.iter().any(|m| m.contains("Deleting")));
    assert!(!root.path().join("data/old").exists());
    // Settle interval before the connection may be reused
    assert!(started.elapsed().as_millis() >= 500);
    // And the connection is in fact reusable afterwards
    conn.ping().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_management_ops() {
    let root = tempfile::tempdir().unwrap();
    let device = MockDevice::spawn(root.path().to_path_buf()).await;

    let mut conn = device.addr().connect().await.unwrap();
    conn.create_dir("/data/games").await.unwrap();
    assert!(root.path().join("data/games").is_dir());

    std::fs::write(root.path().join("data/games/a.pkg"), b"abc").unwrap();
    conn.copy_file("/data/games/a.pkg", "/data/games/b.pkg")
        .await
        .unwrap();
    conn.rename("/data/games/a.pkg", "/data/games/c.pkg")
        .await
        .unwrap();

    let mut names: Vec<String> = conn
        .list_dir("/data/games")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["b.pkg".to_string(), "c.pkg".to_string()]);

    conn.delete_file("/data/games/b.pkg").await.unwrap();
    assert!(!root.path().join("data/games/b.pkg").exists());

    // Deleting it again is a device error, surfaced as such
    match conn.delete_file("/data/games/b.pkg").await {
        Err(FerryError::Device(_)) => {}
        other => panic!("expected device error, got {:?}", other.err()),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chunked_upload_orders_chunk_zero_first() {
    let root = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let device = MockDevice::spawn(root.path().to_path_buf()).await;

    let local = src.path().join("huge.bin");
    write_patterned(&local, 300 * 1024);

    let cancel = CancellationToken::new();
    let sent = chunker::upload_chunked(
        &device.addr(),
        &local,
        "/dst/huge.bin",
        128 * 1024,
        &cancel,
        std::sync::Arc::new(|_s: ferry::progress::ProgressSample| {}),
    )
    .await
    .unwrap();
    assert_eq!(sent, 300 * 1024);

    let starts = device.starts.lock().clone();
    assert_eq!(starts.len(), 3);
    let mut offsets: Vec<i64> = starts.iter().map(|s| s.offset).collect();
    offsets.sort();
    assert_eq!(offsets, vec![0, 128 * 1024, 256 * 1024]);
    // Chunk 0 begins its StartUpload before any chunk with index > 0
    let zero_at = starts.iter().find(|s| s.offset == 0).unwrap().at;
    for s in starts.iter().filter(|s| s.offset > 0) {
        assert!(s.at > zero_at, "chunk at offset {} started before chunk 0", s.offset);
    }
    // Every chunk declared the full logical size
    assert!(starts.iter().all(|s| s.full_size == 300 * 1024));

    let uploaded = std::fs::read(root.path().join("dst/huge.bin")).unwrap();
    assert_eq!(uploaded, std::fs::read(&local).unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_upload_reports_cancelled() {
    let root = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let device = MockDevice::spawn(root.path().to_path_buf()).await;

    let local = src.path().join("payload.bin");
    write_patterned(&local, 64 * 1024);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut conn = device.addr().connect().await.unwrap();
    match transfer::upload_file(
        &mut conn,
        &UploadSpec::whole_file(&local, "/dst/payload.bin"),
        &cancel,
        |_| {},
    )
    .await
    {
        Err(FerryError::Cancelled) => {}
        other => panic!("expected cancellation, got {:?}", other.map(|_| ())),
    }
}
