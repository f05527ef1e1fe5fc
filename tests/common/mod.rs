//! In-process mock storage device speaking the ferry wire protocol.
//!
//! Backed by a real directory so upload/download byte fidelity can be
//! asserted. Records every StartUpload (path, offset, arrival order) so
//! tests can observe the chunk-0-first ordering invariant, and carries a
//! couple of fault-injection knobs for retry and truncation scenarios.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use ferry::connection::DeviceAddr;
use ferry::protocol::{cmd, resp, HEADER_LEN};

#[derive(Debug, Clone)]
pub struct StartRecord {
    pub remote: String,
    pub offset: i64,
    pub full_size: i64,
    pub at: Instant,
}

#[derive(Default)]
pub struct Faults {
    /// Respond Error at EndUpload for the first N uploads whose remote path
    /// contains the needle.
    pub fail_uploads: Mutex<Option<(String, usize)>>,
    /// Deliver only this many bytes of a download body, then drop the
    /// connection.
    pub truncate_download_at: Mutex<Option<u64>>,
}

pub struct MockDevice {
    pub port: u16,
    pub root: PathBuf,
    pub starts: Arc<Mutex<Vec<StartRecord>>>,
    pub faults: Arc<Faults>,
    /// Uploads currently between StartUpload and the EndUpload response.
    pub active_uploads: Arc<AtomicUsize>,
    pub max_active_uploads: Arc<AtomicUsize>,
}

impl MockDevice {
    pub async fn spawn(root: PathBuf) -> MockDevice {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let device = MockDevice {
            port,
            root: root.clone(),
            starts: Arc::new(Mutex::new(Vec::new())),
            faults: Arc::new(Faults::default()),
            active_uploads: Arc::new(AtomicUsize::new(0)),
            max_active_uploads: Arc::new(AtomicUsize::new(0)),
        };
        let starts = Arc::clone(&device.starts);
        let faults = Arc::clone(&device.faults);
        let active = Arc::clone(&device.active_uploads);
        let max_active = Arc::clone(&device.max_active_uploads);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let root = root.clone();
                let starts = Arc::clone(&starts);
                let faults = Arc::clone(&faults);
                let active = Arc::clone(&active);
                let max_active = Arc::clone(&max_active);
                tokio::spawn(async move {
                    let _ = serve_conn(stream, root, starts, faults, active, max_active).await;
                });
            }
        });
        device
    }

    pub fn addr(&self) -> DeviceAddr {
        DeviceAddr::new("127.0.0.1", self.port)
    }

    pub fn start_offsets_for(&self, needle: &str) -> Vec<i64> {
        self.starts
            .lock()
            .iter()
            .filter(|s| s.remote.contains(needle))
            .map(|s| s.offset)
            .collect()
    }
}

fn map_path(root: &Path, remote: &str) -> PathBuf {
    root.join(remote.trim_start_matches('/'))
}

fn nul_str(payload: &[u8]) -> String {
    let end = payload
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

fn nul_str_pair(payload: &[u8]) -> (String, String) {
    let first_end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    let first = String::from_utf8_lossy(&payload[..first_end]).into_owned();
    let rest = payload.get(first_end + 1..).unwrap_or(&[]);
    (first, nul_str(rest))
}

async fn send_response(stream: &mut TcpStream, op: u8, payload: &[u8]) -> std::io::Result<()> {
    let mut hdr = [0u8; HEADER_LEN];
    hdr[0] = op;
    hdr[1..5].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    stream.write_all(&hdr).await?;
    if !payload.is_empty() {
        stream.write_all(payload).await?;
    }
    Ok(())
}

async fn send_error(stream: &mut TcpStream, msg: &str) -> std::io::Result<()> {
    let mut payload = msg.as_bytes().to_vec();
    payload.push(0);
    send_response(stream, resp::ERROR, &payload).await
}

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let mut hdr = [0u8; HEADER_LEN];
    stream.read_exact(&mut hdr).await?;
    let len = u32::from_le_bytes([hdr[1], hdr[2], hdr[3], hdr[4]]) as usize;
    let mut payload = vec![0u8; len];
    if len > 0 {
        stream.read_exact(&mut payload).await?;
    }
    Ok((hdr[0], payload))
}

struct UploadState {
    file: std::fs::File,
    remote: String,
}

async fn serve_conn(
    mut stream: TcpStream,
    root: PathBuf,
    starts: Arc<Mutex<Vec<StartRecord>>>,
    faults: Arc<Faults>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
) -> std::io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};

    let mut upload: Option<UploadState> = None;
    loop {
        let (op, payload) = match read_frame(&mut stream).await {
            Ok(f) => f,
            Err(_) => break,
        };
        match op {
            cmd::PING => send_response(&mut stream, resp::OK, &[]).await?,
            cmd::LIST_STORAGE => {
                let mut body = Vec::new();
                body.extend_from_slice(&1i32.to_le_bytes());
                let path = b"/data0";
                body.extend_from_slice(&(path.len() as u16).to_le_bytes());
                body.extend_from_slice(path);
                body.extend_from_slice(&(1_000_000_000_000i64).to_le_bytes());
                body.extend_from_slice(&(400_000_000_000i64).to_le_bytes());
                send_response(&mut stream, resp::DATA, &body).await?;
            }
            cmd::LIST_DIR => {
                let dir = map_path(&root, &nul_str(&payload));
                match std::fs::read_dir(&dir) {
                    Ok(rd) => {
                        let mut body = Vec::new();
                        let entries: Vec<_> = rd.flatten().collect();
                        body.extend_from_slice(&(entries.len() as i32).to_le_bytes());
                        for e in entries {
                            let meta = e.metadata().unwrap();
                            let name = e.file_name().to_string_lossy().into_owned();
                            body.push(if meta.is_dir() { 1 } else { 0 });
                            body.extend_from_slice(&(name.len() as u16).to_le_bytes());
                            body.extend_from_slice(name.as_bytes());
                            body.extend_from_slice(&(meta.len() as i64).to_le_bytes());
                            body.extend_from_slice(&1_700_000_000i64.to_le_bytes());
                        }
                        send_response(&mut stream, resp::DATA, &body).await?;
                    }
                    Err(_) => send_error(&mut stream, "Directory not found").await?,
                }
            }
            cmd::CREATE_DIR => {
                let dir = map_path(&root, &nul_str(&payload));
                match std::fs::create_dir_all(&dir) {
                    Ok(_) => send_response(&mut stream, resp::OK, &[]).await?,
                    Err(_) => send_error(&mut stream, "Cannot create directory").await?,
                }
            }
            cmd::DELETE_FILE => {
                let path = map_path(&root, &nul_str(&payload));
                match std::fs::remove_file(&path) {
                    Ok(_) => send_response(&mut stream, resp::OK, &[]).await?,
                    Err(_) => send_error(&mut stream, "Failed to delete file").await?,
                }
            }
            cmd::DELETE_DIR => {
                let path = map_path(&root, &nul_str(&payload));
                // Acceptance, progress chatter, then the terminal frame
                send_response(&mut stream, resp::OK, &[]).await?;
                send_response(&mut stream, resp::PROGRESS, b"Scanning folder\0").await?;
                send_response(&mut stream, resp::PROGRESS, b"Deleting... 1/2 files (50%)\0")
                    .await?;
                match std::fs::remove_dir_all(&path) {
                    Ok(_) => send_response(&mut stream, resp::OK, &[]).await?,
                    Err(_) => send_response(&mut stream, resp::ERROR, &[]).await?,
                }
            }
            cmd::RENAME | cmd::MOVE_FILE => {
                let (src, dst) = nul_str_pair(&payload);
                match std::fs::rename(map_path(&root, &src), map_path(&root, &dst)) {
                    Ok(_) => send_response(&mut stream, resp::OK, &[]).await?,
                    Err(_) => send_error(&mut stream, "Rename failed").await?,
                }
            }
            cmd::COPY_FILE => {
                let (src, dst) = nul_str_pair(&payload);
                match std::fs::copy(map_path(&root, &src), map_path(&root, &dst)) {
                    Ok(_) => send_response(&mut stream, resp::OK, &[]).await?,
                    Err(_) => send_error(&mut stream, "Copy failed").await?,
                }
            }
            cmd::START_UPLOAD => {
                let remote = nul_str(&payload);
                let tail = payload.get(remote.len() + 1..).unwrap_or(&[]);
                if tail.len() < 16 {
                    send_error(&mut stream, "Invalid upload request").await?;
                    continue;
                }
                let full_size = i64::from_le_bytes(tail[..8].try_into().unwrap());
                let offset = i64::from_le_bytes(tail[8..16].try_into().unwrap());
                starts.lock().push(StartRecord {
                    remote: remote.clone(),
                    offset,
                    full_size,
                    at: Instant::now(),
                });

                let path = map_path(&root, &remote);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).ok();
                }
                let file = if offset > 0 {
                    // Chunk mode: open existing, or create pre-allocated
                    let f = std::fs::OpenOptions::new().write(true).open(&path).or_else(
                        |_| -> std::io::Result<std::fs::File> {
                            let f = std::fs::File::create(&path)?;
                            f.set_len(full_size as u64)?;
                            Ok(f)
                        },
                    );
                    f.and_then(|mut f| {
                        f.seek(SeekFrom::Start(offset as u64))?;
                        Ok(f)
                    })
                } else {
                    std::fs::File::create(&path)
                };
                match file {
                    Ok(file) => {
                        upload = Some(UploadState { file, remote });
                        let n = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_active.fetch_max(n, Ordering::SeqCst);
                        send_response(&mut stream, resp::READY, &[]).await?;
                    }
                    Err(_) => send_error(&mut stream, "Cannot create file").await?,
                }
            }
            cmd::UPLOAD_CHUNK => {
                if let Some(state) = upload.as_mut() {
                    state.file.write_all(&payload)?;
                } else {
                    send_error(&mut stream, "No upload in progress").await?;
                }
            }
            cmd::END_UPLOAD => {
                let Some(state) = upload.take() else {
                    send_error(&mut stream, "No upload in progress").await?;
                    continue;
                };
                active.fetch_sub(1, Ordering::SeqCst);
                state.file.sync_all().ok();

                let inject = {
                    let mut guard = faults.fail_uploads.lock();
                    match guard.as_mut() {
                        Some((needle, n)) if *n > 0 && state.remote.contains(needle.as_str()) => {
                            *n -= 1;
                            true
                        }
                        _ => false,
                    }
                };
                if inject {
                    send_error(&mut stream, "Write failed").await?;
                } else {
                    send_response(&mut stream, resp::OK, &[]).await?;
                }
            }
            cmd::DOWNLOAD_FILE => {
                // Download paths arrive without a NUL terminator
                let remote = String::from_utf8_lossy(&payload).into_owned();
                let path = map_path(&root, &remote);
                let Ok(data) = std::fs::read(&path) else {
                    send_error(&mut stream, "File not found").await?;
                    continue;
                };
                let size = data.len() as u64;
                send_response(&mut stream, resp::DATA, &(size as i64).to_le_bytes()).await?;
                let limit = faults.truncate_download_at.lock().unwrap_or(size);
                stream.write_all(&data[..limit.min(size) as usize]).await?;
                if limit < size {
                    // Simulate the device dying mid-stream
                    break;
                }
            }
            cmd::SHUTDOWN => break,
            other => send_error(&mut stream, &format!("Unknown command {other:#04x}")).await?,
        }
    }
    Ok(())
}
