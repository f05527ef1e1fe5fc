//! Transfer engine: streams one file (or byte sub-range) over one connection
//!
//! Upload protocol on a single connection:
//! StartUpload -> Ready, then N UploadChunk frames (unacknowledged), then
//! EndUpload -> Ok/Error. The EndUpload response must be awaited even for a
//! sub-range transfer: the device pairs exactly one EndUpload per StartUpload
//! per connection, and skipping the wait desynchronizes any later use.
//!
//! Download protocol: DownloadFile -> Data frame carrying an 8-byte size,
//! then exactly that many raw bytes streamed on the socket, unframed.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::error::{FerryError, Result};
use crate::frame;
use crate::progress::{ProgressMeter, ProgressSample};
use crate::protocol::timeouts::READ_MS;
use crate::protocol::{cmd, resp, UPLOAD_BUF_SIZE};

/// What to upload: a whole file, or the `[offset, offset+len)` sub-range of
/// one. `len == 0` means "from offset to end of file".
#[derive(Debug, Clone)]
pub struct UploadSpec {
    pub local: PathBuf,
    pub remote: String,
    pub offset: u64,
    pub len: u64,
}

impl UploadSpec {
    pub fn whole_file(local: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        UploadSpec {
            local: local.into(),
            remote: remote.into(),
            offset: 0,
            len: 0,
        }
    }
}

/// An upload that has passed the StartUpload/Ready handshake but not yet
/// streamed its bytes. Splitting the handshake from the streaming lets the
/// chunk splitter open its chunk-0 gate at exactly the right moment.
pub struct Upload<'c> {
    conn: &'c mut Connection,
    file: File,
    send_len: u64,
}

impl<'c> Upload<'c> {
    /// Validate the local file, send StartUpload with the file's full logical
    /// size plus this connection's byte offset, and await Ready.
    pub async fn begin(conn: &'c mut Connection, spec: &UploadSpec) -> Result<Upload<'c>> {
        let meta = tokio::fs::metadata(&spec.local).await?;
        if !meta.is_file() {
            return Err(FerryError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", spec.local.display()),
            )));
        }
        let full_size = meta.len();
        let range_end = spec.offset.checked_add(spec.len);
        if spec.offset > full_size || range_end.is_none() || range_end.unwrap() > full_size {
            return Err(FerryError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "range {}+{} exceeds file size {}",
                    spec.offset, spec.len, full_size
                ),
            )));
        }
        let send_len = if spec.len == 0 {
            full_size - spec.offset
        } else {
            spec.len
        };

        let mut file = File::open(&spec.local).await?;
        if spec.offset > 0 {
            file.seek(SeekFrom::Start(spec.offset)).await?;
        }

        let payload =
            crate::protocol::encode_start_upload(&spec.remote, full_size as i64, spec.offset as i64);
        let (op, pl) = conn.request(cmd::START_UPLOAD, &payload).await?;
        match op {
            resp::READY => {}
            resp::ERROR => return Err(FerryError::Device(device_text(&pl))),
            other => {
                return Err(FerryError::Protocol(format!(
                    "expected Ready for StartUpload, got {:#04x}",
                    other
                )))
            }
        }

        Ok(Upload {
            conn,
            file,
            send_len,
        })
    }

    /// Stream the range as fixed-size UploadChunk frames, then send EndUpload
    /// and await its acknowledgment. Returns the byte count sent.
    ///
    /// Cancellation is cooperative: checked before each buffer, never
    /// mid-write. Any timeout, short read, or cancellation fails the whole
    /// operation - partial success is never reported as success.
    pub async fn run(
        mut self,
        cancel: &CancellationToken,
        mut progress: impl FnMut(ProgressSample),
    ) -> Result<u64> {
        let mut meter = ProgressMeter::new(self.send_len);
        let mut buf = vec![0u8; UPLOAD_BUF_SIZE];
        let mut sent: u64 = 0;

        while sent < self.send_len {
            if cancel.is_cancelled() {
                return Err(FerryError::Cancelled);
            }
            let to_read = (self.send_len - sent).min(buf.len() as u64) as usize;
            // A short read here means the file shrank under us
            self.file.read_exact(&mut buf[..to_read]).await?;
            frame::send_frame(self.conn.stream_mut(), cmd::UPLOAD_CHUNK, &buf[..to_read]).await?;
            sent += to_read as u64;
            if let Some(s) = meter.sample(sent) {
                progress(s);
            }
        }

        let (op, pl) = self.conn.request(cmd::END_UPLOAD, &[]).await?;
        match op {
            resp::OK => Ok(sent),
            resp::ERROR => Err(FerryError::Device(device_text(&pl))),
            other => Err(FerryError::Protocol(format!(
                "expected Ok for EndUpload, got {:#04x}",
                other
            ))),
        }
    }
}

/// StartUpload-to-EndUpload in one call.
pub async fn upload_file(
    conn: &mut Connection,
    spec: &UploadSpec,
    cancel: &CancellationToken,
    progress: impl FnMut(ProgressSample),
) -> Result<u64> {
    Upload::begin(conn, spec).await?.run(cancel, progress).await
}

/// Fetch a remote file into `local`. Returns the byte count received, which
/// always equals the device's declared size - anything short is an error.
pub async fn download_file(
    conn: &mut Connection,
    remote: &str,
    local: &Path,
    cancel: &CancellationToken,
    mut progress: impl FnMut(ProgressSample),
) -> Result<u64> {
    // The device parses the download path without a terminator
    frame::send_frame(conn.stream_mut(), cmd::DOWNLOAD_FILE, remote.as_bytes()).await?;

    let (op, payload) = frame::recv_frame(conn.stream_mut()).await?;
    match op {
        resp::DATA => {}
        // Error payload already drained by recv_frame
        resp::ERROR => return Err(FerryError::Device(device_text(&payload))),
        other => {
            return Err(FerryError::Protocol(format!(
                "expected Data for DownloadFile, got {:#04x}",
                other
            )))
        }
    }
    if payload.len() != 8 {
        return Err(FerryError::Protocol(format!(
            "DownloadFile size payload is {} bytes, expected 8",
            payload.len()
        )));
    }
    let declared = i64::from_le_bytes(payload[..8].try_into().unwrap());
    if declared < 0 {
        return Err(FerryError::Protocol(format!(
            "negative declared file size {}",
            declared
        )));
    }
    let declared = declared as u64;

    if let Some(parent) = local.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let mut file = File::create(local).await?;

    let mut meter = ProgressMeter::new(declared);
    let mut buf = vec![0u8; UPLOAD_BUF_SIZE];
    let mut received: u64 = 0;

    while received < declared {
        if cancel.is_cancelled() {
            return Err(FerryError::Cancelled);
        }
        let to_read = (declared - received).min(buf.len() as u64) as usize;
        let n = match timeout(
            Duration::from_millis(READ_MS),
            conn.stream_mut().read(&mut buf[..to_read]),
        )
        .await
        {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(FerryError::Timeout {
                    op: "read",
                    ms: READ_MS,
                })
            }
        };
        if n == 0 {
            break; // connection closed mid-stream; length check below fails
        }
        file.write_all(&buf[..n]).await?;
        received += n as u64;
        if let Some(s) = meter.sample(received) {
            progress(s);
        }
    }
    file.flush().await?;

    if received != declared {
        return Err(FerryError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("download truncated: got {} of {} bytes", received, declared),
        )));
    }
    Ok(received)
}

fn device_text(payload: &[u8]) -> String {
    if payload.is_empty() {
        "unspecified".to_string()
    } else {
        crate::protocol::decode_progress_text(payload)
    }
}
