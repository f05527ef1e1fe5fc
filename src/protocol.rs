//! Shared protocol constants and payload layouts for the ferry framed transport
//!
//! Every message on the wire is `[1-byte opcode][u32 LE length][payload]`.
//! Integers inside payloads are little-endian; paths are UTF-8, usually
//! NUL-terminated (the device parses them with strlen).

use chrono::{DateTime, TimeZone, Utc};

use crate::error::{FerryError, Result};

/// Default TCP port of the device daemon.
pub const DEFAULT_PORT: u16 = 9113;

/// Opcode byte + u32 length.
pub const HEADER_LEN: usize = 5;

// Maximum inbound frame payload (64MB) - prevents memory exhaustion from a
// corrupt or hostile length field
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Upload buffer size: one UploadChunk frame's payload (8 MiB).
pub const UPLOAD_BUF_SIZE: usize = 8 * 1024 * 1024;

/// Files above this size are split into chunks on separate connections.
pub const CHUNK_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Fixed chunk size for split uploads (last chunk = remainder).
pub const CHUNK_SIZE: u64 = 500 * 1024 * 1024;

// Command opcodes (keep numeric values stable - the device hardcodes them)
pub mod cmd {
    pub const PING: u8 = 0x01;
    pub const LIST_STORAGE: u8 = 0x02;
    pub const LIST_DIR: u8 = 0x03;
    pub const CREATE_DIR: u8 = 0x04;
    pub const DELETE_FILE: u8 = 0x05;
    pub const DELETE_DIR: u8 = 0x06;
    pub const RENAME: u8 = 0x07;
    pub const COPY_FILE: u8 = 0x08;
    pub const MOVE_FILE: u8 = 0x09;
    pub const START_UPLOAD: u8 = 0x10;
    pub const UPLOAD_CHUNK: u8 = 0x11;
    pub const END_UPLOAD: u8 = 0x12;
    pub const DOWNLOAD_FILE: u8 = 0x13;
    pub const SHUTDOWN: u8 = 0xFF;
}

// Response opcodes
pub mod resp {
    pub const OK: u8 = 0x01;
    pub const ERROR: u8 = 0x02;
    pub const DATA: u8 = 0x03;
    pub const READY: u8 = 0x04;
    pub const PROGRESS: u8 = 0x05;
}

// Centralized deadlines so the engine and tests agree on timing behavior
pub mod timeouts {
    /// Connect-attempt deadline, distinct from OS defaults.
    pub const CONNECT_MS: u64 = 5_000;

    /// Per-frame read deadline. Generous: the device may stall while flushing
    /// large writes to slow storage.
    pub const READ_MS: u64 = 120_000;

    /// Per-chunk write deadline, to detect an unresponsive peer quickly.
    pub const WRITE_MS: u64 = 30_000;

    /// Grace wait after a single zero-byte read before declaring the
    /// connection closed.
    pub const ZERO_READ_GRACE_MS: u64 = 100;

    /// Idle period after a DeleteDir terminal frame before the connection may
    /// be reused (the device finishes cleanup asynchronously).
    pub const DELETE_DIR_SETTLE_MS: u64 = 500;

    /// Pause after the chunk-0 gate opens, letting file pre-allocation finish.
    pub const CHUNK_GATE_SETTLE_MS: u64 = 100;

    /// Minimum interval between progress reports.
    pub const PROGRESS_TICK_MS: u64 = 200;

    /// Cool-down after a failed connect before further dispatch attempts.
    pub const CONNECT_RETRY_PAUSE_MS: u64 = 2_000;

    /// Backoff before a failed job is eligible for dispatch again.
    pub const JOB_RETRY_BACKOFF_MS: u64 = 3_000;
}

/// One storage root reported by ListStorage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageInfo {
    pub path: String,
    pub total_bytes: i64,
    pub free_bytes: i64,
}

/// One directory entry reported by ListDir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: i64,
    pub timestamp: DateTime<Utc>,
}

// Unix-second bounds of year 1..=9999; the device emits garbage timestamps
// for some filesystems
const MIN_UNIX_TS: i64 = -62_135_596_800;
const MAX_UNIX_TS: i64 = 253_402_300_799;

/// Map a device timestamp to UTC, substituting the current time for values
/// outside the sane calendar range.
pub fn clamp_timestamp(unix_secs: i64) -> DateTime<Utc> {
    if !(MIN_UNIX_TS..=MAX_UNIX_TS).contains(&unix_secs) {
        return Utc::now();
    }
    match Utc.timestamp_opt(unix_secs, 0) {
        chrono::LocalResult::Single(dt) => dt,
        _ => Utc::now(),
    }
}

/// UTF-8 path + NUL, the layout the device's strlen-based parser expects.
pub fn encode_path(path: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(path.len() + 1);
    out.extend_from_slice(path.as_bytes());
    out.push(0);
    out
}

/// src + NUL + dst + NUL, shared by Rename/CopyFile/MoveFile.
pub fn encode_path_pair(src: &str, dst: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() + dst.len() + 2);
    out.extend_from_slice(src.as_bytes());
    out.push(0);
    out.extend_from_slice(dst.as_bytes());
    out.push(0);
    out
}

/// StartUpload payload: path + NUL + i64 full file size + i64 chunk offset.
///
/// The size field always carries the file's full logical size, even when this
/// connection only transfers a sub-range - the device pre-allocates from it.
pub fn encode_start_upload(remote: &str, full_size: i64, offset: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(remote.len() + 1 + 16);
    out.extend_from_slice(remote.as_bytes());
    out.push(0);
    out.extend_from_slice(&full_size.to_le_bytes());
    out.extend_from_slice(&offset.to_le_bytes());
    out
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(FerryError::Protocol(format!(
                "truncated payload: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.buf.len()
            )));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(i64::from_le_bytes(a))
    }

    fn str(&mut self, n: usize) -> Result<String> {
        let b = self.take(n)?;
        String::from_utf8(b.to_vec())
            .map_err(|_| FerryError::Protocol("non-UTF-8 name in listing".into()))
    }
}

/// Decode a ListDir Data payload.
///
/// Layout: i32 count, then per entry
/// `[u8 type 0=file 1=dir][u16 name_len][name][i64 size][i64 unix_ts]`.
pub fn decode_dir_listing(payload: &[u8]) -> Result<Vec<FileEntry>> {
    let mut cur = Cursor::new(payload);
    let count = cur.i32()?;
    if count <= 0 {
        return Ok(Vec::new());
    }
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let kind = cur.u8()?;
        let name_len = cur.u16()? as usize;
        let name = cur.str(name_len)?;
        let size = cur.i64()?;
        let ts = cur.i64()?;
        entries.push(FileEntry {
            name,
            is_dir: kind == 1,
            size,
            timestamp: clamp_timestamp(ts),
        });
    }
    Ok(entries)
}

/// Decode a ListStorage Data payload.
///
/// Layout: i32 count, then per entry `[u16 path_len][path][i64 total][i64 free]`.
pub fn decode_storage_listing(payload: &[u8]) -> Result<Vec<StorageInfo>> {
    let mut cur = Cursor::new(payload);
    let count = cur.i32()?;
    if count <= 0 {
        return Ok(Vec::new());
    }
    let mut infos = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let path_len = cur.u16()? as usize;
        let path = cur.str(path_len)?;
        let total_bytes = cur.i64()?;
        let free_bytes = cur.i64()?;
        infos.push(StorageInfo {
            path,
            total_bytes,
            free_bytes,
        });
    }
    Ok(infos)
}

/// Decode the UTF-8 text of a Progress frame, trimming the trailing NUL the
/// device appends.
pub fn decode_progress_text(payload: &[u8]) -> String {
    let end = payload
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).into_owned()
}
