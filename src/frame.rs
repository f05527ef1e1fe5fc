//! Wire codec: length-prefixed frames over a tokio TcpStream
//!
//! The caller owns the connection exclusively for the duration of a logical
//! operation - frames from two operations are never interleaved on one
//! socket, so there is no demultiplexing here, only framing and deadlines.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Duration};

use crate::error::{FerryError, Result};
use crate::protocol::timeouts::{READ_MS, WRITE_MS, ZERO_READ_GRACE_MS};
use crate::protocol::{HEADER_LEN, MAX_FRAME_SIZE};

/// Build the 5-byte frame header: opcode + u32 LE payload length.
pub fn build_header(opcode: u8, payload_len: u32) -> [u8; HEADER_LEN] {
    let mut hdr = [0u8; HEADER_LEN];
    hdr[0] = opcode;
    hdr[1..5].copy_from_slice(&payload_len.to_le_bytes());
    hdr
}

/// Parse a 5-byte frame header into (opcode, payload length).
pub fn parse_header(hdr: &[u8; HEADER_LEN]) -> (u8, u32) {
    let len = u32::from_le_bytes([hdr[1], hdr[2], hdr[3], hdr[4]]);
    (hdr[0], len)
}

/// Read exactly `buf.len()` bytes or fail - never a short read.
///
/// A single transient zero-byte read gets one grace wait and retry before
/// being treated as connection-closed; the device occasionally stalls its
/// send path for a beat under storage load.
pub async fn read_exact(stream: &mut TcpStream, buf: &mut [u8], deadline_ms: u64) -> Result<()> {
    let mut filled = 0usize;
    let mut graced = false;
    while filled < buf.len() {
        let n = match timeout(
            Duration::from_millis(deadline_ms),
            stream.read(&mut buf[filled..]),
        )
        .await
        {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(FerryError::Timeout {
                    op: "read",
                    ms: deadline_ms,
                })
            }
        };
        if n == 0 {
            if graced {
                return Err(FerryError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed mid-read",
                )));
            }
            graced = true;
            sleep(Duration::from_millis(ZERO_READ_GRACE_MS)).await;
            continue;
        }
        filled += n;
    }
    Ok(())
}

/// Write header + payload as one logical write under the given deadline.
pub async fn send_frame_timed(
    stream: &mut TcpStream,
    opcode: u8,
    payload: &[u8],
    deadline_ms: u64,
) -> Result<()> {
    let hdr = build_header(opcode, payload.len() as u32);
    let res = timeout(Duration::from_millis(deadline_ms), async {
        stream.write_all(&hdr).await?;
        if !payload.is_empty() {
            stream.write_all(payload).await?;
        }
        Ok::<(), std::io::Error>(())
    })
    .await;
    match res {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(FerryError::Timeout {
            op: "write",
            ms: deadline_ms,
        }),
    }
}

pub async fn send_frame(stream: &mut TcpStream, opcode: u8, payload: &[u8]) -> Result<()> {
    send_frame_timed(stream, opcode, payload, WRITE_MS).await
}

/// Receive one full frame: blocks until the header and the declared payload
/// have both arrived, or fails with a taxonomy error.
pub async fn recv_frame(stream: &mut TcpStream) -> Result<(u8, Vec<u8>)> {
    recv_frame_timed(stream, READ_MS).await
}

pub async fn recv_frame_timed(stream: &mut TcpStream, deadline_ms: u64) -> Result<(u8, Vec<u8>)> {
    let mut hdr = [0u8; HEADER_LEN];
    read_exact(stream, &mut hdr, deadline_ms).await?;
    let (opcode, len) = parse_header(&hdr);
    let len = len as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FerryError::Protocol(format!(
            "frame payload too large: {} bytes (max {})",
            len, MAX_FRAME_SIZE
        )));
    }
    let mut payload = vec![0u8; len];
    if len > 0 {
        read_exact(stream, &mut payload, deadline_ms).await?;
    }
    Ok((opcode, payload))
}
