//! One TCP session to the device, exposing the typed remote operations
//!
//! A `Connection` is owned by exactly one task at a time. Requests and
//! responses alternate strictly - no pipelining - so every operation here
//! takes `&mut self` and runs to its terminal response before returning.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::{sleep, timeout};

use crate::error::{FerryError, Result};
use crate::frame;
use crate::protocol::timeouts::{CONNECT_MS, DELETE_DIR_SETTLE_MS};
use crate::protocol::{self, cmd, resp, FileEntry, StorageInfo};

// Socket buffers sized for sustained multi-gigabit throughput; the kernel
// clamps to its own maximums
const SOCKET_BUF_BYTES: u32 = 64 * 1024 * 1024;

/// Where the device daemon listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAddr {
    pub host: String,
    pub port: u16,
}

impl DeviceAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        DeviceAddr {
            host: host.into(),
            port,
        }
    }

    /// Open, tune, and deadline-guard a fresh connection.
    pub async fn connect(&self) -> Result<Connection> {
        let target = format!("{}:{}", self.host, self.port);
        let addr: SocketAddr = lookup_host(&target)
            .await
            .map_err(|e| FerryError::Connect {
                addr: target.clone(),
                source: e,
            })?
            .next()
            .ok_or_else(|| FerryError::Connect {
                addr: target.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved"),
            })?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| FerryError::Connect {
            addr: target.clone(),
            source: e,
        })?;
        let _ = socket.set_send_buffer_size(SOCKET_BUF_BYTES);
        let _ = socket.set_recv_buffer_size(SOCKET_BUF_BYTES);

        // Fail fast on a wrong IP instead of waiting out the OS default
        let stream = match timeout(Duration::from_millis(CONNECT_MS), socket.connect(addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                return Err(FerryError::Connect {
                    addr: target,
                    source: e,
                })
            }
            Err(_) => {
                return Err(FerryError::ConnectTimeout {
                    addr: target,
                    ms: CONNECT_MS,
                })
            }
        };

        let _ = stream.set_nodelay(true);
        // Abortive close: on drop, reset instead of lingering in TIME_WAIT
        // with megabytes of unacked upload data
        let _ = stream.set_linger(Some(Duration::ZERO));
        tune_keepalive(&stream);

        Ok(Connection {
            stream,
            peer: target,
        })
    }
}

impl std::fmt::Display for DeviceAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(unix)]
fn tune_keepalive(stream: &TcpStream) {
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    unsafe {
        let keepalive: libc::c_int = 1;
        let _ = libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &keepalive as *const _ as *const libc::c_void,
            std::mem::size_of_val(&keepalive) as libc::socklen_t,
        );

        #[cfg(target_os = "linux")]
        {
            let keepidle: libc::c_int = 60; // Start probes after 60s idle
            let keepintvl: libc::c_int = 10; // 10s between probes
            let keepcnt: libc::c_int = 6; // 6 probes before failure
            let _ = libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_KEEPIDLE,
                &keepidle as *const _ as *const libc::c_void,
                std::mem::size_of_val(&keepidle) as libc::socklen_t,
            );
            let _ = libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_KEEPINTVL,
                &keepintvl as *const _ as *const libc::c_void,
                std::mem::size_of_val(&keepintvl) as libc::socklen_t,
            );
            let _ = libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_KEEPCNT,
                &keepcnt as *const _ as *const libc::c_void,
                std::mem::size_of_val(&keepcnt) as libc::socklen_t,
            );
        }
    }
}

#[cfg(not(unix))]
fn tune_keepalive(_stream: &TcpStream) {}

pub struct Connection {
    stream: TcpStream,
    peer: String,
}

impl Connection {
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// One request/response exchange.
    pub async fn request(&mut self, opcode: u8, payload: &[u8]) -> Result<(u8, Vec<u8>)> {
        frame::send_frame(&mut self.stream, opcode, payload).await?;
        frame::recv_frame(&mut self.stream).await
    }

    fn expect_ok(response: (u8, Vec<u8>)) -> Result<()> {
        match response.0 {
            resp::OK => Ok(()),
            resp::ERROR => Err(FerryError::Device(error_text(&response.1))),
            other => Err(FerryError::Protocol(format!(
                "unexpected response opcode {:#04x}",
                other
            ))),
        }
    }

    pub async fn ping(&mut self) -> Result<()> {
        Self::expect_ok(self.request(cmd::PING, &[]).await?)
    }

    pub async fn list_storage(&mut self) -> Result<Vec<StorageInfo>> {
        let (op, payload) = self.request(cmd::LIST_STORAGE, &[]).await?;
        match op {
            resp::DATA => protocol::decode_storage_listing(&payload),
            resp::ERROR => Err(FerryError::Device(error_text(&payload))),
            other => Err(FerryError::Protocol(format!(
                "unexpected ListStorage response {:#04x}",
                other
            ))),
        }
    }

    pub async fn list_dir(&mut self, path: &str) -> Result<Vec<FileEntry>> {
        let (op, payload) = self
            .request(cmd::LIST_DIR, &protocol::encode_path(path))
            .await?;
        match op {
            resp::DATA => protocol::decode_dir_listing(&payload),
            resp::ERROR => Err(FerryError::Device(error_text(&payload))),
            other => Err(FerryError::Protocol(format!(
                "unexpected ListDir response {:#04x}",
                other
            ))),
        }
    }

    pub async fn create_dir(&mut self, path: &str) -> Result<()> {
        let r = self
            .request(cmd::CREATE_DIR, &protocol::encode_path(path))
            .await?;
        Self::expect_ok(r)
    }

    pub async fn delete_file(&mut self, path: &str) -> Result<()> {
        let r = self
            .request(cmd::DELETE_FILE, &protocol::encode_path(path))
            .await?;
        Self::expect_ok(r)
    }

    /// Recursive remote delete with its multi-frame response protocol.
    ///
    /// The device accepts with an initial Ok, then emits zero or more
    /// Progress frames (UTF-8 status text, forwarded to `on_progress`) while
    /// a background thread deletes, and finally one terminal Ok or Error.
    /// After the terminal frame the connection sits out a short settle
    /// interval before reuse, so we don't race the device's own cleanup.
    pub async fn delete_dir(
        &mut self,
        path: &str,
        mut on_progress: impl FnMut(&str),
    ) -> Result<()> {
        let accept = self
            .request(cmd::DELETE_DIR, &protocol::encode_path(path))
            .await?;
        match accept.0 {
            resp::OK => {}
            resp::ERROR => return Err(FerryError::Device(error_text(&accept.1))),
            other => {
                return Err(FerryError::Protocol(format!(
                    "unexpected DeleteDir acceptance {:#04x}",
                    other
                )))
            }
        }

        let outcome = loop {
            let (op, payload) = frame::recv_frame(&mut self.stream).await?;
            match op {
                resp::PROGRESS => on_progress(&protocol::decode_progress_text(&payload)),
                resp::OK => break Ok(()),
                resp::ERROR => break Err(FerryError::Device(error_text(&payload))),
                other => {
                    break Err(FerryError::Protocol(format!(
                        "unexpected DeleteDir frame {:#04x}",
                        other
                    )))
                }
            }
        };

        sleep(Duration::from_millis(DELETE_DIR_SETTLE_MS)).await;
        outcome
    }

    pub async fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        let r = self
            .request(cmd::RENAME, &protocol::encode_path_pair(old, new))
            .await?;
        Self::expect_ok(r)
    }

    pub async fn copy_file(&mut self, src: &str, dst: &str) -> Result<()> {
        let r = self
            .request(cmd::COPY_FILE, &protocol::encode_path_pair(src, dst))
            .await?;
        Self::expect_ok(r)
    }

    pub async fn move_file(&mut self, src: &str, dst: &str) -> Result<()> {
        let r = self
            .request(cmd::MOVE_FILE, &protocol::encode_path_pair(src, dst))
            .await?;
        Self::expect_ok(r)
    }

    /// Ask the device daemon to exit. Fire-and-forget: the daemon drops the
    /// socket without answering.
    pub async fn shutdown(&mut self) -> Result<()> {
        frame::send_frame(&mut self.stream, cmd::SHUTDOWN, &[]).await
    }
}

fn error_text(payload: &[u8]) -> String {
    if payload.is_empty() {
        "unspecified".to_string()
    } else {
        protocol::decode_progress_text(payload)
    }
}
