//! Error taxonomy for the ferry transfer engine
//!
//! Connection-level failures (connect refused/timeout) are distinguished from
//! job-level failures because the orchestrator treats them differently: a
//! failed connect requeues the job after a cool-down, a failed transfer burns
//! one of the job's retries.

use std::io;

pub type Result<T> = std::result::Result<T, FerryError>;

#[derive(Debug, thiserror::Error)]
pub enum FerryError {
    /// TCP connect refused or failed outright.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Connect attempt exceeded its deadline.
    #[error("connect to {addr} timed out after {ms} ms")]
    ConnectTimeout { addr: String, ms: u64 },

    /// Malformed or unexpected frame (bad opcode, bad length, bad payload).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Short read/write, socket closed unexpectedly, local filesystem error.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Read or write deadline exceeded mid-operation.
    #[error("{op} timed out after {ms} ms")]
    Timeout { op: &'static str, ms: u64 },

    /// The device returned an Error response (path not found, permission
    /// denied, disk full, ...). Payload text included when the device sent one.
    #[error("device error: {0}")]
    Device(String),

    /// Cooperative cancellation observed.
    #[error("operation cancelled")]
    Cancelled,
}

impl FerryError {
    /// True for failures of connection establishment, which the orchestrator
    /// requeues without consuming a retry.
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            FerryError::Connect { .. } | FerryError::ConnectTimeout { .. }
        )
    }
}
