//! Engine limits and connection settings
//!
//! Everything here has a working default; a TOML file can override any
//! subset, and CLI flags override the file.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::protocol::timeouts::{CONNECT_RETRY_PAUSE_MS, JOB_RETRY_BACKOFF_MS};
use crate::protocol::{CHUNK_SIZE, CHUNK_THRESHOLD, DEFAULT_PORT};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Device host; usually supplied per-invocation.
    pub host: Option<String>,
    pub port: u16,

    /// Upper bound on concurrently active jobs. 0 = derive from CPU count.
    pub max_parallel: usize,

    /// Independent bound on concurrently active large (chunk-eligible) jobs,
    /// so big transfers cannot starve the pool sized for small-file
    /// throughput.
    pub max_parallel_large: usize,

    /// Retries per job before it is permanently failed.
    pub max_retries: u32,

    /// Files above this size are chunked across connections.
    pub chunk_threshold: u64,

    /// Chunk size for split uploads.
    pub chunk_size: u64,

    /// Backoff before a failed job is dispatched again.
    pub retry_backoff_ms: u64,

    /// Cool-down after a failed connect before further dispatch attempts.
    pub connect_retry_pause_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: None,
            port: DEFAULT_PORT,
            max_parallel: 16,
            max_parallel_large: 8,
            max_retries: 3,
            chunk_threshold: CHUNK_THRESHOLD,
            chunk_size: CHUNK_SIZE,
            retry_backoff_ms: JOB_RETRY_BACKOFF_MS,
            connect_retry_pause_ms: CONNECT_RETRY_PAUSE_MS,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg: Config =
            toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn effective_max_parallel(&self) -> usize {
        if self.max_parallel == 0 {
            (num_cpus::get() * 2).clamp(4, 16)
        } else {
            self.max_parallel
        }
    }

    pub fn effective_max_parallel_large(&self) -> usize {
        self.max_parallel_large.max(1)
    }
}
