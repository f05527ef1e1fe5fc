//! Ferry - high-throughput file transfer client for framed-TCP storage devices
//!
//! The engine moves multi-gigabyte batches over a bespoke binary protocol:
//! one connection per job, chunked parallel connections for large files, a
//! bounded scheduler with retries, and duplicate resolution before dispatch.

pub mod batch;
pub mod chunker;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod logger;
pub mod orchestrator;
pub mod progress;
pub mod protocol;
pub mod resolver;
pub mod transfer;
pub mod url;

pub use error::{FerryError, Result};
