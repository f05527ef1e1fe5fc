//! Operational event logging
//!
//! The engine logs through a trait object so hot paths pay nothing when
//! logging is off. `JsonLogger` appends one JSON object per line, timestamped
//! in UTC, suitable for tailing during a long batch.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;

pub trait Logger: Send + Sync {
    fn job_started(&self, _local: &Path, _remote: &str) {}
    fn job_done(&self, _local: &Path, _remote: &str, _bytes: u64) {}
    fn job_failed(&self, _local: &Path, _remote: &str, _error: &str) {}
    fn retry(&self, _remote: &str, _attempt: u32) {}
    fn delete(&self, _remote: &str) {}
    fn note(&self, _msg: &str) {}
    fn batch_done(&self, _files: u64, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

#[derive(Serialize)]
struct Record<'a> {
    ts: String,
    event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    local: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    remote: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    files: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    msg: Option<&'a str>,
}

impl<'a> Record<'a> {
    fn new(event: &'static str) -> Self {
        Record {
            ts: Utc::now().to_rfc3339(),
            event,
            local: None,
            remote: None,
            bytes: None,
            files: None,
            seconds: None,
            attempt: None,
            msg: None,
        }
    }
}

pub struct JsonLogger {
    file: Mutex<File>,
}

impl JsonLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(JsonLogger {
            file: Mutex::new(f),
        })
    }

    fn write(&self, record: &Record<'_>) {
        if let Ok(mut f) = self.file.lock() {
            if let Ok(line) = serde_json::to_string(record) {
                let _ = writeln!(f, "{}", line);
            }
        }
    }
}

impl Logger for JsonLogger {
    fn job_started(&self, local: &Path, remote: &str) {
        let local = local.display().to_string();
        let mut r = Record::new("start");
        r.local = Some(&local);
        r.remote = Some(remote);
        self.write(&r);
    }

    fn job_done(&self, local: &Path, remote: &str, bytes: u64) {
        let local = local.display().to_string();
        let mut r = Record::new("done");
        r.local = Some(&local);
        r.remote = Some(remote);
        r.bytes = Some(bytes);
        self.write(&r);
    }

    fn job_failed(&self, local: &Path, remote: &str, error: &str) {
        let local = local.display().to_string();
        let mut r = Record::new("failed");
        r.local = Some(&local);
        r.remote = Some(remote);
        r.msg = Some(error);
        self.write(&r);
    }

    fn retry(&self, remote: &str, attempt: u32) {
        let mut r = Record::new("retry");
        r.remote = Some(remote);
        r.attempt = Some(attempt);
        self.write(&r);
    }

    fn delete(&self, remote: &str) {
        let mut r = Record::new("delete");
        r.remote = Some(remote);
        self.write(&r);
    }

    fn note(&self, msg: &str) {
        let mut r = Record::new("note");
        r.msg = Some(msg);
        self.write(&r);
    }

    fn batch_done(&self, files: u64, bytes: u64, seconds: f64) {
        let mut r = Record::new("batch_done");
        r.files = Some(files);
        r.bytes = Some(bytes);
        r.seconds = Some(seconds);
        self.write(&r);
    }
}
