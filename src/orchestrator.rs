//! Bounded-concurrency scheduler: dispatch, wait, retry, aggregate
//!
//! The loop owns a FIFO queue and a set of active transfer tasks. Each task
//! holds its own connection for its whole life - connections are never
//! pooled, reused mid-transfer, or shared - and task identity maps to its
//! job through the JoinSet's task id, so completion in any order cleans up
//! the right job. Two bounds govern dispatch: the overall pool size, and an
//! independent cap on active large (chunk-eligible) jobs so big transfers
//! cannot starve the pool sized for small-file throughput.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::batch::{JobState, TransferJob};
use crate::chunker;
use crate::config::Config;
use crate::connection::DeviceAddr;
use crate::error::{FerryError, Result};
use crate::logger::Logger;
use crate::progress::ProgressSample;
use crate::transfer::{self, UploadSpec};

/// Fire-and-forget notifications to whatever is watching the batch.
#[derive(Debug, Clone)]
pub enum Event {
    JobStarted {
        id: Uuid,
        remote: String,
    },
    JobSucceeded {
        id: Uuid,
        remote: String,
        bytes: u64,
    },
    JobRetrying {
        id: Uuid,
        remote: String,
        attempt: u32,
        error: String,
    },
    JobFailed {
        id: Uuid,
        remote: String,
        error: String,
    },
    ConnectFailed {
        error: String,
    },
    Batch(BatchSnapshot),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BatchSnapshot {
    pub bytes_sent: u64,
    pub total_bytes: u64,
    pub files_done: u64,
    pub files_total: u64,
    pub active: usize,
    pub speed_bps: f64,
    pub eta: Duration,
    pub elapsed: Duration,
}

pub type EventTx = mpsc::UnboundedSender<Event>;

/// What the batch looked like when the loop exited.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<String>,
    /// Remote paths that exhausted their retries. Each appears exactly once.
    pub failed: Vec<String>,
    /// Remote paths never started (cancellation) or aborted mid-flight.
    pub cancelled: Vec<String>,
    pub bytes_sent: u64,
    pub files_total: usize,
    pub elapsed: Duration,
}

impl BatchReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty() && self.cancelled.is_empty()
    }
}

// Aggregate counters behind one coarse lock; critical sections are counter
// arithmetic only
#[derive(Default)]
struct Aggregates {
    completed_bytes: u64,
    completed_files: u64,
    /// Latest bytes-sent per in-flight job.
    inflight: HashMap<Uuid, u64>,
}

impl Aggregates {
    fn bytes_sent(&self) -> u64 {
        self.completed_bytes + self.inflight.values().sum::<u64>()
    }

    fn snapshot(&self, started: Instant, total_bytes: u64, files_total: u64) -> BatchSnapshot {
        let bytes_sent = self.bytes_sent();
        let elapsed = started.elapsed();
        let speed_bps = if elapsed.as_secs_f64() > 0.0 {
            bytes_sent as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let remaining = total_bytes.saturating_sub(bytes_sent);
        let eta = if speed_bps > 0.0 {
            Duration::from_secs_f64(remaining as f64 / speed_bps)
        } else {
            Duration::ZERO
        };
        BatchSnapshot {
            bytes_sent,
            total_bytes,
            files_done: self.completed_files,
            files_total,
            active: self.inflight.len(),
            speed_bps,
            eta,
            elapsed,
        }
    }
}

pub struct Orchestrator {
    addr: DeviceAddr,
    cfg: Config,
    cancel: CancellationToken,
    events: EventTx,
    logger: Arc<dyn Logger>,
}

impl Orchestrator {
    pub fn new(
        addr: DeviceAddr,
        cfg: Config,
        cancel: CancellationToken,
        events: EventTx,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Orchestrator {
            addr,
            cfg,
            cancel,
            events,
            logger,
        }
    }

    /// Drive the batch to completion, retry exhaustion, or cancellation.
    pub async fn run(&self, jobs: Vec<TransferJob>) -> BatchReport {
        let files_total = jobs.len() as u64;
        let total_bytes: u64 = jobs.iter().map(|j| j.size).sum();
        let started = Instant::now();
        let agg = Arc::new(Mutex::new(Aggregates::default()));

        let mut queue: VecDeque<TransferJob> = jobs.into_iter().collect();
        let mut active: JoinSet<Result<u64>> = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, TransferJob> = HashMap::new();
        let mut active_large = 0usize;
        let mut report = BatchReport {
            files_total: files_total as usize,
            ..Default::default()
        };

        let max_parallel = self.cfg.effective_max_parallel();
        let max_large = self.cfg.effective_max_parallel_large();

        loop {
            // Dispatch while both bounds allow
            if !self.cancel.is_cancelled() {
                while active.len() < max_parallel {
                    let Some(mut job) = queue.pop_front() else {
                        break;
                    };
                    let large = job.size > self.cfg.chunk_threshold;
                    if large && active_large >= max_large {
                        // Hold it for a later round; smaller files behind it
                        // get their turn after the next completion
                        queue.push_back(job);
                        break;
                    }
                    job.state = JobState::Dispatched;

                    let progress = self.job_progress(job.id, &agg, started, total_bytes, files_total);
                    let task_id = if large {
                        let addr = self.addr.clone();
                        let local = job.local_path.clone();
                        let remote = job.remote_path.clone();
                        let chunk_size = self.cfg.chunk_size;
                        let cancel = self.cancel.clone();
                        let progress: Arc<dyn Fn(ProgressSample) + Send + Sync> =
                            Arc::new(progress);
                        active
                            .spawn(async move {
                                chunker::upload_chunked(
                                    &addr, &local, &remote, chunk_size, &cancel, progress,
                                )
                                .await
                            })
                            .id()
                    } else {
                        // The connection is opened here and moved into the
                        // task that owns it until the job resolves
                        let conn = match self.addr.connect().await {
                            Ok(conn) => conn,
                            Err(e) => {
                                self.logger
                                    .note(&format!("connect failed, requeueing {}: {}", job.remote_path, e));
                                self.emit(Event::ConnectFailed {
                                    error: e.to_string(),
                                });
                                job.state = JobState::Queued;
                                queue.push_back(job);
                                self.pause(self.cfg.connect_retry_pause_ms).await;
                                break;
                            }
                        };
                        let spec = UploadSpec::whole_file(&job.local_path, &job.remote_path);
                        let cancel = self.cancel.clone();
                        active
                            .spawn(async move {
                                let mut conn = conn;
                                transfer::upload_file(&mut conn, &spec, &cancel, progress).await
                            })
                            .id()
                    };

                    if large {
                        active_large += 1;
                    }
                    job.state = JobState::InFlight;
                    agg.lock().inflight.insert(job.id, 0);
                    self.logger.job_started(&job.local_path, &job.remote_path);
                    self.emit(Event::JobStarted {
                        id: job.id,
                        remote: job.remote_path.clone(),
                    });
                    running.insert(task_id, job);
                }
            }

            // Wait for any active task
            if active.is_empty() {
                if queue.is_empty() || self.cancel.is_cancelled() {
                    break;
                }
                continue;
            }
            let (task_id, result) = match active
                .join_next_with_id()
                .await
                .expect("join_next on non-empty set")
            {
                Ok((id, res)) => (id, res),
                Err(join_err) => (
                    join_err.id(),
                    Err(FerryError::Io(std::io::Error::other(format!(
                        "transfer task panicked: {join_err}"
                    )))),
                ),
            };
            let mut job = running.remove(&task_id).expect("completed task is tracked");
            if job.size > self.cfg.chunk_threshold {
                active_large -= 1;
            }

            match result {
                Ok(bytes) => {
                    job.state = JobState::Succeeded;
                    {
                        let mut a = agg.lock();
                        a.inflight.remove(&job.id);
                        a.completed_bytes += job.size;
                        a.completed_files += 1;
                    }
                    self.logger.job_done(&job.local_path, &job.remote_path, bytes);
                    self.emit(Event::JobSucceeded {
                        id: job.id,
                        remote: job.remote_path.clone(),
                        bytes,
                    });
                    report.succeeded.push(job.remote_path);
                }
                Err(e) => {
                    agg.lock().inflight.remove(&job.id);
                    if matches!(e, FerryError::Cancelled) || self.cancel.is_cancelled() {
                        report.cancelled.push(job.remote_path);
                    } else {
                        job.state = JobState::Failed;
                        job.retries += 1;
                        // No resumable writes in this protocol: whatever made
                        // it to the device is deleted before the next attempt
                        self.delete_partial(&job.remote_path).await;
                        if job.retries <= self.cfg.max_retries {
                            job.state = JobState::Retrying;
                            self.logger.retry(&job.remote_path, job.retries);
                            self.emit(Event::JobRetrying {
                                id: job.id,
                                remote: job.remote_path.clone(),
                                attempt: job.retries,
                                error: e.to_string(),
                            });
                            queue.push_back(job);
                            self.pause(self.cfg.retry_backoff_ms).await;
                        } else {
                            job.state = JobState::PermanentlyFailed;
                            self.logger
                                .job_failed(&job.local_path, &job.remote_path, &e.to_string());
                            self.emit(Event::JobFailed {
                                id: job.id,
                                remote: job.remote_path.clone(),
                                error: e.to_string(),
                            });
                            report.failed.push(job.remote_path);
                        }
                    }
                }
            }
            self.emit(Event::Batch(agg.lock().snapshot(
                started,
                total_bytes,
                files_total,
            )));
        }

        // Whatever is still queued never started
        report
            .cancelled
            .extend(queue.into_iter().map(|j| j.remote_path));

        report.bytes_sent = agg.lock().bytes_sent();
        report.elapsed = started.elapsed();
        self.logger.batch_done(
            report.succeeded.len() as u64,
            report.bytes_sent,
            report.elapsed.as_secs_f64(),
        );
        report
    }

    /// Progress closure for one job: records the job's latest bytes-sent and
    /// publishes a recomputed batch snapshot. The aggregate is a sum of
    /// per-job latest values, so out-of-order callbacks cannot inflate it.
    fn job_progress(
        &self,
        job_id: Uuid,
        agg: &Arc<Mutex<Aggregates>>,
        started: Instant,
        total_bytes: u64,
        files_total: u64,
    ) -> impl Fn(ProgressSample) + Send + Sync + 'static {
        let agg = Arc::clone(agg);
        let events = self.events.clone();
        move |s: ProgressSample| {
            let snap = {
                let mut a = agg.lock();
                a.inflight.insert(job_id, s.bytes_sent);
                a.snapshot(started, total_bytes, files_total)
            };
            let _ = events.send(Event::Batch(snap));
        }
    }

    async fn delete_partial(&self, remote: &str) {
        match self.addr.connect().await {
            Ok(mut conn) => {
                if conn.delete_file(remote).await.is_ok() {
                    self.logger.delete(remote);
                }
            }
            Err(e) => self
                .logger
                .note(&format!("cleanup connect for {} failed: {}", remote, e)),
        }
    }

    /// Cancellable sleep: backoffs end early when the batch is cancelled.
    async fn pause(&self, ms: u64) {
        tokio::select! {
            _ = sleep(Duration::from_millis(ms)) => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }
}
