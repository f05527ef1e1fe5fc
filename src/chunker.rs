//! Chunk splitter: one large file, several connections
//!
//! Files above the chunk threshold are divided into fixed-size byte ranges,
//! each streamed by the transfer engine on its own freshly opened connection.
//! Chunk concurrency has its own small semaphore, independent of the
//! orchestrator's pool, so one huge file cannot monopolize the dispatcher.
//!
//! Ordering invariant: chunk 0 is the only chunk that makes the device
//! create and pre-allocate the remote file. Every later chunk waits on a
//! one-shot gate - opened once chunk 0 has connected and completed its
//! StartUpload handshake - plus a short settle delay, before issuing its own
//! StartUpload. Without the gate, non-zero chunks target a file that does
//! not exist yet.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::connection::DeviceAddr;
use crate::error::{FerryError, Result};
use crate::progress::{ProgressMeter, ProgressSample};
use crate::protocol::timeouts::CHUNK_GATE_SETTLE_MS;
use crate::transfer::{Upload, UploadSpec};

/// Connections used simultaneously for one chunked file.
pub const MAX_PARALLEL_CHUNKS: usize = 4;

/// One contiguous byte sub-range of a chunked upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub index: usize,
    pub offset: u64,
    pub len: u64,
}

/// Partition `[0, total)` into `ceil(total / chunk_size)` ranges: fixed-size
/// chunks, last chunk the remainder. No gap, no overlap.
pub fn split_ranges(total: u64, chunk_size: u64) -> Vec<ChunkRange> {
    assert!(chunk_size > 0, "chunk_size must be non-zero");
    let mut ranges = Vec::new();
    let mut offset = 0u64;
    let mut index = 0usize;
    while offset < total {
        let len = chunk_size.min(total - offset);
        ranges.push(ChunkRange { index, offset, len });
        offset += len;
        index += 1;
    }
    ranges
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Waiting,
    Open,
    Failed,
}

/// Upload one large file as parallel chunks. Succeeds only if every chunk
/// succeeds; on failure the caller is responsible for deleting the
/// half-written remote file before any retry, because a retry restarts from
/// chunk 0.
pub async fn upload_chunked(
    addr: &DeviceAddr,
    local: &Path,
    remote: &str,
    chunk_size: u64,
    cancel: &CancellationToken,
    progress: Arc<dyn Fn(ProgressSample) + Send + Sync>,
) -> Result<u64> {
    let full_size = tokio::fs::metadata(local).await?.len();
    let ranges = split_ranges(full_size, chunk_size);

    let (gate_tx, gate_rx) = watch::channel(Gate::Waiting);
    let mut gate_tx = Some(gate_tx);
    let semaphore = Arc::new(Semaphore::new(MAX_PARALLEL_CHUNKS));
    // Latest bytes-sent per chunk. The parent total is recomputed as the sum
    // of these on every event - never accumulated as deltas - so interleaved
    // out-of-order callbacks across chunk connections cannot drift it.
    let chunk_latest: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(vec![0u64; ranges.len()]));
    let parent_meter = Arc::new(Mutex::new(ProgressMeter::new(full_size)));

    let mut tasks: JoinSet<(usize, Result<u64>)> = JoinSet::new();
    for range in &ranges {
        let range = *range;
        let addr = addr.clone();
        let local = local.to_path_buf();
        let remote = remote.to_string();
        let cancel = cancel.clone();
        let mut gate_rx = gate_rx.clone();
        let gate_tx = if range.index == 0 { gate_tx.take() } else { None };
        let semaphore = Arc::clone(&semaphore);
        let chunk_latest = Arc::clone(&chunk_latest);
        let parent_meter = Arc::clone(&parent_meter);
        let progress = Arc::clone(&progress);

        tasks.spawn(async move {
            let result = run_chunk(
                range,
                &addr,
                &local,
                &remote,
                &cancel,
                &mut gate_rx,
                gate_tx,
                &semaphore,
                &chunk_latest,
                &parent_meter,
                progress.as_ref(),
            )
            .await;
            (range.index, result)
        });
    }

    // All chunks must finish; report the lowest-index failure so chunk 0's
    // root cause wins over the gate aborts it caused.
    let mut first_failure: Option<(usize, FerryError)> = None;
    while let Some(joined) = tasks.join_next().await {
        let (index, result) = joined.map_err(|e| {
            FerryError::Io(std::io::Error::other(format!("chunk task panicked: {e}")))
        })?;
        if let Err(e) = result {
            if first_failure.as_ref().map_or(true, |(i, _)| index < *i) {
                first_failure = Some((index, e));
            }
        }
    }
    if let Some((_, e)) = first_failure {
        return Err(e);
    }

    let final_sample = parent_meter.lock().force(full_size);
    progress(final_sample);
    Ok(full_size)
}

#[allow(clippy::too_many_arguments)]
async fn run_chunk(
    range: ChunkRange,
    addr: &DeviceAddr,
    local: &Path,
    remote: &str,
    cancel: &CancellationToken,
    gate_rx: &mut watch::Receiver<Gate>,
    gate_tx: Option<watch::Sender<Gate>>,
    semaphore: &Semaphore,
    chunk_latest: &Mutex<Vec<u64>>,
    parent_meter: &Mutex<ProgressMeter>,
    progress: &(dyn Fn(ProgressSample) + Send + Sync),
) -> Result<u64> {
    // Opens the gate on success, fails every waiter on early return.
    struct GateGuard(Option<watch::Sender<Gate>>);
    impl GateGuard {
        fn open(&mut self) {
            if let Some(tx) = self.0.take() {
                let _ = tx.send(Gate::Open);
            }
        }
    }
    impl Drop for GateGuard {
        fn drop(&mut self) {
            if let Some(tx) = self.0.take() {
                let _ = tx.send(Gate::Failed);
            }
        }
    }
    let mut gate = GateGuard(gate_tx);

    if range.index > 0 {
        loop {
            match *gate_rx.borrow_and_update() {
                Gate::Open => break,
                Gate::Failed => return Err(FerryError::Cancelled),
                Gate::Waiting => {}
            }
            if gate_rx.changed().await.is_err() {
                // Sender dropped without opening: chunk 0 is gone
                return Err(FerryError::Cancelled);
            }
        }
        // Let the device finish pre-allocating the file
        sleep(Duration::from_millis(CHUNK_GATE_SETTLE_MS)).await;
    }

    let _permit = semaphore
        .acquire()
        .await
        .map_err(|_| FerryError::Cancelled)?;
    if cancel.is_cancelled() {
        return Err(FerryError::Cancelled);
    }

    let mut conn = addr.connect().await?;
    let spec = UploadSpec {
        local: local.to_path_buf(),
        remote: remote.to_string(),
        offset: range.offset,
        len: range.len,
    };
    let upload = Upload::begin(&mut conn, &spec).await?;
    // StartUpload is on the wire and acknowledged: later chunks may proceed
    gate.open();

    upload
        .run(cancel, |s| {
            let total_sent: u64 = {
                let mut latest = chunk_latest.lock();
                latest[range.index] = s.bytes_sent;
                latest.iter().sum()
            };
            if let Some(parent) = parent_meter.lock().sample(total_sent) {
                progress(parent);
            }
        })
        .await
}
