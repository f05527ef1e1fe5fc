//! Duplicate resolver: pre-flight conflict check against the destination
//!
//! Runs once per batch, before any job reaches the orchestrator. Jobs are
//! grouped by destination directory and each directory is listed exactly
//! once. A name collision asks an external decision provider what to do;
//! Replace deletes the remote file and keeps the job, Skip drops the job,
//! and the *All variants silence further prompts for the rest of the batch.
//!
//! The decision is a human answering a dialog somewhere else. It arrives
//! over a channel, making the wait an explicit suspension point instead of
//! UI code buried in the engine.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};

use crate::batch::{remote_parent, TransferJob};
use crate::connection::Connection;
use crate::error::Result;
use crate::logger::Logger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictChoice {
    Replace,
    Skip,
    ReplaceAll,
    SkipAll,
}

/// One collision, sent to the decision provider. Answer via `reply`;
/// dropping it unanswered counts as Skip.
#[derive(Debug)]
pub struct ConflictPrompt {
    pub file_name: String,
    pub remote_path: String,
    pub local_size: u64,
    pub remote_size: i64,
    pub reply: oneshot::Sender<ConflictChoice>,
}

pub type DecisionTx = mpsc::Sender<ConflictPrompt>;

/// A decision provider that answers every prompt with the same choice.
/// Useful for `--on-conflict replace|skip` and for tests.
pub fn fixed_decision(choice: ConflictChoice) -> DecisionTx {
    let (tx, mut rx) = mpsc::channel::<ConflictPrompt>(16);
    tokio::spawn(async move {
        while let Some(prompt) = rx.recv().await {
            let _ = prompt.reply.send(choice);
        }
    });
    tx
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SessionPolicy {
    Ask,
    ReplaceAll,
    SkipAll,
}

/// Filter a job list against the destination's existing entries.
///
/// Returns the jobs that should proceed. Directories that fail to list are
/// treated as absent (every file in them is new). Remote deletes issued for
/// Replace are best-effort, matching the device's own tolerance for deleting
/// a file that is already gone.
pub async fn resolve(
    conn: &mut Connection,
    jobs: Vec<TransferJob>,
    decisions: &DecisionTx,
    logger: &dyn Logger,
) -> Result<Vec<TransferJob>> {
    // Group by destination directory, preserving first-seen order
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<TransferJob>> = HashMap::new();
    for job in jobs {
        let dir = remote_parent(&job.remote_path).to_string();
        if !groups.contains_key(&dir) {
            order.push(dir.clone());
        }
        groups.entry(dir).or_default().push(job);
    }

    let mut policy = SessionPolicy::Ask;
    let mut kept = Vec::new();

    for dir in order {
        let group = groups.remove(&dir).unwrap_or_default();

        let existing: HashMap<String, i64> = match conn.list_dir(&dir).await {
            Ok(entries) => entries
                .into_iter()
                .filter(|e| !e.is_dir)
                .map(|e| (e.name, e.size))
                .collect(),
            Err(e) => {
                logger.note(&format!("list {} failed ({}), treating all as new", dir, e));
                kept.extend(group);
                continue;
            }
        };

        for job in group {
            let name = job.file_name().to_string();
            let Some(&remote_size) = existing.get(&name) else {
                kept.push(job);
                continue;
            };

            let choice = match policy {
                SessionPolicy::ReplaceAll => ConflictChoice::Replace,
                SessionPolicy::SkipAll => ConflictChoice::Skip,
                SessionPolicy::Ask => {
                    let (reply_tx, reply_rx) = oneshot::channel();
                    let prompt = ConflictPrompt {
                        file_name: name.clone(),
                        remote_path: job.remote_path.clone(),
                        local_size: job.size,
                        remote_size,
                        reply: reply_tx,
                    };
                    if decisions.send(prompt).await.is_err() {
                        // Provider gone: safest default is to not overwrite
                        ConflictChoice::Skip
                    } else {
                        reply_rx.await.unwrap_or(ConflictChoice::Skip)
                    }
                }
            };

            match choice {
                ConflictChoice::ReplaceAll => {
                    policy = SessionPolicy::ReplaceAll;
                }
                ConflictChoice::SkipAll => {
                    policy = SessionPolicy::SkipAll;
                }
                _ => {}
            }

            match choice {
                ConflictChoice::Replace | ConflictChoice::ReplaceAll => {
                    if let Err(e) = conn.delete_file(&job.remote_path).await {
                        logger.note(&format!("delete {} failed: {}", job.remote_path, e));
                    } else {
                        logger.delete(&job.remote_path);
                    }
                    kept.push(job);
                }
                ConflictChoice::Skip | ConflictChoice::SkipAll => {
                    logger.note(&format!("skipping existing file: {}", name));
                }
            }
        }
    }

    Ok(kept)
}
