//! The single history writer.
//!
//! One dedicated thread owns the append side of the log and the index
//! shards. Producers enqueue records on a bounded channel; the writer
//! drains them in batches (size- or interval-bounded), appends log lines,
//! updates the index, fsyncs, and only then flips each record to Written
//! and wakes its waiters. A log failure poisons the writer: the failing
//! and all subsequent records flip to Failed and `add` starts refusing.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::HISTORY_INDEX_RETRIES;
use crate::msgid::{MsgIdRecord, MsgIdState};

use super::log::{HistoryEntry, FLAG_NONE};
use super::{HistoryError, HistoryShared};

/// Minimum commits before the collision-rate warning can fire.
const COLLISION_WARN_MIN_COMMITS: u64 = 1000;

/// Throttle between collision-rate warnings.
const COLLISION_WARN_INTERVAL: Duration = Duration::from_secs(60);

pub(super) fn run_writer(
    shared: Arc<HistoryShared>,
    rx: async_channel::Receiver<Arc<MsgIdRecord>>,
    flush_batch: usize,
    flush_interval: Duration,
) {
    tracing::debug!(flush_batch, ?flush_interval, "History writer started");
    let mut last_collision_warn = Instant::now() - COLLISION_WARN_INTERVAL;

    while let Ok(first) = rx.recv_blocking() {
        let mut batch = vec![first];
        let deadline = Instant::now() + flush_interval;

        // Fill the batch until it is full or the flush interval elapses.
        while batch.len() < flush_batch {
            match rx.try_recv() {
                Ok(record) => batch.push(record),
                Err(_) => {
                    if Instant::now() >= deadline {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }

        if let Err(e) = commit_batch(&shared, &batch) {
            tracing::error!(error = %e, "History writer failed; poisoning");
            shared.poisoned.store(true, Ordering::SeqCst);
            fail_records(&batch);
            // Drain whatever is still queued so producers see Failed
            // instead of hanging on Locked records.
            while let Ok(record) = rx.try_recv() {
                fail_records(&[record]);
            }
            while let Ok(record) = rx.recv_blocking() {
                fail_records(&[record]);
            }
            return;
        }

        maybe_warn_collisions(&shared, &mut last_collision_warn);
    }

    tracing::debug!("History writer queue closed, writer exiting");
}

/// Append and index every record in the batch, then fsync and release.
fn commit_batch(
    shared: &HistoryShared,
    batch: &[Arc<MsgIdRecord>],
) -> Result<(), HistoryError> {
    let now = chrono::Utc::now().timestamp();
    let mut committed = Vec::with_capacity(batch.len());

    for record in batch {
        let storage_token = record.lock().storage_token.clone();
        let entry = HistoryEntry {
            message_id: record.id().to_string(),
            flags: FLAG_NONE,
            storage_token,
            timestamp: now,
        };
        let offset = shared.log.append(&entry)?;

        let route = shared.index.route(record.id());
        let mut attempt = 0;
        loop {
            match shared.index.append_offset(&route, offset) {
                Ok(existed) => {
                    if existed {
                        shared.stats.collisions.fetch_add(1, Ordering::Relaxed);
                    }
                    break;
                }
                Err(e) if attempt < HISTORY_INDEX_RETRIES => {
                    attempt += 1;
                    tracing::warn!(error = %e, attempt, "Index update failed, retrying");
                    std::thread::sleep(Duration::from_millis(10 << attempt));
                }
                Err(e) => return Err(e),
            }
        }

        committed.push((record.clone(), offset));
    }

    shared.log.sync()?;

    for (record, offset) in committed {
        record.mark_written(offset);
        shared.stats.committed.fetch_add(1, Ordering::Relaxed);
    }
    Ok(())
}

fn fail_records(records: &[Arc<MsgIdRecord>]) {
    for record in records {
        let mut state = record.lock();
        if state.state == MsgIdState::Locked {
            state.transition(MsgIdState::Failed);
        }
    }
}

fn maybe_warn_collisions(shared: &HistoryShared, last_warn: &mut Instant) {
    let committed = shared.stats.committed.load(Ordering::Relaxed);
    if committed < COLLISION_WARN_MIN_COMMITS {
        return;
    }
    let collisions = shared.stats.collisions.load(Ordering::Relaxed);
    let rate = collisions as f64 / committed as f64;
    if rate > crate::config::HISTORY_COLLISION_WARN_RATE
        && last_warn.elapsed() >= COLLISION_WARN_INTERVAL
    {
        *last_warn = Instant::now();
        tracing::warn!(
            collisions,
            committed,
            rate = format!("{:.1}%", rate * 100.0),
            short_hash_len = shared.index.short_len(),
            "Hash index collision rate is high; consider a longer short hash"
        );
    }
}
