//! Per-group batch scheduling and overview capture.
//!
//! Every group being ingested gets a dedicated worker with a bounded
//! inbound channel and a shutdown signal. The worker's only job is to
//! forward work items onto the shared fetch queue, giving each group a
//! bounded buffer and making per-group teardown cheap. Overview rows are
//! captured into a per-group buffer and committed to the group store in
//! batches.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::article::OverviewRow;
use crate::group::GroupName;
use crate::store::{GroupStore, StoreError};

use super::fetch::WorkItem;

/// Buffered overview rows flush once a group accumulates this many.
const OVERVIEW_FLUSH_THRESHOLD: usize = 50;

struct GroupBatch {
    tx: async_channel::Sender<WorkItem>,
    shutdown: async_channel::Sender<()>,
    worker: tokio::task::JoinHandle<()>,
}

/// Owns the per-group workers and the overview capture buffers.
pub struct BatchScheduler {
    store: Arc<dyn GroupStore>,
    capacity: usize,
    batches: Mutex<HashMap<GroupName, GroupBatch>>,
    overviews: Mutex<HashMap<GroupName, Vec<OverviewRow>>>,
}

impl BatchScheduler {
    pub fn new(store: Arc<dyn GroupStore>, capacity: usize) -> Self {
        Self {
            store,
            capacity: capacity.max(1),
            batches: Mutex::new(HashMap::new()),
            overviews: Mutex::new(HashMap::new()),
        }
    }

    /// Get the group's inbound channel, starting its worker on first
    /// demand. The worker forwards every item onto `getq`.
    pub fn get_or_create(
        &self,
        group: &GroupName,
        getq: async_channel::Sender<WorkItem>,
    ) -> async_channel::Sender<WorkItem> {
        let mut batches = self.batches.lock();
        if let Some(batch) = batches.get(group) {
            return batch.tx.clone();
        }

        let (tx, rx) = async_channel::bounded::<WorkItem>(self.capacity);
        let (shutdown_tx, shutdown_rx) = async_channel::bounded::<()>(1);
        let worker_group = group.clone();
        let worker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    item = rx.recv() => {
                        let Ok(item) = item else {
                            return;
                        };
                        if getq.send(item).await.is_err() {
                            tracing::debug!(group = %worker_group, "Fetch queue closed, batch worker exiting");
                            return;
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::debug!(group = %worker_group, "Batch worker shutting down");
                        return;
                    }
                }
            }
        });

        batches.insert(
            group.clone(),
            GroupBatch {
                tx: tx.clone(),
                shutdown: shutdown_tx,
                worker,
            },
        );
        tracing::debug!(%group, "Started group batch worker");
        tx
    }

    /// Signal the group's worker and wait for it to exit.
    pub async fn close_group(&self, group: &GroupName) {
        let batch = self.batches.lock().remove(group);
        if let Some(batch) = batch {
            batch.tx.close();
            batch.shutdown.close();
            let _ = batch.worker.await;
        }
    }

    /// Close every group worker.
    pub async fn close_all(&self) {
        let all: Vec<GroupName> = self.batches.lock().keys().cloned().collect();
        for group in all {
            self.close_group(&group).await;
        }
    }

    /// Buffer an overview row for a later batched commit.
    pub async fn capture_overview(
        &self,
        group: &GroupName,
        row: OverviewRow,
    ) -> Result<(), StoreError> {
        let flush: Option<Vec<OverviewRow>> = {
            let mut overviews = self.overviews.lock();
            let buffer = overviews.entry(group.clone()).or_default();
            buffer.push(row);
            if buffer.len() >= OVERVIEW_FLUSH_THRESHOLD {
                Some(std::mem::take(buffer))
            } else {
                None
            }
        };
        if let Some(rows) = flush {
            self.store.commit_overview(group, rows).await?;
        }
        Ok(())
    }

    /// Commit every buffered overview row.
    pub async fn flush_overviews(&self) -> Result<(), StoreError> {
        let pending: Vec<(GroupName, Vec<OverviewRow>)> = {
            let mut overviews = self.overviews.lock();
            overviews
                .iter_mut()
                .filter(|(_, rows)| !rows.is_empty())
                .map(|(group, rows)| (group.clone(), std::mem::take(rows)))
                .collect()
        };
        for (group, rows) in pending {
            self.store.commit_overview(&group, rows).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::GroupRegistry;
    use crate::store::MemGroupStore;

    fn row(num: u64) -> OverviewRow {
        OverviewRow {
            num,
            subject: format!("s{}", num),
            from: "f".to_string(),
            date: "d".to_string(),
            message_id: format!("<m{}@x>", num),
            references: String::new(),
            bytes: 1,
            lines: 1,
        }
    }

    #[tokio::test]
    async fn test_worker_forwards_to_getq() {
        let registry = GroupRegistry::new();
        let group = registry.intern("alt.test");
        let store = Arc::new(MemGroupStore::new());
        let scheduler = BatchScheduler::new(store, 10);

        let (getq_tx, getq_rx) = async_channel::bounded(10);
        let (reply_tx, _reply_rx) = async_channel::bounded(10);
        let tx = scheduler.get_or_create(&group, getq_tx);

        let cache = crate::msgid::MsgIdCache::new();
        let item = WorkItem {
            record: cache.get_or_create("<a@b>"),
            group: group.clone(),
            reply: reply_tx,
        };
        tx.send(item).await.unwrap();

        let forwarded = getq_rx.recv().await.unwrap();
        assert_eq!(forwarded.record.id(), "<a@b>");
        scheduler.close_all().await;
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_worker() {
        let registry = GroupRegistry::new();
        let group = registry.intern("alt.test");
        let store = Arc::new(MemGroupStore::new());
        let scheduler = BatchScheduler::new(store, 10);

        let (getq_tx, _getq_rx) = async_channel::bounded(10);
        let a = scheduler.get_or_create(&group, getq_tx.clone());
        let b = scheduler.get_or_create(&group, getq_tx);
        assert!(a.same_channel(&b));
        scheduler.close_all().await;
    }

    #[tokio::test]
    async fn test_overview_capture_flushes_on_demand() {
        let registry = GroupRegistry::new();
        let group = registry.intern("alt.test");
        let store = Arc::new(MemGroupStore::new());
        store.ensure_group(&group).await.unwrap();
        let scheduler = BatchScheduler::new(store.clone(), 10);

        scheduler.capture_overview(&group, row(1)).await.unwrap();
        scheduler.capture_overview(&group, row(2)).await.unwrap();
        // Below the threshold: nothing committed yet.
        assert!(store.overview_range(&group, 1, 10).await.unwrap().is_empty());

        scheduler.flush_overviews().await.unwrap();
        let rows = store.overview_range(&group, 1, 10).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_overview_capture_flushes_at_threshold() {
        let registry = GroupRegistry::new();
        let group = registry.intern("alt.test");
        let store = Arc::new(MemGroupStore::new());
        store.ensure_group(&group).await.unwrap();
        let scheduler = BatchScheduler::new(store.clone(), 10);

        for i in 1..=OVERVIEW_FLUSH_THRESHOLD as u64 {
            scheduler.capture_overview(&group, row(i)).await.unwrap();
        }
        let rows = store.overview_range(&group, 1, 1000).await.unwrap();
        assert_eq!(rows.len(), OVERVIEW_FLUSH_THRESHOLD);
    }

    #[tokio::test]
    async fn test_close_group_joins_worker() {
        let registry = GroupRegistry::new();
        let group = registry.intern("alt.test");
        let store = Arc::new(MemGroupStore::new());
        let scheduler = BatchScheduler::new(store, 10);

        let (getq_tx, _getq_rx) = async_channel::bounded(10);
        let tx = scheduler.get_or_create(&group, getq_tx);
        scheduler.close_group(&group).await;
        assert!(tx.is_closed());
    }
}
