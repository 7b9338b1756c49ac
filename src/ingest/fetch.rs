//! The shared fetch queue and its worker pool.
//!
//! Per-group batch workers funnel work items into one queue per provider;
//! a fixed pool of fetchers (three quarters of the connection pool's
//! capacity, at least one) drains it, downloads each article over a pooled
//! connection, and sends the outcome back on the item's reply channel.
//! Closing the queue unwinds the pool; pending items come back with a
//! cancellation error through their dropped reply channels.

use std::sync::Arc;

use crate::article::Article;
use crate::group::GroupName;
use crate::msgid::MsgIdRecord;
use crate::nntp::pool::{ConnPool, PoolError};

/// One article to download for one group.
pub struct WorkItem {
    pub record: Arc<MsgIdRecord>,
    pub group: GroupName,
    /// Where the fetch outcome goes; each download run owns one receiver.
    pub reply: async_channel::Sender<FetchOutcome>,
}

/// What came back for a work item.
pub struct FetchOutcome {
    pub record: Arc<MsgIdRecord>,
    pub group: GroupName,
    pub result: Result<Article, PoolError>,
}

/// The fetcher pool attached to one provider's connection pool.
pub struct FetchPool {
    tx: async_channel::Sender<WorkItem>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl FetchPool {
    /// Number of fetchers for a connection pool of `max_conns`.
    pub fn worker_count(max_conns: usize) -> usize {
        (max_conns * 3 / 4).max(1)
    }

    /// Start the fetchers. They exit when the queue closes or `shutdown`
    /// fires.
    pub fn start(pool: ConnPool, shutdown: async_channel::Receiver<()>) -> Self {
        let workers = Self::worker_count(pool.max_conns());
        let (tx, rx) = async_channel::bounded::<WorkItem>(workers * 4);

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let rx = rx.clone();
            let pool = pool.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let item = tokio::select! {
                        item = rx.recv() => match item {
                            Ok(item) => item,
                            Err(_) => return,
                        },
                        _ = shutdown.recv() => return,
                    };
                    let result = pool.get_article(item.record.id()).await;
                    let outcome = FetchOutcome {
                        record: item.record,
                        group: item.group,
                        result,
                    };
                    if item.reply.send(outcome).await.is_err() {
                        // The download run was cancelled; keep draining.
                        tracing::trace!(fetcher = id, "Reply channel closed");
                    }
                }
            }));
        }

        tracing::debug!(
            provider = pool.provider_name(),
            workers,
            "Fetch pool started"
        );
        Self {
            tx,
            workers: handles,
        }
    }

    /// The queue that group batch workers forward into.
    pub fn queue(&self) -> async_channel::Sender<WorkItem> {
        self.tx.clone()
    }

    /// Close the queue and join every fetcher.
    pub async fn close(self) {
        self.tx.close();
        for handle in self.workers {
            let _ = handle.await;
        }
    }
}
