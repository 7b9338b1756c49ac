//! The runtime aggregate.
//!
//! Owns every long-lived subsystem (message-id cache, history store,
//! connection pools, fetch pools, batch scheduler, peer registry, group
//! and progress stores) and wires them together explicitly, so no
//! component reaches for process-wide singletons. Shutdown is ordered:
//! stop acceptors, signal ingests, drain the history writer, flush and
//! close the stores, join background tasks.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::config::AppConfig;
use crate::feed::peers::{PeerError, PeerRegistry};
use crate::group::GroupRegistry;
use crate::history::{History, HistoryError};
use crate::ingest::batch::BatchScheduler;
use crate::ingest::fetch::{FetchPool, WorkItem};
use crate::ingest::processor::Processor;
use crate::ingest::{Downloader, DownloadOutcome, IngestError};
use crate::msgid::{Local430, MembershipCache, MsgIdCache};
use crate::nntp::pool::ConnPool;
use crate::nntp::server::NntpServer;
use crate::nntp::session::ServerCtx;
use crate::progress::ProgressStore;
use crate::store::GroupStore;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Peers(#[from] PeerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything the engine needs at runtime, built once from config.
pub struct Runtime {
    pub config: Arc<AppConfig>,
    pub groups: Arc<GroupRegistry>,
    pub msgids: Arc<MsgIdCache>,
    pub local430: Arc<Local430>,
    pub membership: Arc<MembershipCache>,
    pub history: Arc<History>,
    pub store: Arc<dyn GroupStore>,
    pub progress: Arc<dyn ProgressStore>,
    pub peers: Arc<PeerRegistry>,
    pub scheduler: Arc<BatchScheduler>,
    pub processor: Arc<Processor>,
    pools: HashMap<String, ConnPool>,
    fetch_queues: HashMap<String, async_channel::Sender<WorkItem>>,
    fetch_pools: Mutex<Vec<FetchPool>>,
    download_parallel: Arc<Semaphore>,
    shutdown_tx: async_channel::Sender<()>,
    shutdown_rx: async_channel::Receiver<()>,
}

impl Runtime {
    /// Construct every subsystem. Background tasks are spawned here;
    /// callers must eventually invoke [`Runtime::shutdown`].
    pub fn build(
        config: AppConfig,
        store: Arc<dyn GroupStore>,
        progress: Arc<dyn ProgressStore>,
    ) -> Result<Arc<Self>, RuntimeError> {
        let config = Arc::new(config);
        let (shutdown_tx, shutdown_rx) = async_channel::bounded::<()>(1);

        let groups = Arc::new(GroupRegistry::new());
        let msgids = Arc::new(MsgIdCache::new());
        let local430 = Arc::new(Local430::new());
        let membership = Arc::new(MembershipCache::new());
        let history = Arc::new(History::open(&config.history)?);
        let peers = Arc::new(PeerRegistry::from_config(
            &config.peer,
            &config.logging.dns,
        )?);
        let scheduler = Arc::new(BatchScheduler::new(
            store.clone(),
            config.ingest.max_batch as usize,
        ));
        let processor = Arc::new(Processor::new(
            config.server.hostname.clone(),
            config.ingest.max_crossposts,
            groups.clone(),
            msgids.clone(),
            membership.clone(),
            history.clone(),
            store.clone(),
            scheduler.clone(),
        ));

        let mut pools = HashMap::new();
        let mut fetch_queues = HashMap::new();
        let mut fetch_pools = Vec::new();
        for provider in &config.provider {
            let pool = ConnPool::new(provider.clone());
            pool.spawn_sweeper(shutdown_rx.clone());
            let fetch_pool = FetchPool::start(pool.clone(), shutdown_rx.clone());
            fetch_queues.insert(provider.name.clone(), fetch_pool.queue());
            fetch_pools.push(fetch_pool);
            pools.insert(provider.name.clone(), pool);
        }

        // Background cache cleaner.
        tokio::spawn(msgids.clone().run_cleaner(shutdown_rx.clone()));

        let download_parallel = Arc::new(Semaphore::new(config.ingest.download_max_par.max(1)));

        Ok(Arc::new(Self {
            config,
            groups,
            msgids,
            local430,
            membership,
            history,
            store,
            progress,
            peers,
            scheduler,
            processor,
            pools,
            fetch_queues,
            fetch_pools: Mutex::new(fetch_pools),
            download_parallel,
            shutdown_tx,
            shutdown_rx,
        }))
    }

    /// A receiver that unblocks when shutdown begins.
    pub fn shutdown_signal(&self) -> async_channel::Receiver<()> {
        self.shutdown_rx.clone()
    }

    pub fn pool(&self, provider: &str) -> Option<&ConnPool> {
        self.pools.get(provider)
    }

    /// The shared context inbound sessions run against.
    pub fn server_ctx(&self) -> Arc<ServerCtx> {
        Arc::new(ServerCtx {
            server: self.config.server.clone(),
            groups: self.groups.clone(),
            msgids: self.msgids.clone(),
            local430: self.local430.clone(),
            history: self.history.clone(),
            store: self.store.clone(),
            processor: self.processor.clone(),
            peers: self.peers.clone(),
            error_delay_ms: crate::config::ERROR_DELAY_MS,
        })
    }

    pub fn server(&self) -> NntpServer {
        NntpServer::new(self.server_ctx())
    }

    /// A downloader bound to one provider's pool and fetch queue.
    pub fn downloader(&self, provider: &str) -> Option<Downloader> {
        let pool = self.pools.get(provider)?.clone();
        let getq = self.fetch_queues.get(provider)?.clone();
        Some(Downloader {
            provider: provider.to_string(),
            pool,
            getq,
            msgids: self.msgids.clone(),
            store: self.store.clone(),
            progress: self.progress.clone(),
            scheduler: self.scheduler.clone(),
            processor: self.processor.clone(),
            config: self.config.ingest.clone(),
            parallel: self.download_parallel.clone(),
            shutdown: self.shutdown_rx.clone(),
        })
    }

    /// One full ingest cycle: every provider, every configured group.
    pub async fn run_ingest_cycle(self: &Arc<Self>) {
        let mut handles = Vec::new();
        for provider in &self.config.provider {
            let Some(downloader) = self.downloader(&provider.name) else {
                continue;
            };
            let downloader = Arc::new(downloader);
            for group_name in &provider.groups {
                let group = self.groups.intern(group_name);
                let downloader = downloader.clone();
                handles.push(tokio::spawn(async move {
                    match downloader.download_group(&group).await {
                        Ok(DownloadOutcome::UpToDate) => {
                            tracing::debug!(%group, "Group up to date");
                        }
                        Ok(DownloadOutcome::Completed {
                            fetched,
                            duplicates,
                            errors,
                            checkpoint,
                        }) => {
                            tracing::info!(
                                %group,
                                fetched,
                                duplicates,
                                errors,
                                checkpoint,
                                "Group download window complete"
                            );
                        }
                        Err(IngestError::Cancelled) => {}
                        Err(e) => {
                            tracing::warn!(%group, error = %e, "Group download failed");
                        }
                    }
                }));
            }
        }
        for handle in handles {
            let _ = handle.await;
        }
        if let Err(e) = self.scheduler.flush_overviews().await {
            tracing::warn!(error = %e, "Overview flush failed");
        }
    }

    /// Ordered shutdown. Safe to call once.
    pub async fn shutdown(&self) {
        tracing::info!("Runtime shutting down");

        // 1. Signal everything listening on the shutdown channel:
        //    acceptors, ingest loops, sweepers, the cache cleaner.
        self.shutdown_tx.close();

        // 2. Stop the fetch pipelines and per-group workers.
        let fetch_pools: Vec<FetchPool> = std::mem::take(&mut *self.fetch_pools.lock());
        for fetch_pool in fetch_pools {
            fetch_pool.close().await;
        }
        self.scheduler.close_all().await;

        // 3. Flush buffered overviews into the group store.
        if let Err(e) = self.scheduler.flush_overviews().await {
            tracing::warn!(error = %e, "Final overview flush failed");
        }

        // 4. Drain and close the history writer.
        if let Err(e) = self.history.close() {
            tracing::error!(error = %e, "History close reported failure");
        }

        // 5. Close provider pools.
        for pool in self.pools.values() {
            pool.close().await;
        }

        tracing::info!("Runtime shutdown complete");
    }
}
