//! Bounded pool of client connections to one provider.
//!
//! At most `max_conns` connections exist at a time, enforced by a
//! semaphore whose permit travels with each connection. `get` prefers an
//! idle connection that is still connected and fresh, dials a new one
//! under the cap, and otherwise waits up to the checkout timeout. A
//! background sweeper re-checks idle connections every few seconds and
//! drops the expired ones. Callers that hit an operation error close the
//! handle instead of returning it; the freed permit lets `get` dial a
//! replacement.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::article::Article;
use crate::config::{
    ProviderConfig, POOL_GET_TIMEOUT_SECS, POOL_SWEEP_INTERVAL_SECS, POOL_TIMEOUT_MSG,
};
use crate::error::{Classify, ErrorClass};

use super::client::{ClientConnection, ClientError, GroupStats};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("{}", POOL_TIMEOUT_MSG)]
    Timeout,

    #[error("Pool is closed")]
    Closed,

    #[error(transparent)]
    Client(#[from] ClientError),
}

impl Classify for PoolError {
    fn class(&self) -> ErrorClass {
        match self {
            PoolError::Timeout | PoolError::Closed => ErrorClass::Transient,
            PoolError::Client(e) => e.class(),
        }
    }
}

/// Pool counters, exported through `stats`.
#[derive(Debug, Default)]
struct PoolCounters {
    created: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
}

/// Snapshot of the pool's state.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub idle: usize,
    pub capacity: usize,
    pub created: u64,
    pub reused: u64,
    pub discarded: u64,
}

struct IdleEntry {
    conn: ClientConnection,
    permit: OwnedSemaphorePermit,
}

struct PoolInner {
    provider: ProviderConfig,
    idle_tx: async_channel::Sender<IdleEntry>,
    idle_rx: async_channel::Receiver<IdleEntry>,
    live: Arc<Semaphore>,
    idle_timeout: Duration,
    counters: PoolCounters,
    closed: AtomicBool,
}

/// Bounded connection pool to a single provider.
#[derive(Clone)]
pub struct ConnPool {
    inner: Arc<PoolInner>,
}

impl ConnPool {
    pub fn new(provider: ProviderConfig) -> Self {
        let max_conns = provider.max_conns().max(1);
        let (idle_tx, idle_rx) = async_channel::bounded(max_conns);
        let inner = Arc::new(PoolInner {
            idle_timeout: Duration::from_secs(provider.idle_timeout_seconds()),
            provider,
            idle_tx,
            idle_rx,
            live: Arc::new(Semaphore::new(max_conns)),
            counters: PoolCounters::default(),
            closed: AtomicBool::new(false),
        });
        Self { inner }
    }

    pub fn provider_name(&self) -> &str {
        &self.inner.provider.name
    }

    pub fn max_conns(&self) -> usize {
        self.inner.provider.max_conns().max(1)
    }

    /// Spawn the idle sweeper; exits when `shutdown` closes.
    pub fn spawn_sweeper(&self, shutdown: async_channel::Receiver<()>) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let interval = Duration::from_secs(POOL_SWEEP_INTERVAL_SECS);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        Self::sweep(&inner);
                    }
                    _ = shutdown.recv() => return,
                }
            }
        });
    }

    /// Drain the idle queue once, keeping only valid connections.
    fn sweep(inner: &PoolInner) {
        let mut keep = Vec::new();
        while let Ok(entry) = inner.idle_rx.try_recv() {
            if entry.conn.is_connected() && entry.conn.idle_for() < inner.idle_timeout {
                keep.push(entry);
            } else {
                inner.counters.discarded.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    provider = %inner.provider.name,
                    "Sweeper dropped expired idle connection"
                );
            }
        }
        for entry in keep {
            // Queue capacity equals the semaphore capacity, so this only
            // fails while closing.
            let _ = inner.idle_tx.try_send(entry);
        }
    }

    /// Check out a connection, waiting up to the checkout timeout.
    pub async fn get(&self) -> Result<PooledConn, PoolError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(POOL_GET_TIMEOUT_SECS);

        loop {
            // Fast path: a valid idle connection.
            while let Ok(entry) = self.inner.idle_rx.try_recv() {
                if entry.conn.is_connected() && entry.conn.idle_for() < self.inner.idle_timeout {
                    self.inner.counters.reused.fetch_add(1, Ordering::Relaxed);
                    return Ok(PooledConn::new(self.inner.clone(), entry.conn, entry.permit));
                }
                self.inner.counters.discarded.fetch_add(1, Ordering::Relaxed);
            }

            // Room under the cap: dial a new connection.
            if let Ok(permit) = self.inner.live.clone().try_acquire_owned() {
                let conn = ClientConnection::connect(&self.inner.provider).await?;
                self.inner.counters.created.fetch_add(1, Ordering::Relaxed);
                return Ok(PooledConn::new(self.inner.clone(), conn, permit));
            }

            // Full: wait for a return or a freed slot, bounded by the
            // checkout deadline.
            enum Woke {
                Idle(IdleEntry),
                Slot(OwnedSemaphorePermit),
            }
            let wait = async {
                tokio::select! {
                    entry = self.inner.idle_rx.recv() => {
                        entry.map(Woke::Idle).map_err(|_| PoolError::Closed)
                    }
                    permit = self.inner.live.clone().acquire_owned() => {
                        permit.map(Woke::Slot).map_err(|_| PoolError::Closed)
                    }
                }
            };
            match tokio::time::timeout_at(deadline, wait).await {
                Ok(Ok(Woke::Idle(entry))) => {
                    if entry.conn.is_connected()
                        && entry.conn.idle_for() < self.inner.idle_timeout
                    {
                        self.inner.counters.reused.fetch_add(1, Ordering::Relaxed);
                        return Ok(PooledConn::new(self.inner.clone(), entry.conn, entry.permit));
                    }
                    self.inner.counters.discarded.fetch_add(1, Ordering::Relaxed);
                    // Permit freed by dropping the entry; loop and retry.
                }
                Ok(Ok(Woke::Slot(permit))) => {
                    let conn = ClientConnection::connect(&self.inner.provider).await?;
                    self.inner.counters.created.fetch_add(1, Ordering::Relaxed);
                    return Ok(PooledConn::new(self.inner.clone(), conn, permit));
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    tracing::warn!(provider = %self.inner.provider.name, "Pool checkout timed out");
                    return Err(PoolError::Timeout);
                }
            }
        }
    }

    /// Close the pool: refuse new checkouts and quit idle connections.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.idle_rx.close();
        while let Ok(mut entry) = self.inner.idle_rx.try_recv() {
            entry.conn.quit().await;
        }
        tracing::debug!(provider = %self.inner.provider.name, "Pool closed");
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.inner.idle_rx.len(),
            capacity: self.max_conns(),
            created: self.inner.counters.created.load(Ordering::Relaxed),
            reused: self.inner.counters.reused.load(Ordering::Relaxed),
            discarded: self.inner.counters.discarded.load(Ordering::Relaxed),
        }
    }

    // =========================================================================
    // Forwarded operations with automatic checkout
    // =========================================================================

    /// STAT an article on any pooled connection.
    pub async fn stat_article(&self, message_id: &str) -> Result<bool, PoolError> {
        let mut conn = self.get().await?;
        match conn.stat_article(message_id).await {
            Ok(found) => Ok(found),
            Err(e) => {
                conn.discard();
                Err(e.into())
            }
        }
    }

    /// Fetch an article on any pooled connection.
    pub async fn get_article(&self, message_id: &str) -> Result<Article, PoolError> {
        let mut conn = self.get().await?;
        match conn.get_article(message_id).await {
            Ok(article) => Ok(article),
            Err(e @ (ClientError::ArticleNotFound | ClientError::ArticleRemoved)) => {
                // Expected negatives leave the connection healthy.
                Err(e.into())
            }
            Err(e) => {
                conn.discard();
                Err(e.into())
            }
        }
    }

    /// Select a group on any pooled connection and return its watermarks.
    pub async fn select_group(&self, group: &str) -> Result<GroupStats, PoolError> {
        let mut conn = self.get().await?;
        match conn.select_group(group).await {
            Ok(stats) => Ok(stats),
            Err(e @ ClientError::NoSuchGroup(_)) => Err(e.into()),
            Err(e) => {
                conn.discard();
                Err(e.into())
            }
        }
    }
}

/// A checked-out connection. Dropping it returns the connection to the
/// idle queue when it is still healthy; `discard` closes it instead.
pub struct PooledConn {
    inner: Arc<PoolInner>,
    conn: Option<ClientConnection>,
    permit: Option<OwnedSemaphorePermit>,
    discard: bool,
}

impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn")
            .field("discard", &self.discard)
            .finish()
    }
}

impl PooledConn {
    fn new(inner: Arc<PoolInner>, conn: ClientConnection, permit: OwnedSemaphorePermit) -> Self {
        Self {
            inner,
            conn: Some(conn),
            permit: Some(permit),
            discard: false,
        }
    }

    /// Mark this connection broken; it will be closed on drop and its
    /// slot freed for a replacement.
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl Deref for PooledConn {
    type Target = ClientConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        let (Some(conn), Some(permit)) = (self.conn.take(), self.permit.take()) else {
            return;
        };
        if self.discard || !conn.is_connected() || self.inner.closed.load(Ordering::SeqCst) {
            self.inner.counters.discarded.fetch_add(1, Ordering::Relaxed);
            // Dropping the permit frees the slot.
            return;
        }
        // Return to the idle queue. Capacity matches the semaphore, so a
        // full queue means the pool is closing; close the connection then.
        if self.inner.idle_tx.try_send(IdleEntry { conn, permit }).is_err() {
            self.inner.counters.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }
}
