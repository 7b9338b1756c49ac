//! The history store: the engine's duplicate-detection oracle.
//!
//! An append-only log (`history.dat`) holds one line per message-id ever
//! accepted; a sharded hash index maps truncated SHA-256 prefixes back to
//! log offsets. `lookup` answers "have I seen this id?" in O(1) expected
//! time by probing the index and re-reading the log at each candidate
//! offset; `add` enqueues an append that a single writer thread commits in
//! batches. Entries are immutable once written.

mod lock;
mod log;
mod shard;
mod writer;

pub use self::log::{HistoryEntry, HistoryLog, FLAG_NONE};
pub use self::shard::{hash_message_id, ShardIndex, ShardRoute};

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{HistoryConfig, HISTORY_LOCK_FILE, HISTORY_LOG_FILE, HISTORY_QUEUE_CAPACITY};
use crate::error::{Classify, ErrorClass};
use crate::msgid::{MsgIdRecord, MsgIdState};

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("History log I/O error: {0}")]
    LogIo(#[source] std::io::Error),

    #[error("History index error: {0}")]
    Index(#[source] sled::Error),

    #[error("Corrupt history entry at offset {offset}")]
    CorruptEntry { offset: u64 },

    #[error("History lock file error: {0}")]
    LockFile(String),

    #[error("History writer has failed; no further entries accepted")]
    WriterPoisoned,

    #[error("History writer queue closed")]
    QueueClosed,
}

impl Classify for HistoryError {
    fn class(&self) -> ErrorClass {
        match self {
            HistoryError::Index(_) => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }
}

/// Outcome of a duplicate-detection probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Unseen: no index entry or only hash collisions.
    Pass,
    /// Definitively seen; the record's storage token and offset are set.
    Duplicate,
    /// The id is locked by another worker or mid-commit; back off briefly.
    Retry,
}

/// Live counters. Collisions are index rows that already had offsets when
/// a new one was appended.
#[derive(Debug, Default)]
pub struct HistoryStats {
    pub committed: AtomicU64,
    pub lookups: AtomicU64,
    pub hits: AtomicU64,
    pub collisions: AtomicU64,
}

/// Point-in-time view of the store's counters.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub queue_depth: usize,
    pub committed: u64,
    pub lookups: u64,
    pub hits: u64,
    pub collisions: u64,
    pub commits_per_sec: f64,
}

/// State shared between the public handle and the writer thread.
pub(crate) struct HistoryShared {
    pub(crate) log: HistoryLog,
    pub(crate) index: ShardIndex,
    pub(crate) stats: HistoryStats,
    pub(crate) poisoned: AtomicBool,
}

/// The public history store handle. Cheap to share via `Arc`.
pub struct History {
    shared: Arc<HistoryShared>,
    tx: async_channel::Sender<Arc<MsgIdRecord>>,
    writer: Mutex<Option<std::thread::JoinHandle<()>>>,
    opened_at: Instant,
    use_short_hash_len: usize,
}

impl History {
    /// Open (or create) the history directory and start the writer.
    ///
    /// The effective `use_short_hash_len` comes from the lock file when the
    /// directory was initialized before; a differing configured value is
    /// ignored with a warning.
    pub fn open(config: &HistoryConfig) -> Result<Self, HistoryError> {
        std::fs::create_dir_all(&config.dir).map_err(HistoryError::LogIo)?;

        let use_short_hash_len =
            lock::acquire(&config.dir.join(HISTORY_LOCK_FILE), config.use_short_hash_len)?;
        let log = HistoryLog::open(&config.dir.join(HISTORY_LOG_FILE))?;
        let index = ShardIndex::open(&config.dir, use_short_hash_len)?;

        let shared = Arc::new(HistoryShared {
            log,
            index,
            stats: HistoryStats::default(),
            poisoned: AtomicBool::new(false),
        });

        let (tx, rx) = async_channel::bounded(HISTORY_QUEUE_CAPACITY);
        let writer_shared = shared.clone();
        let flush_batch = config.flush_batch.max(1);
        let flush_interval = Duration::from_millis(config.flush_interval_ms);
        let handle = std::thread::Builder::new()
            .name("history-writer".to_string())
            .spawn(move || writer::run_writer(writer_shared, rx, flush_batch, flush_interval))
            .map_err(HistoryError::LogIo)?;

        tracing::info!(
            dir = %config.dir.display(),
            use_short_hash_len,
            "History store opened"
        );

        Ok(Self {
            shared,
            tx,
            writer: Mutex::new(Some(handle)),
            opened_at: Instant::now(),
            use_short_hash_len,
        })
    }

    /// The locked short-hash length actually in effect.
    pub fn use_short_hash_len(&self) -> usize {
        self.use_short_hash_len
    }

    /// Enqueue an append. Returns as soon as the record is queued; the
    /// writer sets the record's offset and flips it to Written, waking
    /// `wait_written` callers.
    pub async fn add(&self, record: Arc<MsgIdRecord>) -> Result<(), HistoryError> {
        if self.shared.poisoned.load(Ordering::SeqCst) {
            return Err(HistoryError::WriterPoisoned);
        }
        self.tx
            .send(record)
            .await
            .map_err(|_| HistoryError::QueueClosed)
    }

    /// Classify a message-id against the store.
    ///
    /// The caller must not hold the record's lock. A record currently
    /// Locked by a worker yields `Retry` (the writer may have pending work
    /// the index cannot see yet); readers degrade to an error rather than
    /// a false `Pass`.
    pub fn lookup(&self, record: &Arc<MsgIdRecord>) -> Result<Verdict, HistoryError> {
        self.shared.stats.lookups.fetch_add(1, Ordering::Relaxed);

        if record.current_state() == MsgIdState::Locked {
            return Ok(Verdict::Retry);
        }

        let route = self.shared.index.route(record.id());
        let offsets = self.shared.index.get_offsets(&route)?;
        if offsets.is_empty() {
            return Ok(Verdict::Pass);
        }

        for offset in offsets {
            let entry = self.shared.log.read_at(offset)?;
            if entry.message_id == record.id() {
                self.shared.stats.hits.fetch_add(1, Ordering::Relaxed);
                let mut state = record.lock();
                state.storage_token = entry.storage_token;
                state.offset = offset;
                return Ok(Verdict::Duplicate);
            }
        }

        // Every candidate was a hash collision with a different id.
        Ok(Verdict::Pass)
    }

    /// Async wrapper for callers on the hot serving path.
    pub async fn lookup_async(&self, record: Arc<MsgIdRecord>) -> Result<Verdict, HistoryError> {
        self.shared.stats.lookups.fetch_add(1, Ordering::Relaxed);
        if record.current_state() == MsgIdState::Locked {
            return Ok(Verdict::Retry);
        }
        let shared = self.shared.clone();
        let this = HistoryProbe { shared };
        tokio::task::spawn_blocking(move || this.probe(&record))
            .await
            .map_err(|_| HistoryError::QueueClosed)?
    }

    /// Drain the writer queue, fsync, and close the shards.
    pub fn close(&self) -> Result<(), HistoryError> {
        self.tx.close();
        if let Some(handle) = self.writer.lock().take() {
            let _ = handle.join();
        }
        self.shared.log.sync()?;
        self.shared.index.flush()?;
        if self.shared.poisoned.load(Ordering::SeqCst) {
            return Err(HistoryError::WriterPoisoned);
        }
        tracing::info!("History store closed");
        Ok(())
    }

    pub fn stats(&self) -> StatsSnapshot {
        let committed = self.shared.stats.committed.load(Ordering::Relaxed);
        let elapsed = self.opened_at.elapsed().as_secs_f64().max(0.001);
        StatsSnapshot {
            queue_depth: self.tx.len(),
            committed,
            lookups: self.shared.stats.lookups.load(Ordering::Relaxed),
            hits: self.shared.stats.hits.load(Ordering::Relaxed),
            collisions: self.shared.stats.collisions.load(Ordering::Relaxed),
            commits_per_sec: committed as f64 / elapsed,
        }
    }
}

/// Blocking probe used by `lookup_async`; same logic as `lookup` minus the
/// Locked fast path (checked before spawning).
struct HistoryProbe {
    shared: Arc<HistoryShared>,
}

impl HistoryProbe {
    fn probe(&self, record: &Arc<MsgIdRecord>) -> Result<Verdict, HistoryError> {
        let route = self.shared.index.route(record.id());
        let offsets = self.shared.index.get_offsets(&route)?;
        if offsets.is_empty() {
            return Ok(Verdict::Pass);
        }
        for offset in offsets {
            let entry = self.shared.log.read_at(offset)?;
            if entry.message_id == record.id() {
                self.shared.stats.hits.fetch_add(1, Ordering::Relaxed);
                let mut state = record.lock();
                state.storage_token = entry.storage_token;
                state.offset = offset;
                return Ok(Verdict::Duplicate);
            }
        }
        Ok(Verdict::Pass)
    }
}
