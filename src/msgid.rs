//! Process-wide message-id records and their lifecycle.
//!
//! `MsgIdCache` is the only structure that owns `MsgIdRecord`s; every other
//! component holds `Arc` aliases obtained from `get_or_create`. A record is
//! mutated by exactly one worker at a time under its mutex and evicted by a
//! background cleaner once expired and no longer locked.
//!
//! The cache map is sharded into buckets so lookups scale; a secondary
//! negative cache (`Local430`) memoizes "definitely unavailable" ids to
//! throttle futile re-queries by readers.

use moka::sync::Cache;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::config::{
    LOCAL430_CAPACITY, LOCAL430_TTL_SECS, MEMBERSHIP_CAPACITY, MEMBERSHIP_TTL_SECS,
    MSGID_CACHE_BUCKETS, MSGID_CLEANUP_INTERVAL_SECS, MSGID_LOCK_TTL_SECS,
};
use crate::group::GroupName;

/// Processing state of a message-id record.
///
/// Transitions are strictly `Fresh -> Locked -> {Written, Duplicate, Retry,
/// Failed}`; [`MsgIdRecordState::transition`] enforces this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgIdState {
    /// Created, nobody has claimed it yet.
    Fresh,
    /// A worker owns it and is downloading/filing the article.
    Locked,
    /// Committed to history; offset is final.
    Written,
    /// History already had this id.
    Duplicate,
    /// Unknown to the index but a writer may have pending work; back off.
    Retry,
    /// Validation rejected the article; a later repost is a new attempt.
    Failed,
}

impl MsgIdState {
    /// Whether `self -> next` is a permitted lifecycle transition.
    pub fn can_transition(self, next: MsgIdState) -> bool {
        match self {
            MsgIdState::Fresh => next == MsgIdState::Locked,
            MsgIdState::Locked => matches!(
                next,
                MsgIdState::Written | MsgIdState::Duplicate | MsgIdState::Retry | MsgIdState::Failed
            ),
            // Retry may be claimed again once the writer has drained.
            MsgIdState::Retry => next == MsgIdState::Locked,
            _ => false,
        }
    }
}

/// Per-group threading info captured while filing.
#[derive(Debug, Clone)]
pub struct ThreadingInfo {
    pub artnum: u64,
    pub thread_root: Option<String>,
    pub is_thread_root: bool,
}

/// Mutable fields of a record, guarded by the record mutex.
#[derive(Debug)]
pub struct MsgIdRecordState {
    pub state: MsgIdState,
    /// `group:articleNumber` locator into the group store.
    pub storage_token: String,
    pub group: Option<GroupName>,
    pub artnum: u64,
    /// Offset into the history log; 0 while unknown.
    pub offset: u64,
    /// Threading info per group the article was filed to.
    pub threading: HashMap<GroupName, ThreadingInfo>,
    /// Cache-eviction horizon.
    pub expires: Instant,
}

impl MsgIdRecordState {
    /// Apply a lifecycle transition, returning whether it was permitted.
    /// Forbidden transitions leave the state untouched.
    pub fn transition(&mut self, next: MsgIdState) -> bool {
        if self.state.can_transition(next) {
            self.state = next;
            true
        } else {
            false
        }
    }
}

/// One canonical record per message-id.
pub struct MsgIdRecord {
    id: String,
    state: Mutex<MsgIdRecordState>,
    /// Released when the history writer commits this record.
    written: Notify,
}

impl MsgIdRecord {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: Mutex::new(MsgIdRecordState {
                state: MsgIdState::Fresh,
                storage_token: String::new(),
                group: None,
                artnum: 0,
                offset: 0,
                threading: HashMap::new(),
                expires: Instant::now() + Duration::from_secs(MSGID_LOCK_TTL_SECS),
            }),
            written: Notify::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn lock(&self) -> MutexGuard<'_, MsgIdRecordState> {
        self.state.lock()
    }

    /// Current state without holding the lock across the call.
    pub fn current_state(&self) -> MsgIdState {
        self.state.lock().state
    }

    /// Mark committed to history at `offset` and wake any waiters.
    /// Called only by the history writer.
    pub fn mark_written(&self, offset: u64) {
        {
            let mut state = self.state.lock();
            state.offset = offset;
            state.state = MsgIdState::Written;
        }
        self.written.notify_waiters();
    }

    /// Wait until the history writer commits this record, up to `timeout`.
    /// Returns the final state either way.
    pub async fn wait_written(&self, timeout: Duration) -> MsgIdState {
        let notified = self.written.notified();
        tokio::pin!(notified);
        // Register before re-checking so a commit between the check and
        // the await cannot be missed.
        notified.as_mut().enable();
        if self.current_state() == MsgIdState::Written {
            return MsgIdState::Written;
        }
        let _ = tokio::time::timeout(timeout, notified).await;
        self.current_state()
    }
}

impl std::fmt::Debug for MsgIdRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgIdRecord").field("id", &self.id).finish()
    }
}

/// Bucket-sharded map from message-id to its canonical record.
pub struct MsgIdCache {
    buckets: Vec<RwLock<HashMap<String, Arc<MsgIdRecord>>>>,
}

impl Default for MsgIdCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MsgIdCache {
    pub fn new() -> Self {
        let buckets = (0..MSGID_CACHE_BUCKETS)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self { buckets }
    }

    fn bucket(&self, id: &str) -> &RwLock<HashMap<String, Arc<MsgIdRecord>>> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.buckets.len();
        &self.buckets[idx]
    }

    /// Return the canonical record for `id`, creating it on first mention.
    pub fn get_or_create(&self, id: &str) -> Arc<MsgIdRecord> {
        let bucket = self.bucket(id);
        if let Some(record) = bucket.read().get(id) {
            return record.clone();
        }
        let mut map = bucket.write();
        if let Some(record) = map.get(id) {
            return record.clone();
        }
        let record = Arc::new(MsgIdRecord::new(id));
        map.insert(id.to_string(), record.clone());
        record
    }

    /// Look up without creating.
    pub fn get(&self, id: &str) -> Option<Arc<MsgIdRecord>> {
        self.bucket(id).read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One eviction pass: drop records that are expired and not Locked.
    /// Records whose mutex is currently held are skipped this round.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        for bucket in &self.buckets {
            let mut map = bucket.write();
            map.retain(|_, record| {
                let Some(state) = record.state.try_lock() else {
                    return true;
                };
                if state.state == MsgIdState::Locked || state.expires > now {
                    return true;
                }
                evicted += 1;
                false
            });
        }
        evicted
    }

    /// Background cleaner loop. Exits when `shutdown` closes.
    pub async fn run_cleaner(self: Arc<Self>, shutdown: async_channel::Receiver<()>) {
        let interval = Duration::from_secs(MSGID_CLEANUP_INTERVAL_SECS);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let evicted = self.evict_expired();
                    if evicted > 0 {
                        tracing::debug!(evicted, remaining = self.len(), "Evicted expired message-id records");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("Message-id cache cleaner shutting down");
                    return;
                }
            }
        }
    }
}

/// Negative cache: ids recently answered with 430.
///
/// Readers hammering a missing article get the cached 430 for the TTL
/// instead of a fresh store lookup each time.
pub struct Local430 {
    cache: Cache<String, ()>,
}

impl Default for Local430 {
    fn default() -> Self {
        Self::new()
    }
}

impl Local430 {
    pub fn new() -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(LOCAL430_CAPACITY)
                .time_to_live(Duration::from_secs(LOCAL430_TTL_SECS))
                .build(),
        }
    }

    pub fn insert(&self, id: &str) {
        self.cache.insert(id.to_string(), ());
    }

    pub fn contains(&self, id: &str) -> bool {
        self.cache.get(id).is_some()
    }
}

/// Per-group membership memo: `(group, message-id)` pairs known to be filed.
pub struct MembershipCache {
    cache: Cache<String, ()>,
}

impl Default for MembershipCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MembershipCache {
    pub fn new() -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(MEMBERSHIP_CAPACITY)
                .time_to_live(Duration::from_secs(MEMBERSHIP_TTL_SECS))
                .build(),
        }
    }

    fn key(group: &GroupName, id: &str) -> String {
        format!("{}\u{0}{}", group, id)
    }

    pub fn insert(&self, group: &GroupName, id: &str) {
        self.cache.insert(Self::key(group, id), ());
    }

    pub fn contains(&self, group: &GroupName, id: &str) -> bool {
        self.cache.get(&Self::key(group, id)).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =============================================================================
    // State machine
    // =============================================================================

    #[test]
    fn test_fresh_can_only_lock() {
        assert!(MsgIdState::Fresh.can_transition(MsgIdState::Locked));
        assert!(!MsgIdState::Fresh.can_transition(MsgIdState::Written));
        assert!(!MsgIdState::Fresh.can_transition(MsgIdState::Duplicate));
        assert!(!MsgIdState::Fresh.can_transition(MsgIdState::Failed));
    }

    #[test]
    fn test_locked_reaches_all_terminals() {
        for next in [
            MsgIdState::Written,
            MsgIdState::Duplicate,
            MsgIdState::Retry,
            MsgIdState::Failed,
        ] {
            assert!(MsgIdState::Locked.can_transition(next));
        }
        assert!(!MsgIdState::Locked.can_transition(MsgIdState::Fresh));
    }

    #[test]
    fn test_terminal_states_stick() {
        for from in [MsgIdState::Written, MsgIdState::Duplicate, MsgIdState::Failed] {
            for next in [
                MsgIdState::Fresh,
                MsgIdState::Locked,
                MsgIdState::Written,
                MsgIdState::Duplicate,
                MsgIdState::Retry,
                MsgIdState::Failed,
            ] {
                assert!(!from.can_transition(next), "{:?} -> {:?}", from, next);
            }
        }
    }

    #[test]
    fn test_retry_can_be_reclaimed() {
        assert!(MsgIdState::Retry.can_transition(MsgIdState::Locked));
        assert!(!MsgIdState::Retry.can_transition(MsgIdState::Written));
    }

    #[test]
    fn test_transition_rejects_and_preserves() {
        let record = MsgIdRecord::new("<a@b>");
        let mut state = record.lock();
        assert!(!state.transition(MsgIdState::Written));
        assert_eq!(state.state, MsgIdState::Fresh);
        assert!(state.transition(MsgIdState::Locked));
        assert!(state.transition(MsgIdState::Duplicate));
        assert_eq!(state.state, MsgIdState::Duplicate);
    }

    // =============================================================================
    // Cache
    // =============================================================================

    #[test]
    fn test_get_or_create_is_canonical() {
        let cache = MsgIdCache::new();
        let a = cache.get_or_create("<a@b>");
        let b = cache.get_or_create("<a@b>");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_eviction_skips_locked_records() {
        let cache = MsgIdCache::new();
        let record = cache.get_or_create("<a@b>");
        {
            let mut state = record.lock();
            state.transition(MsgIdState::Locked);
            state.expires = Instant::now() - Duration::from_secs(1);
        }
        assert_eq!(cache.evict_expired(), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_eviction_drops_expired_terminal_records() {
        let cache = MsgIdCache::new();
        let record = cache.get_or_create("<a@b>");
        {
            let mut state = record.lock();
            state.transition(MsgIdState::Locked);
            state.transition(MsgIdState::Duplicate);
            state.expires = Instant::now() - Duration::from_secs(1);
        }
        drop(record);
        assert_eq!(cache.evict_expired(), 1);
        assert!(cache.get("<a@b>").is_none());
    }

    #[test]
    fn test_eviction_keeps_unexpired_records() {
        let cache = MsgIdCache::new();
        let _record = cache.get_or_create("<fresh@b>");
        assert_eq!(cache.evict_expired(), 0);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_mark_written_wakes_waiters() {
        let record = Arc::new(MsgIdRecord::new("<a@b>"));
        {
            let mut state = record.lock();
            state.transition(MsgIdState::Locked);
        }
        let waiter = {
            let record = record.clone();
            tokio::spawn(async move { record.wait_written(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        record.mark_written(1234);
        assert_eq!(waiter.await.unwrap(), MsgIdState::Written);
        assert_eq!(record.lock().offset, 1234);
    }

    // =============================================================================
    // Negative + membership caches
    // =============================================================================

    #[test]
    fn test_local430_memoizes() {
        let negative = Local430::new();
        assert!(!negative.contains("<gone@b>"));
        negative.insert("<gone@b>");
        assert!(negative.contains("<gone@b>"));
    }

    #[test]
    fn test_membership_keys_are_per_group() {
        use crate::group::GroupRegistry;
        let registry = GroupRegistry::new();
        let rust = registry.intern("comp.lang.rust");
        let go = registry.intern("comp.lang.go");
        let members = MembershipCache::new();
        members.insert(&rust, "<a@b>");
        assert!(members.contains(&rust, "<a@b>"));
        assert!(!members.contains(&go, "<a@b>"));
    }
}
