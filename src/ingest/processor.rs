//! Article validation, deduplication, and filing.
//!
//! `process_article` is the single entry point every accepted article goes
//! through, whether it arrived by bulk download or on the server's
//! POST/IHAVE/TAKETHIS path. Validation failures permanently reject the
//! id; the dedup protocol claims the message-id record under its lock
//! before any store writes; filing assigns article numbers group by group
//! and the history commit happens only after at least one group filed.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::article::{future_date_secs, storage_token, valid_message_id, Article, OverviewRow};
use crate::config::{MAX_FUTURE_DATE_SECS, MSGID_LOCK_TTL_SECS};
use crate::error::{Classify, ErrorClass};
use crate::group::{GroupName, GroupRegistry};
use crate::history::{History, HistoryError, Verdict};
use crate::msgid::{MembershipCache, MsgIdCache, MsgIdRecord, MsgIdState, ThreadingInfo};
use crate::store::{GroupStore, StoreError};

use super::batch::BatchScheduler;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Article rejected: {0}")]
    Rejected(&'static str),

    #[error("Message-id is being processed by another worker")]
    Busy,

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for ProcessError {
    fn class(&self) -> ErrorClass {
        match self {
            ProcessError::Rejected(_) => ErrorClass::PolicyReject,
            ProcessError::Busy => ErrorClass::Transient,
            ProcessError::History(e) => e.class(),
            ProcessError::Store(e) => e.class(),
        }
    }
}

/// What happened to an article.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Filed to these groups with these article numbers.
    Filed(Vec<(GroupName, u64)>),
    /// Already present everywhere it was addressed.
    Duplicate,
}

/// The article processor. One per runtime; cheap to share.
pub struct Processor {
    hostname: String,
    max_crossposts: usize,
    groups: Arc<GroupRegistry>,
    msgids: Arc<MsgIdCache>,
    membership: Arc<MembershipCache>,
    history: Arc<History>,
    store: Arc<dyn GroupStore>,
    batch: Arc<BatchScheduler>,
}

impl Processor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hostname: String,
        max_crossposts: usize,
        groups: Arc<GroupRegistry>,
        msgids: Arc<MsgIdCache>,
        membership: Arc<MembershipCache>,
        history: Arc<History>,
        store: Arc<dyn GroupStore>,
        batch: Arc<BatchScheduler>,
    ) -> Self {
        Self {
            hostname,
            max_crossposts,
            groups,
            msgids,
            membership,
            history,
            store,
            batch,
        }
    }

    /// Validate, deduplicate, file, and commit one article.
    ///
    /// In bulk mode the caller (the download pipeline) already holds the
    /// record in Locked state and the article files to `primary` only; on
    /// the server path the full crosspost set from the Newsgroups header
    /// is expanded.
    #[tracing::instrument(name = "process_article", skip(self, article), fields(message_id = %article.message_id, %primary, bulk))]
    pub async fn process_article(
        &self,
        mut article: Article,
        primary: &GroupName,
        bulk: bool,
    ) -> Result<ProcessOutcome, ProcessError> {
        if let Err(reason) = self.validate(&mut article, bulk) {
            let record = self.msgids.get_or_create(&article.message_id);
            mark_failed(&record);
            tracing::debug!(reason, "Article rejected");
            return Err(ProcessError::Rejected(reason));
        }

        let record = self.msgids.get_or_create(&article.message_id);
        if !bulk {
            match self.claim(&record).await? {
                Claim::Claimed => {}
                Claim::Duplicate => return Ok(ProcessOutcome::Duplicate),
            }
        } else {
            // The enumerator locked the record before queueing the fetch;
            // an unlocked record here means a fresh direct call.
            let mut state = record.lock();
            match state.state {
                MsgIdState::Locked => {}
                MsgIdState::Written | MsgIdState::Duplicate => {
                    return Ok(ProcessOutcome::Duplicate)
                }
                MsgIdState::Failed => return Err(ProcessError::Rejected("previously rejected")),
                _ => {
                    if !state.transition(MsgIdState::Locked) {
                        return Err(ProcessError::Busy);
                    }
                    state.expires = Instant::now() + Duration::from_secs(MSGID_LOCK_TTL_SECS);
                }
            }
        }

        // Routing: bulk files to the primary group only; otherwise expand
        // the crosspost set.
        let targets: Vec<GroupName> = if bulk {
            vec![primary.clone()]
        } else {
            article
                .newsgroups
                .iter()
                .map(|name| self.groups.intern(name))
                .collect()
        };

        let shared = Arc::new(article);
        let mut assignments: Vec<(GroupName, u64)> = Vec::new();
        for group in &targets {
            if self.membership.contains(group, &shared.message_id) {
                continue;
            }
            if self.store.has_article(group, &shared.message_id).await {
                self.membership.insert(group, &shared.message_id);
                continue;
            }
            self.store.ensure_group(group).await?;
            let number = self.store.file_article(group, shared.clone()).await?;
            self.membership.insert(group, &shared.message_id);
            self.batch
                .capture_overview(group, OverviewRow::from_article(number, &shared))
                .await?;

            {
                let mut state = record.lock();
                state.threading.insert(
                    group.clone(),
                    ThreadingInfo {
                        artnum: number,
                        thread_root: thread_root_of(&shared),
                        is_thread_root: shared.is_thread_root,
                    },
                );
            }
            assignments.push((group.clone(), number));
        }

        if assignments.is_empty() {
            let mut state = record.lock();
            state.transition(MsgIdState::Duplicate);
            return Ok(ProcessOutcome::Duplicate);
        }

        self.commit_history(&record, &assignments[0]).await?;
        tracing::debug!(
            groups = assignments.len(),
            first = %assignments[0].0,
            "Article filed"
        );
        Ok(ProcessOutcome::Filed(assignments))
    }

    /// The validation gate. Mutates the article only to synthesize or
    /// prefix the Path header.
    fn validate(&self, article: &mut Article, bulk: bool) -> Result<(), &'static str> {
        if !valid_message_id(&article.message_id) {
            return Err("invalid message-id");
        }
        if !bulk && article.newsgroups.is_empty() {
            return Err("missing Newsgroups header");
        }
        if article.newsgroups.len() > self.max_crossposts {
            return Err("too many crossposts");
        }
        let Some(date) = article.parsed_date() else {
            return Err("unparseable Date header");
        };
        if future_date_secs(&date, Utc::now()) > MAX_FUTURE_DATE_SECS {
            return Err("Date too far in the future");
        }
        if article.subject.trim().is_empty() {
            return Err("empty Subject");
        }
        if article.from.trim().is_empty() {
            return Err("empty From");
        }

        if article.path.is_empty() {
            article.path = format!("{}!not-for-mail", self.hostname);
        } else if !article.path.starts_with(&self.hostname) {
            article.path = format!("{}!{}", self.hostname, article.path);
        }
        article
            .headers
            .insert("path".to_string(), vec![article.path.clone()]);
        Ok(())
    }

    /// Claim the record for processing. Implements the dedup branch
    /// protocol: terminal states short-circuit, Fresh locks directly,
    /// anything else consults history and re-locks on Pass.
    async fn claim(&self, record: &Arc<MsgIdRecord>) -> Result<Claim, ProcessError> {
        {
            let mut state = record.lock();
            match state.state {
                MsgIdState::Written | MsgIdState::Duplicate => return Ok(Claim::Duplicate),
                MsgIdState::Failed => return Err(ProcessError::Rejected("previously rejected")),
                MsgIdState::Locked => return Err(ProcessError::Busy),
                MsgIdState::Fresh => {
                    state.transition(MsgIdState::Locked);
                    state.expires = Instant::now() + Duration::from_secs(MSGID_LOCK_TTL_SECS);
                    return Ok(Claim::Claimed);
                }
                MsgIdState::Retry => {}
            }
        }

        // Retry: the index may know it by now.
        match self.history.lookup_async(record.clone()).await? {
            Verdict::Duplicate => {
                let mut state = record.lock();
                if state.state == MsgIdState::Retry {
                    state.transition(MsgIdState::Locked);
                    state.transition(MsgIdState::Duplicate);
                }
                Ok(Claim::Duplicate)
            }
            Verdict::Retry => Err(ProcessError::Busy),
            Verdict::Pass => {
                let mut state = record.lock();
                match state.state {
                    MsgIdState::Retry | MsgIdState::Fresh => {
                        state.transition(MsgIdState::Locked);
                        state.expires = Instant::now() + Duration::from_secs(MSGID_LOCK_TTL_SECS);
                        Ok(Claim::Claimed)
                    }
                    MsgIdState::Written | MsgIdState::Duplicate => Ok(Claim::Duplicate),
                    _ => Err(ProcessError::Busy),
                }
            }
        }
    }

    /// Record the first assignment on the record and enqueue the history
    /// append. The record flips to Written when the writer commits.
    async fn commit_history(
        &self,
        record: &Arc<MsgIdRecord>,
        assignment: &(GroupName, u64),
    ) -> Result<(), ProcessError> {
        {
            let mut state = record.lock();
            if state.group.is_none() {
                state.group = Some(assignment.0.clone());
                state.artnum = assignment.1;
            }
            state.storage_token = storage_token(assignment.0.as_str(), assignment.1);
        }
        self.history.add(record.clone()).await?;
        Ok(())
    }
}

enum Claim {
    Claimed,
    Duplicate,
}

/// First referenced id: the thread root for a reply.
fn thread_root_of(article: &Article) -> Option<String> {
    article
        .references
        .split_whitespace()
        .next()
        .map(|s| s.to_string())
}

/// Drive a record into Failed from whatever non-terminal state it is in.
fn mark_failed(record: &Arc<MsgIdRecord>) {
    let mut state = record.lock();
    match state.state {
        MsgIdState::Fresh | MsgIdState::Retry => {
            state.transition(MsgIdState::Locked);
            state.transition(MsgIdState::Failed);
        }
        MsgIdState::Locked => {
            state.transition(MsgIdState::Failed);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HistoryConfig;
    use crate::msgid::MsgIdCache;
    use crate::store::MemGroupStore;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        processor: Processor,
        groups: Arc<GroupRegistry>,
        msgids: Arc<MsgIdCache>,
        store: Arc<MemGroupStore>,
        history: Arc<History>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let history = Arc::new(
            History::open(&HistoryConfig {
                dir: dir.path().join("history"),
                use_short_hash_len: 7,
                flush_batch: 1,
                flush_interval_ms: 5,
            })
            .unwrap(),
        );
        let groups = Arc::new(GroupRegistry::new());
        let msgids = Arc::new(MsgIdCache::new());
        let membership = Arc::new(MembershipCache::new());
        let store = Arc::new(MemGroupStore::new());
        let batch = Arc::new(BatchScheduler::new(store.clone(), 100));
        let processor = Processor::new(
            "news.example.org".to_string(),
            10,
            groups.clone(),
            msgids.clone(),
            membership,
            history.clone(),
            store.clone(),
            batch,
        );
        Fixture {
            _dir: dir,
            processor,
            groups,
            msgids,
            store,
            history,
        }
    }

    fn sample(id: &str, newsgroups: &[&str]) -> Article {
        let mut article = Article {
            message_id: id.to_string(),
            newsgroups: newsgroups.iter().map(|s| s.to_string()).collect(),
            subject: "a subject".to_string(),
            from: "alice <alice@example.org>".to_string(),
            date: "Mon, 01 Jan 2024 10:00:00 +0000".to_string(),
            ..Default::default()
        };
        article.body_lines = vec!["body".to_string()];
        article.bytes = 100;
        article.lines = 1;
        article.is_thread_root = true;
        article
    }

    #[tokio::test]
    async fn test_files_crossposted_article_to_all_groups() {
        let fx = fixture();
        let primary = fx.groups.intern("comp.lang.rust");
        let article = sample("<x1@example.org>", &["comp.lang.rust", "alt.test"]);

        let outcome = fx
            .processor
            .process_article(article, &primary, false)
            .await
            .unwrap();
        match outcome {
            ProcessOutcome::Filed(assignments) => {
                assert_eq!(assignments.len(), 2);
            }
            other => panic!("expected Filed, got {:?}", other),
        }

        let rust = fx.groups.intern("comp.lang.rust");
        let alt = fx.groups.intern("alt.test");
        assert!(fx.store.has_article(&rust, "<x1@example.org>").await);
        assert!(fx.store.has_article(&alt, "<x1@example.org>").await);
        fx.history.close().unwrap();
    }

    #[tokio::test]
    async fn test_second_copy_is_duplicate() {
        let fx = fixture();
        let primary = fx.groups.intern("comp.lang.rust");

        let first = fx
            .processor
            .process_article(sample("<dup@x>", &["comp.lang.rust"]), &primary, false)
            .await
            .unwrap();
        assert!(matches!(first, ProcessOutcome::Filed(_)));

        // Wait for the history commit so the record is Written.
        let record = fx.msgids.get_or_create("<dup@x>");
        record.wait_written(Duration::from_secs(5)).await;

        let second = fx
            .processor
            .process_article(sample("<dup@x>", &["comp.lang.rust"]), &primary, false)
            .await
            .unwrap();
        assert_eq!(second, ProcessOutcome::Duplicate);
        fx.history.close().unwrap();
    }

    #[tokio::test]
    async fn test_bulk_mode_files_primary_only() {
        let fx = fixture();
        let primary = fx.groups.intern("comp.lang.rust");
        let record = fx.msgids.get_or_create("<bulk@x>");
        {
            let mut state = record.lock();
            state.transition(MsgIdState::Locked);
        }

        let article = sample("<bulk@x>", &["comp.lang.rust", "alt.test"]);
        let outcome = fx
            .processor
            .process_article(article, &primary, true)
            .await
            .unwrap();
        match outcome {
            ProcessOutcome::Filed(assignments) => {
                assert_eq!(assignments.len(), 1);
                assert!(assignments[0].0.ptr_eq(&primary));
            }
            other => panic!("expected Filed, got {:?}", other),
        }
        let alt = fx.groups.intern("alt.test");
        assert!(!fx.store.has_article(&alt, "<bulk@x>").await);
        fx.history.close().unwrap();
    }

    #[tokio::test]
    async fn test_validation_rejects_are_permanent() {
        let fx = fixture();
        let primary = fx.groups.intern("comp.lang.rust");

        let mut article = sample("<bad@x>", &["comp.lang.rust"]);
        article.subject = String::new();
        let err = fx
            .processor
            .process_article(article, &primary, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Rejected("empty Subject")));

        // The id is now permanently rejected, even for a valid retry.
        let err = fx
            .processor
            .process_article(sample("<bad@x>", &["comp.lang.rust"]), &primary, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Rejected(_)));
        fx.history.close().unwrap();
    }

    #[tokio::test]
    async fn test_rejects_future_dated_article() {
        let fx = fixture();
        let primary = fx.groups.intern("comp.lang.rust");
        let mut article = sample("<future@x>", &["comp.lang.rust"]);
        let future = Utc::now() + chrono::Duration::hours(26);
        article.date = future.to_rfc2822();
        let err = fx
            .processor
            .process_article(article, &primary, false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProcessError::Rejected("Date too far in the future")
        ));
        fx.history.close().unwrap();
    }

    #[tokio::test]
    async fn test_rejects_excess_crossposts() {
        let fx = fixture();
        let primary = fx.groups.intern("g.0");
        let names: Vec<String> = (0..11).map(|i| format!("g.{}", i)).collect();
        let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        let err = fx
            .processor
            .process_article(sample("<many@x>", &refs), &primary, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Rejected("too many crossposts")));
        fx.history.close().unwrap();
    }

    #[tokio::test]
    async fn test_path_is_prefixed_with_local_hostname() {
        let fx = fixture();
        let primary = fx.groups.intern("comp.lang.rust");
        let mut article = sample("<path@x>", &["comp.lang.rust"]);
        article.path = "remote.example.net!origin".to_string();
        fx.processor
            .process_article(article, &primary, false)
            .await
            .unwrap();

        let num = fx.store.find_article(&primary, "<path@x>").await.unwrap();
        let stored = fx.store.get_article(&primary, num).await.unwrap();
        assert!(stored.path.starts_with("news.example.org!"));
        fx.history.close().unwrap();
    }
}
