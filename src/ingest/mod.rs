//! The per-group download pipeline.
//!
//! For each replicated group the pipeline runs an explicit sequence:
//! plan a window from the checkpoint, enumerate message-ids over a
//! streaming XHDR, claim and queue the unseen ones, let the fetcher pool
//! download them, and file each result through the article processor; the
//! checkpoint advances only after the window drains. A watchdog ticker
//! abandons a group after enough five-second windows pass without a single
//! success, duplicate or error.

pub mod batch;
pub mod fetch;
pub mod processor;

use chrono::DateTime;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

use crate::config::{
    IngestConfig, LIVENESS_TICK_MS, LIVENESS_WINDOW_SECS, MAX_DEAD_WINDOWS, MSGID_LOCK_TTL_SECS,
};
use crate::error::{Classify, ErrorClass};
use crate::group::GroupName;
use crate::msgid::{MsgIdCache, MsgIdState};
use crate::nntp::client::ClientError;
use crate::nntp::pool::{ConnPool, PoolError};
use crate::progress::{ProgressError, ProgressStore, PROGRESS_RESCAN};
use crate::store::GroupStore;

use self::batch::BatchScheduler;
use self::fetch::{FetchOutcome, WorkItem};
use self::processor::{ProcessError, ProcessOutcome, Processor};

/// Windows inspected when resuming by date before giving up and starting
/// from the low watermark.
const DATE_RESUME_MAX_WINDOWS: u64 = 64;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Progress(#[from] ProgressError),

    #[error("Group stalled: no progress for {windows} liveness windows")]
    Stalled { windows: u32 },

    #[error("Download cancelled by shutdown")]
    Cancelled,
}

impl Classify for IngestError {
    fn class(&self) -> ErrorClass {
        match self {
            IngestError::Pool(e) => e.class(),
            IngestError::Client(e) => e.class(),
            IngestError::Progress(e) => e.class(),
            IngestError::Stalled { .. } => ErrorClass::Transient,
            IngestError::Cancelled => ErrorClass::Transient,
        }
    }
}

/// Result of one `download_group` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Checkpoint already at the group's high watermark.
    UpToDate,
    /// At least one window ran.
    Completed {
        fetched: u64,
        duplicates: u64,
        errors: u64,
        checkpoint: i64,
    },
}

/// Per-window progress counters.
#[derive(Debug, Default)]
struct WindowCounters {
    fetched: u64,
    duplicates: u64,
    errors: u64,
}

/// The downloader: everything `download_group` needs, shared per provider.
pub struct Downloader {
    pub provider: String,
    pub pool: ConnPool,
    pub getq: async_channel::Sender<WorkItem>,
    pub msgids: Arc<MsgIdCache>,
    pub store: Arc<dyn GroupStore>,
    pub progress: Arc<dyn ProgressStore>,
    pub scheduler: Arc<BatchScheduler>,
    pub processor: Arc<Processor>,
    pub config: IngestConfig,
    /// Bounds concurrent group downloads across the process; one permit is
    /// held for the whole invocation.
    pub parallel: Arc<Semaphore>,
    pub shutdown: async_channel::Receiver<()>,
}

impl Downloader {
    /// Download up to `loops_per_group` windows for one group.
    #[tracing::instrument(name = "ingest.download_group", skip(self), fields(provider = %self.provider, %group))]
    pub async fn download_group(&self, group: &GroupName) -> Result<DownloadOutcome, IngestError> {
        let _slot = self
            .parallel
            .acquire()
            .await
            .map_err(|_| IngestError::Cancelled)?;

        let stats = self.pool.select_group(group.as_str()).await?;
        if stats.high == 0 {
            return Ok(DownloadOutcome::UpToDate);
        }

        let mut last_article = self.resume_point(group, stats.low, stats.high).await?;
        let mut totals = WindowCounters::default();
        let mut ran_any_window = false;

        for _ in 0..self.config.loops_per_group.max(1) {
            let start = (last_article + 1).max(stats.low as i64) as u64;
            let end = (start + self.config.max_batch - 1).min(stats.high);
            if start > stats.high {
                break;
            }
            ran_any_window = true;

            tracing::info!(start, end, high = stats.high, "Planning download window");
            let window = self.run_window(group, start, end).await?;
            totals.fetched += window.counters.fetched;
            totals.duplicates += window.counters.duplicates;
            totals.errors += window.counters.errors;

            let checkpoint = if window.enumeration_complete {
                end as i64
            } else {
                window.last_good as i64
            };
            self.progress
                .set_last_article(&self.provider, group.as_str(), checkpoint)
                .await?;
            last_article = checkpoint;

            // Breathe between windows so a hot group cannot monopolize the
            // provider pool.
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        if !ran_any_window {
            return Ok(DownloadOutcome::UpToDate);
        }
        Ok(DownloadOutcome::Completed {
            fetched: totals.fetched,
            duplicates: totals.duplicates,
            errors: totals.errors,
            checkpoint: last_article,
        })
    }

    /// Resolve the checkpoint sentinels into a "last article seen" value.
    async fn resume_point(
        &self,
        group: &GroupName,
        low: u64,
        high: u64,
    ) -> Result<i64, IngestError> {
        let checkpoint = self
            .progress
            .last_article(&self.provider, group.as_str())
            .await?;
        if checkpoint > 0 {
            return Ok(checkpoint);
        }
        if checkpoint == PROGRESS_RESCAN {
            tracing::info!(%group, low, "Forced rescan from low watermark");
            return Ok(low.saturating_sub(1) as i64);
        }

        // No provider progress: resume from the newest local article date
        // when the group store has one.
        let Some(date_str) = self.store.last_article_date(group).await else {
            return Ok(low.saturating_sub(1) as i64);
        };
        let Ok(local_last) = DateTime::parse_from_rfc2822(date_str.trim()) else {
            return Ok(low.saturating_sub(1) as i64);
        };

        match self.find_resume_by_date(group, low, high, local_last).await {
            Ok(resume) => Ok(resume),
            Err(e) => {
                tracing::warn!(%group, error = %e, "Date resume failed, starting from low watermark");
                Ok(low.saturating_sub(1) as i64)
            }
        }
    }

    /// Walk windows backward from the high watermark until upstream dates
    /// fall at or before our newest local article, and resume there.
    async fn find_resume_by_date(
        &self,
        group: &GroupName,
        low: u64,
        high: u64,
        local_last: DateTime<chrono::FixedOffset>,
    ) -> Result<i64, IngestError> {
        let mut conn = self.pool.get().await?;
        let mut wend = high;
        for _ in 0..DATE_RESUME_MAX_WINDOWS {
            let wstart = wend.saturating_sub(self.config.max_batch - 1).max(low);
            let dates = match conn.xhdr("Date", wstart, wend, false).await {
                Ok(dates) => dates,
                Err(e) => {
                    conn.discard();
                    return Err(e.into());
                }
            };
            let mut best: Option<u64> = None;
            for (num, value) in &dates {
                if let Ok(date) = DateTime::parse_from_rfc2822(value.trim()) {
                    if date <= local_last {
                        best = Some(best.map_or(*num, |b| b.max(*num)));
                    }
                }
            }
            if let Some(resume) = best {
                tracing::debug!(%group, resume, "Resuming by date");
                return Ok(resume as i64);
            }
            if wstart <= low {
                break;
            }
            wend = wstart - 1;
        }
        Ok(low.saturating_sub(1) as i64)
    }

    /// One window: enumerate, claim, fetch, file.
    async fn run_window(
        &self,
        group: &GroupName,
        start: u64,
        end: u64,
    ) -> Result<WindowResult, IngestError> {
        let window_size = (end - start + 1) as usize;
        let (ids_tx, ids_rx) = async_channel::bounded::<(u64, String)>(window_size.max(1));
        let (reply_tx, reply_rx) = async_channel::bounded::<FetchOutcome>(window_size.max(1));

        // The enumerator owns a pooled connection for the streamed XHDR
        // and hands it back through the join handle.
        let mut enum_conn = self.pool.get().await?;
        let enum_group = group.clone();
        let enum_handle = tokio::spawn(async move {
            let result = enum_conn
                .xhdr_streamed("Message-ID", start, end, ids_tx)
                .await;
            if result.is_err() {
                enum_conn.discard();
            }
            tracing::debug!(group = %enum_group, ?result, "Enumeration finished");
            result
        });

        let batch_tx = self.scheduler.get_or_create(group, self.getq.clone());

        let mut counters = WindowCounters::default();
        let mut expected: u64 = 0;
        let mut completed: u64 = 0;
        let mut last_good: u64 = start.saturating_sub(1);
        let mut enumeration_open = true;
        let mut last_progress = Instant::now();
        let mut dead_windows: u32 = 0;
        let mut ticker = tokio::time::interval(Duration::from_millis(LIVENESS_TICK_MS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let reply_for_items = reply_tx.clone();
        drop(reply_tx);

        loop {
            if !enumeration_open && completed >= expected {
                break;
            }
            tokio::select! {
                id = ids_rx.recv(), if enumeration_open => {
                    match id {
                        Ok((num, message_id)) => {
                            last_good = last_good.max(num);
                            if self.claim_for_fetch(group, &message_id).await {
                                let item = WorkItem {
                                    record: self.msgids.get_or_create(&message_id),
                                    group: group.clone(),
                                    reply: reply_for_items.clone(),
                                };
                                if batch_tx.send(item).await.is_err() {
                                    return Err(IngestError::Cancelled);
                                }
                                expected += 1;
                            } else {
                                counters.duplicates += 1;
                                last_progress = Instant::now();
                            }
                        }
                        Err(_) => {
                            enumeration_open = false;
                        }
                    }
                }
                outcome = reply_rx.recv() => {
                    let Ok(outcome) = outcome else {
                        enumeration_open = false;
                        continue;
                    };
                    completed += 1;
                    last_progress = Instant::now();
                    self.assimilate(group, outcome, &mut counters).await;
                }
                _ = ticker.tick() => {
                    if last_progress.elapsed() >= Duration::from_secs(LIVENESS_WINDOW_SECS) {
                        dead_windows += 1;
                        last_progress = Instant::now();
                        tracing::warn!(%group, dead_windows, "Liveness window expired without progress");
                        if dead_windows >= MAX_DEAD_WINDOWS {
                            return Err(IngestError::Stalled { windows: dead_windows });
                        }
                    }
                }
                _ = self.shutdown.recv() => {
                    return Err(IngestError::Cancelled);
                }
            }
        }

        let enumeration_complete = match enum_handle.await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::warn!(%group, error = %e, "Enumeration failed partway");
                false
            }
            Err(_) => false,
        };

        Ok(WindowResult {
            counters,
            enumeration_complete,
            last_good,
        })
    }

    /// Claim an id for download. Skips ids the group store already has and
    /// ids another worker owns.
    async fn claim_for_fetch(&self, group: &GroupName, message_id: &str) -> bool {
        if self.store.has_article(group, message_id).await {
            return false;
        }
        let record = self.msgids.get_or_create(message_id);
        let mut state = record.lock();
        match state.state {
            MsgIdState::Fresh | MsgIdState::Retry => {
                state.transition(MsgIdState::Locked);
                state.expires = Instant::now() + Duration::from_secs(MSGID_LOCK_TTL_SECS);
                true
            }
            _ => false,
        }
    }

    /// Hand one fetched article to the processor and account for it.
    async fn assimilate(
        &self,
        group: &GroupName,
        outcome: FetchOutcome,
        counters: &mut WindowCounters,
    ) {
        match outcome.result {
            Ok(article) => {
                match self.processor.process_article(article, group, true).await {
                    Ok(ProcessOutcome::Filed(_)) => counters.fetched += 1,
                    Ok(ProcessOutcome::Duplicate) => counters.duplicates += 1,
                    Err(ProcessError::Rejected(reason)) => {
                        tracing::debug!(%group, reason, "Fetched article rejected");
                        counters.errors += 1;
                    }
                    Err(e) => {
                        tracing::warn!(%group, error = %e, "Failed to file fetched article");
                        counters.errors += 1;
                    }
                }
            }
            Err(PoolError::Client(
                ClientError::ArticleNotFound | ClientError::ArticleRemoved,
            )) => {
                // Expected negatives: release the claim so a later pass can
                // retry if the article reappears.
                let mut state = outcome.record.lock();
                state.transition(MsgIdState::Retry);
                counters.duplicates += 1;
            }
            Err(e) => {
                tracing::debug!(%group, error = %e, "Fetch failed");
                let mut state = outcome.record.lock();
                state.transition(MsgIdState::Retry);
                counters.errors += 1;
            }
        }
    }
}

struct WindowResult {
    counters: WindowCounters,
    enumeration_complete: bool,
    last_good: u64,
}
