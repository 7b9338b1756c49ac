//! The group store interface.
//!
//! Per-group relational storage (articles, overviews, threads) is an
//! external collaborator; the engine only depends on the operations below.
//! `MemGroupStore` is the in-memory reference implementation used by the
//! server wiring and the test suites. It honors the numbering contract the
//! engine relies on: per-group article numbers are assigned monotonically
//! and never change once assigned.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::article::{Article, OverviewRow};
use crate::error::{Classify, ErrorClass};
use crate::group::{GroupName, Newsgroup};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("No such group: {0}")]
    NoSuchGroup(String),

    #[error("No such article")]
    NoSuchArticle,

    #[error("Group store I/O error: {0}")]
    Io(String),
}

impl Classify for StoreError {
    fn class(&self) -> ErrorClass {
        match self {
            StoreError::NoSuchGroup(_) | StoreError::NoSuchArticle => ErrorClass::NotFound,
            StoreError::Io(_) => ErrorClass::Transient,
        }
    }
}

/// Operations the engine needs from per-group storage.
#[async_trait]
pub trait GroupStore: Send + Sync {
    /// Watermarks and status for one group.
    async fn get_group(&self, group: &GroupName) -> Option<Newsgroup>;

    /// Every group the store carries.
    async fn list_groups(&self) -> Vec<Newsgroup>;

    /// Create the group if it does not exist yet.
    async fn ensure_group(&self, group: &GroupName) -> Result<(), StoreError>;

    /// Is this message-id already filed in this group?
    async fn has_article(&self, group: &GroupName, message_id: &str) -> bool;

    /// Fetch by number.
    async fn get_article(&self, group: &GroupName, number: u64)
        -> Result<Arc<Article>, StoreError>;

    /// Resolve a message-id to its number within a group.
    async fn find_article(&self, group: &GroupName, message_id: &str) -> Option<u64>;

    /// File an article, assigning the next article number. The returned
    /// number is strictly greater than every number assigned before it in
    /// this group.
    async fn file_article(
        &self,
        group: &GroupName,
        article: Arc<Article>,
    ) -> Result<u64, StoreError>;

    /// Commit a batch of overview rows captured by the batch scheduler.
    async fn commit_overview(
        &self,
        group: &GroupName,
        rows: Vec<OverviewRow>,
    ) -> Result<(), StoreError>;

    /// Overview rows for an inclusive number range.
    async fn overview_range(
        &self,
        group: &GroupName,
        start: u64,
        end: u64,
    ) -> Result<Vec<OverviewRow>, StoreError>;

    /// One header's values over an inclusive number range.
    async fn header_range(
        &self,
        group: &GroupName,
        field: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<(u64, String)>, StoreError>;

    /// Article numbers present in an inclusive range.
    async fn article_numbers(
        &self,
        group: &GroupName,
        start: u64,
        end: u64,
    ) -> Result<Vec<u64>, StoreError>;

    /// Date header of the newest article, used for date-based resume when
    /// no checkpoint exists.
    async fn last_article_date(&self, group: &GroupName) -> Option<String>;
}

#[derive(Debug)]
struct GroupData {
    info: Newsgroup,
    articles: BTreeMap<u64, Arc<Article>>,
    by_id: HashMap<String, u64>,
    overview: BTreeMap<u64, OverviewRow>,
    next_number: u64,
}

impl GroupData {
    fn new(group: GroupName) -> Self {
        Self {
            info: Newsgroup::new(group),
            articles: BTreeMap::new(),
            by_id: HashMap::new(),
            overview: BTreeMap::new(),
            next_number: 1,
        }
    }
}

/// In-memory group store.
#[derive(Default)]
pub struct MemGroupStore {
    groups: RwLock<HashMap<GroupName, Arc<RwLock<GroupData>>>>,
}

impl MemGroupStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn group_data(&self, group: &GroupName) -> Option<Arc<RwLock<GroupData>>> {
        self.groups.read().get(group).cloned()
    }

    fn group_data_or_create(&self, group: &GroupName) -> Arc<RwLock<GroupData>> {
        if let Some(data) = self.group_data(group) {
            return data;
        }
        let mut groups = self.groups.write();
        groups
            .entry(group.clone())
            .or_insert_with(|| Arc::new(RwLock::new(GroupData::new(group.clone()))))
            .clone()
    }

    /// Seed a group's watermarks directly; test and import plumbing.
    pub fn seed_group(&self, group: &GroupName, low: u64, high: u64) {
        let data = self.group_data_or_create(group);
        let mut data = data.write();
        data.info.low = low;
        data.info.high = high;
        data.next_number = high + 1;
    }
}

#[async_trait]
impl GroupStore for MemGroupStore {
    async fn get_group(&self, group: &GroupName) -> Option<Newsgroup> {
        self.group_data(group).map(|data| data.read().info.clone())
    }

    async fn list_groups(&self) -> Vec<Newsgroup> {
        let groups: Vec<_> = self.groups.read().values().cloned().collect();
        let mut out: Vec<_> = groups.iter().map(|d| d.read().info.clone()).collect();
        out.sort_by(|a, b| a.name.as_str().cmp(b.name.as_str()));
        out
    }

    async fn ensure_group(&self, group: &GroupName) -> Result<(), StoreError> {
        self.group_data_or_create(group);
        Ok(())
    }

    async fn has_article(&self, group: &GroupName, message_id: &str) -> bool {
        self.group_data(group)
            .map(|data| data.read().by_id.contains_key(message_id))
            .unwrap_or(false)
    }

    async fn get_article(
        &self,
        group: &GroupName,
        number: u64,
    ) -> Result<Arc<Article>, StoreError> {
        let data = self
            .group_data(group)
            .ok_or_else(|| StoreError::NoSuchGroup(group.to_string()))?;
        let data = data.read();
        data.articles
            .get(&number)
            .cloned()
            .ok_or(StoreError::NoSuchArticle)
    }

    async fn find_article(&self, group: &GroupName, message_id: &str) -> Option<u64> {
        self.group_data(group)
            .and_then(|data| data.read().by_id.get(message_id).copied())
    }

    async fn file_article(
        &self,
        group: &GroupName,
        article: Arc<Article>,
    ) -> Result<u64, StoreError> {
        let data = self.group_data_or_create(group);
        let mut data = data.write();
        let number = data.next_number;
        data.next_number += 1;

        data.by_id.insert(article.message_id.clone(), number);
        data.overview
            .insert(number, OverviewRow::from_article(number, &article));
        data.articles.insert(number, article);

        if data.info.low == 0 {
            data.info.low = number;
        }
        data.info.high = number;
        data.info.count = data.articles.len() as u64;
        Ok(number)
    }

    async fn commit_overview(
        &self,
        group: &GroupName,
        rows: Vec<OverviewRow>,
    ) -> Result<(), StoreError> {
        let data = self.group_data_or_create(group);
        let mut data = data.write();
        for row in rows {
            data.overview.insert(row.num, row);
        }
        Ok(())
    }

    async fn overview_range(
        &self,
        group: &GroupName,
        start: u64,
        end: u64,
    ) -> Result<Vec<OverviewRow>, StoreError> {
        let data = self
            .group_data(group)
            .ok_or_else(|| StoreError::NoSuchGroup(group.to_string()))?;
        if start > end {
            return Ok(Vec::new());
        }
        let data = data.read();
        Ok(data
            .overview
            .range(start..=end)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn header_range(
        &self,
        group: &GroupName,
        field: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<(u64, String)>, StoreError> {
        let data = self
            .group_data(group)
            .ok_or_else(|| StoreError::NoSuchGroup(group.to_string()))?;
        if start > end {
            return Ok(Vec::new());
        }
        let data = data.read();
        let field = field.to_ascii_lowercase();
        let mut out = Vec::new();
        for (num, article) in data.articles.range(start..=end) {
            let value = match field.as_str() {
                "subject" => Some(article.subject.clone()),
                "from" => Some(article.from.clone()),
                "date" => Some(article.date.clone()),
                "message-id" => Some(article.message_id.clone()),
                "references" => Some(article.references.clone()),
                "lines" => Some(article.lines.to_string()),
                "bytes" => Some(article.bytes.to_string()),
                other => article.header(other).map(|v| v.to_string()),
            };
            if let Some(value) = value {
                out.push((*num, value));
            }
        }
        Ok(out)
    }

    async fn article_numbers(
        &self,
        group: &GroupName,
        start: u64,
        end: u64,
    ) -> Result<Vec<u64>, StoreError> {
        let data = self
            .group_data(group)
            .ok_or_else(|| StoreError::NoSuchGroup(group.to_string()))?;
        if start > end {
            return Ok(Vec::new());
        }
        let data = data.read();
        Ok(data.articles.range(start..=end).map(|(n, _)| *n).collect())
    }

    async fn last_article_date(&self, group: &GroupName) -> Option<String> {
        let data = self.group_data(group)?;
        let data = data.read();
        data.articles
            .values()
            .next_back()
            .map(|article| article.date.clone())
    }
}
