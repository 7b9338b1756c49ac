//! Progress checkpoints: the per-(provider, group) "last article seen"
//! cursor.
//!
//! Opaque key/value contract with two sentinels: `0` means no provider
//! progress exists (callers fall back to date-based resume), `-1` requests
//! a user-forced rescan from the group's low watermark. Updates are
//! single-key and atomic.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;

use crate::error::{Classify, ErrorClass};

/// Sentinel: no provider progress recorded.
pub const PROGRESS_NONE: i64 = 0;

/// Sentinel: user forced a date-rescan from the low watermark.
pub const PROGRESS_RESCAN: i64 = -1;

#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    #[error("Progress store error: {0}")]
    Backend(String),
}

impl Classify for ProgressError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Transient
    }
}

/// The checkpoint contract.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Last article seen for `(provider, group)`, or a sentinel.
    async fn last_article(&self, provider: &str, group: &str) -> Result<i64, ProgressError>;

    /// Atomically replace the cursor.
    async fn set_last_article(
        &self,
        provider: &str,
        group: &str,
        value: i64,
    ) -> Result<(), ProgressError>;
}

fn key(provider: &str, group: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(provider.len() + group.len() + 1);
    key.extend_from_slice(provider.as_bytes());
    key.push(0);
    key.extend_from_slice(group.as_bytes());
    key
}

/// Sled-backed checkpoints.
pub struct SledProgress {
    db: sled::Db,
}

impl SledProgress {
    pub fn open(path: &Path) -> Result<Self, ProgressError> {
        let db = sled::open(path).map_err(|e| ProgressError::Backend(e.to_string()))?;
        Ok(Self { db })
    }

    pub fn flush(&self) -> Result<(), ProgressError> {
        self.db
            .flush()
            .map(|_| ())
            .map_err(|e| ProgressError::Backend(e.to_string()))
    }
}

#[async_trait]
impl ProgressStore for SledProgress {
    async fn last_article(&self, provider: &str, group: &str) -> Result<i64, ProgressError> {
        let value = self
            .db
            .get(key(provider, group))
            .map_err(|e| ProgressError::Backend(e.to_string()))?;
        Ok(match value {
            Some(raw) if raw.len() == 8 => {
                i64::from_be_bytes(raw.as_ref().try_into().unwrap_or([0; 8]))
            }
            _ => PROGRESS_NONE,
        })
    }

    async fn set_last_article(
        &self,
        provider: &str,
        group: &str,
        value: i64,
    ) -> Result<(), ProgressError> {
        self.db
            .insert(key(provider, group), &value.to_be_bytes())
            .map_err(|e| ProgressError::Backend(e.to_string()))?;
        Ok(())
    }
}

/// In-memory checkpoints for tests and dry runs.
#[derive(Default)]
pub struct MemProgress {
    map: RwLock<HashMap<(String, String), i64>>,
}

impl MemProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressStore for MemProgress {
    async fn last_article(&self, provider: &str, group: &str) -> Result<i64, ProgressError> {
        Ok(self
            .map
            .read()
            .get(&(provider.to_string(), group.to_string()))
            .copied()
            .unwrap_or(PROGRESS_NONE))
    }

    async fn set_last_article(
        &self,
        provider: &str,
        group: &str,
        value: i64,
    ) -> Result<(), ProgressError> {
        self.map
            .write()
            .insert((provider.to_string(), group.to_string()), value);
        Ok(())
    }
}
