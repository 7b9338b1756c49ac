//! Hash routing and the sharded offset index.
//!
//! The SHA-256 of a message-id is hex-encoded and its prefix routes the id
//! into the shard layout: the first two hex chars name the database byte,
//! the next two select one of 256 tables (`s00`..`sff`), and the following
//! `use_short_hash_len` chars form the per-table key. Sixteen sled database
//! files back the layout; the database byte's high nibble picks the file,
//! so distinct database bytes may share a file and the log re-read resolves
//! any resulting key collisions.
//!
//! A table row maps a key to a comma-separated list of log offsets.

use sha2::{Digest, Sha256};
use std::path::Path;

use crate::config::SHARD_DB_COUNT;

use super::HistoryError;

/// Lowercase-hex SHA-256 of a message-id.
pub fn hash_message_id(id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Where a hash lands in the shard layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardRoute {
    /// Database byte from the first two hex chars.
    pub db: u8,
    /// Table name, `s00`..`sff`, from the next two hex chars.
    pub table: String,
    /// Per-table key: the next `use_short_hash_len` hex chars.
    pub key: String,
}

impl ShardRoute {
    /// Route a full hex hash. `short_len` must already be validated into
    /// the 2..=7 range.
    pub fn for_hash(hash: &str, short_len: usize) -> ShardRoute {
        debug_assert!(hash.len() >= 4 + short_len);
        let db = u8::from_str_radix(&hash[0..2], 16).unwrap_or(0);
        ShardRoute {
            db,
            table: format!("s{}", &hash[2..4]),
            key: hash[4..4 + short_len].to_string(),
        }
    }

    /// Index of the database file holding this route.
    pub fn file_index(&self) -> usize {
        (self.db >> 4) as usize
    }
}

/// The on-disk offset index: 16 sled databases, 256 trees each.
pub struct ShardIndex {
    dbs: Vec<sled::Db>,
    short_len: usize,
}

impl ShardIndex {
    pub fn open(dir: &Path, short_len: usize) -> Result<Self, HistoryError> {
        let mut dbs = Vec::with_capacity(SHARD_DB_COUNT);
        for i in 0..SHARD_DB_COUNT {
            let path = dir.join(format!("hashdb-{:x}", i));
            let db = sled::open(&path).map_err(HistoryError::Index)?;
            dbs.push(db);
        }
        Ok(Self { dbs, short_len })
    }

    pub fn short_len(&self) -> usize {
        self.short_len
    }

    /// Route a message-id through its hash.
    pub fn route(&self, message_id: &str) -> ShardRoute {
        ShardRoute::for_hash(&hash_message_id(message_id), self.short_len)
    }

    fn tree(&self, route: &ShardRoute) -> Result<sled::Tree, HistoryError> {
        self.dbs[route.file_index()]
            .open_tree(route.table.as_bytes())
            .map_err(HistoryError::Index)
    }

    /// All candidate offsets recorded for this route's key.
    pub fn get_offsets(&self, route: &ShardRoute) -> Result<Vec<u64>, HistoryError> {
        let tree = self.tree(route)?;
        let Some(value) = tree.get(route.key.as_bytes()).map_err(HistoryError::Index)? else {
            return Ok(Vec::new());
        };
        let text = String::from_utf8_lossy(&value);
        Ok(text
            .split(',')
            .filter_map(|part| part.trim().parse().ok())
            .collect())
    }

    /// Append `offset` to the route's row, creating the row if absent.
    /// Returns true when the row already existed (a key collision or a
    /// repeated id reaching the writer twice).
    pub fn append_offset(&self, route: &ShardRoute, offset: u64) -> Result<bool, HistoryError> {
        let tree = self.tree(route)?;
        let mut existed = false;
        tree.update_and_fetch(route.key.as_bytes(), |current| {
            Some(match current {
                Some(existing) => {
                    existed = true;
                    let mut value = existing.to_vec();
                    value.push(b',');
                    value.extend_from_slice(offset.to_string().as_bytes());
                    value
                }
                None => offset.to_string().into_bytes(),
            })
        })
        .map_err(HistoryError::Index)?;
        Ok(existed)
    }

    /// Flush every database to disk.
    pub fn flush(&self) -> Result<(), HistoryError> {
        for db in &self.dbs {
            db.flush().map_err(HistoryError::Index)?;
        }
        Ok(())
    }
}
