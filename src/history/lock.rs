//! History lock file.
//!
//! Records the `use_short_hash_len` and shard mode chosen at first
//! initialization. The values are immutable for the lifetime of the
//! history directory: reopening with a different requested length logs a
//! warning and keeps the locked value; a different shard mode is a fatal
//! mismatch (re-hashing into a new directory is the only migration path).

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::HistoryError;

/// The only shard layout this engine writes.
pub const SHARD_MODE: &str = "Shard16x256";

#[derive(Debug, Serialize, Deserialize)]
struct LockFileContents {
    use_short_hash_len: usize,
    shard_mode: String,
}

/// Create the lock file on first initialization or verify it on reopen.
/// Returns the effective `use_short_hash_len`.
pub fn acquire(path: &Path, requested: usize) -> Result<usize, HistoryError> {
    if path.exists() {
        let raw = std::fs::read_to_string(path).map_err(HistoryError::LogIo)?;
        let contents: LockFileContents =
            serde_json::from_str(&raw).map_err(|e| HistoryError::LockFile(e.to_string()))?;
        if contents.shard_mode != SHARD_MODE {
            return Err(HistoryError::LockFile(format!(
                "shard mode mismatch: locked {}, this build writes {}",
                contents.shard_mode, SHARD_MODE
            )));
        }
        if contents.use_short_hash_len != requested {
            tracing::warn!(
                locked = contents.use_short_hash_len,
                requested,
                "use_short_hash_len is locked; keeping the locked value"
            );
        }
        return Ok(contents.use_short_hash_len);
    }

    let contents = LockFileContents {
        use_short_hash_len: requested,
        shard_mode: SHARD_MODE.to_string(),
    };
    let raw = serde_json::to_string_pretty(&contents)
        .map_err(|e| HistoryError::LockFile(e.to_string()))?;
    std::fs::write(path, raw).map_err(HistoryError::LogIo)?;
    Ok(requested)
}
