//! The append-only history log.
//!
//! One tab-delimited line per entry:
//! `<messageId>\t<flagsHex>\t<group>:<articleNum>\t<unixSeconds>\n`.
//! The line's file offset is the primary value; the shard index maps hash
//! prefixes back to offsets and readers re-read the log at an offset to
//! confirm identity. The log is never rewritten. A fixed header line
//! occupies offset 0, so 0 can serve as the "offset unknown" sentinel.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::Path;

use super::HistoryError;

/// Header written to a fresh log so no entry ever lands at offset 0.
const LOG_HEADER: &str = "#history v1\n";

/// Flags byte: nothing special about this entry.
pub const FLAG_NONE: u8 = 0;

/// One committed history line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub message_id: String,
    pub flags: u8,
    /// `group:articleNumber` locator, empty if the article was not filed.
    pub storage_token: String,
    pub timestamp: i64,
}

impl HistoryEntry {
    pub fn to_line(&self) -> String {
        format!(
            "{}\t{:02x}\t{}\t{}\n",
            self.message_id, self.flags, self.storage_token, self.timestamp
        )
    }

    pub fn parse(line: &str) -> Option<Self> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let mut fields = line.split('\t');
        let message_id = fields.next()?.to_string();
        let flags = u8::from_str_radix(fields.next()?, 16).ok()?;
        let storage_token = fields.next()?.to_string();
        let timestamp = fields.next()?.parse().ok()?;
        Some(Self {
            message_id,
            flags,
            storage_token,
            timestamp,
        })
    }
}

/// Append and read handles over one `history.dat` file.
///
/// The writer side is exclusive to the history writer thread; reads go
/// through an independent handle so lookups never contend with appends.
pub struct HistoryLog {
    append: Mutex<File>,
    read: Mutex<File>,
}

impl HistoryLog {
    pub fn open(path: &Path) -> Result<Self, HistoryError> {
        let mut append = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(HistoryError::LogIo)?;
        if append.metadata().map_err(HistoryError::LogIo)?.len() == 0 {
            append
                .write_all(LOG_HEADER.as_bytes())
                .map_err(HistoryError::LogIo)?;
            append.flush().map_err(HistoryError::LogIo)?;
        }
        let read = File::open(path).map_err(HistoryError::LogIo)?;
        Ok(Self {
            append: Mutex::new(append),
            read: Mutex::new(read),
        })
    }

    /// Append one entry, returning the offset its line starts at.
    pub fn append(&self, entry: &HistoryEntry) -> Result<u64, HistoryError> {
        let mut file = self.append.lock();
        let offset = file
            .seek(SeekFrom::End(0))
            .map_err(HistoryError::LogIo)?;
        file.write_all(entry.to_line().as_bytes())
            .map_err(HistoryError::LogIo)?;
        Ok(offset)
    }

    /// Flush appended data to the OS and disk.
    pub fn sync(&self) -> Result<(), HistoryError> {
        let file = self.append.lock();
        file.sync_data().map_err(HistoryError::LogIo)
    }

    /// Current log length; every valid entry offset is strictly below it.
    pub fn len(&self) -> Result<u64, HistoryError> {
        let file = self.append.lock();
        Ok(file.metadata().map_err(HistoryError::LogIo)?.len())
    }

    /// Re-read the single line starting at `offset`.
    pub fn read_at(&self, offset: u64) -> Result<HistoryEntry, HistoryError> {
        let mut file = self.read.lock();
        file.seek(SeekFrom::Start(offset))
            .map_err(HistoryError::LogIo)?;
        let mut reader = BufReader::new(&mut *file);
        let mut line = String::new();
        reader.read_line(&mut line).map_err(HistoryError::LogIo)?;
        HistoryEntry::parse(&line).ok_or(HistoryError::CorruptEntry { offset })
    }
}
