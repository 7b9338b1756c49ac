//! Interned newsgroup names and watermark records.
//!
//! Group names are interned once per process: every component holds the same
//! `GroupName` for a given group, so pointer equality is group identity and
//! per-group maps can key on the interned value without re-hashing long
//! name strings across the ingest path.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// An interned newsgroup name.
///
/// Obtained only through [`GroupRegistry::intern`]; two `GroupName`s for the
/// same group name always share the same allocation for the process
/// lifetime.
#[derive(Clone)]
pub struct GroupName(Arc<str>);

impl GroupName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Identity comparison. For interned names this is equivalent to string
    /// equality and O(1).
    pub fn ptr_eq(&self, other: &GroupName) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for GroupName {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0 == other.0
    }
}

impl Eq for GroupName {}

impl Hash for GroupName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state)
    }
}

impl fmt::Display for GroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for GroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupName({})", self.0)
    }
}

/// Process-wide group name interner.
#[derive(Default)]
pub struct GroupRegistry {
    names: RwLock<HashMap<String, GroupName>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the canonical `GroupName` for `name`, creating it on first
    /// mention.
    pub fn intern(&self, name: &str) -> GroupName {
        if let Some(existing) = self.names.read().get(name) {
            return existing.clone();
        }
        let mut names = self.names.write();
        // Double-checked: another thread may have interned between locks.
        if let Some(existing) = names.get(name) {
            return existing.clone();
        }
        let interned = GroupName(Arc::from(name));
        names.insert(name.to_string(), interned.clone());
        interned
    }

    /// Look up without interning. Used where a miss means "unknown group".
    pub fn get(&self, name: &str) -> Option<GroupName> {
        self.names.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.names.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.read().is_empty()
    }
}

/// Moderation / posting status of a group, the single status char of the
/// active file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    /// `y` - posting permitted
    Posting,
    /// `n` - no local posting
    NoPosting,
    /// `m` - moderated
    Moderated,
    /// `j` - articles filed to junk
    Junked,
    /// `x` - no posting, articles not filed
    Disabled,
    /// `=group` - articles filed under another group
    Aliased,
}

impl GroupStatus {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'y' => Some(GroupStatus::Posting),
            'n' => Some(GroupStatus::NoPosting),
            'm' => Some(GroupStatus::Moderated),
            'j' => Some(GroupStatus::Junked),
            'x' => Some(GroupStatus::Disabled),
            '=' => Some(GroupStatus::Aliased),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            GroupStatus::Posting => 'y',
            GroupStatus::NoPosting => 'n',
            GroupStatus::Moderated => 'm',
            GroupStatus::Junked => 'j',
            GroupStatus::Disabled => 'x',
            GroupStatus::Aliased => '=',
        }
    }
}

/// A newsgroup with its current watermarks, as held by the group store and
/// reported by GROUP/LIST.
#[derive(Debug, Clone)]
pub struct Newsgroup {
    pub name: GroupName,
    pub active: bool,
    /// Largest article number present
    pub high: u64,
    /// Smallest article number present
    pub low: u64,
    /// Articles currently present
    pub count: u64,
    pub status: GroupStatus,
}

impl Newsgroup {
    pub fn new(name: GroupName) -> Self {
        Self {
            name,
            active: true,
            high: 0,
            low: 0,
            count: 0,
            status: GroupStatus::Posting,
        }
    }
}
