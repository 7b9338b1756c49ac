//! Active file parsing and merging.
//!
//! The active file is the upstream listing of known groups with watermarks,
//! one record per line: `<group> <high> <low> <status>`. Merging folds
//! secondary files into a primary: the primary wins on duplicates,
//! secondaries only contribute groups the primary does not have. Merge is
//! idempotent.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};

use crate::group::GroupStatus;

/// One active-file record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveEntry {
    pub group: String,
    pub high: u64,
    pub low: u64,
    pub status: GroupStatus,
    /// Alias target for `=group` statuses.
    pub alias: Option<String>,
}

impl ActiveEntry {
    /// Parse one whitespace-delimited line. Returns `None` for blank lines,
    /// comments, and records that do not follow the format.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let mut fields = line.split_whitespace();
        let group = fields.next()?.to_string();
        let high = fields.next()?.parse().ok()?;
        let low = fields.next()?.parse().ok()?;
        let status_field = fields.next()?;
        let status_char = status_field.chars().next()?;
        let status = GroupStatus::from_char(status_char)?;
        let alias = if status == GroupStatus::Aliased {
            Some(status_field[1..].to_string())
        } else {
            None
        };
        Some(Self {
            group,
            high,
            low,
            status,
            alias,
        })
    }

    pub fn to_line(&self) -> String {
        let status = match (&self.status, &self.alias) {
            (GroupStatus::Aliased, Some(target)) => format!("={}", target),
            _ => self.status.as_char().to_string(),
        };
        format!("{} {} {} {}", self.group, self.high, self.low, status)
    }
}

/// A parsed active file, preserving first-seen order for rendering.
#[derive(Debug, Clone, Default)]
pub struct ActiveFile {
    order: Vec<String>,
    entries: HashMap<String, ActiveEntry>,
}

impl ActiveFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an active file from a reader, skipping malformed lines.
    pub fn read<R: Read>(reader: R) -> std::io::Result<Self> {
        let mut active = Self::new();
        for line in BufReader::new(reader).lines() {
            let line = line?;
            if let Some(entry) = ActiveEntry::parse(&line) {
                active.insert(entry);
            }
        }
        Ok(active)
    }

    /// Insert or replace an entry.
    pub fn insert(&mut self, entry: ActiveEntry) {
        if !self.entries.contains_key(&entry.group) {
            self.order.push(entry.group.clone());
        }
        self.entries.insert(entry.group.clone(), entry);
    }

    pub fn get(&self, group: &str) -> Option<&ActiveEntry> {
        self.entries.get(group)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActiveEntry> {
        self.order.iter().filter_map(|g| self.entries.get(g))
    }

    /// Fold a secondary file into this one. Existing groups keep their
    /// record; new groups are appended in the secondary's order.
    pub fn merge(&mut self, secondary: &ActiveFile) {
        for entry in secondary.iter() {
            if !self.entries.contains_key(&entry.group) {
                self.insert(entry.clone());
            }
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in self.iter() {
            out.push_str(&entry.to_line());
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_from(text: &str) -> ActiveFile {
        ActiveFile::read(text.as_bytes()).unwrap()
    }

    #[test]
    fn test_parse_entry_forms() {
        let entry = ActiveEntry::parse("comp.lang.rust 1500 100 y").unwrap();
        assert_eq!(entry.group, "comp.lang.rust");
        assert_eq!(entry.high, 1500);
        assert_eq!(entry.low, 100);
        assert_eq!(entry.status, GroupStatus::Posting);
        assert!(entry.alias.is_none());

        let entry = ActiveEntry::parse("alt.old 10 1 =alt.new").unwrap();
        assert_eq!(entry.status, GroupStatus::Aliased);
        assert_eq!(entry.alias.as_deref(), Some("alt.new"));
    }

    #[test]
    fn test_parse_skips_malformed() {
        assert!(ActiveEntry::parse("").is_none());
        assert!(ActiveEntry::parse("# comment").is_none());
        assert!(ActiveEntry::parse("group only").is_none());
        assert!(ActiveEntry::parse("group x y z").is_none());
        assert!(ActiveEntry::parse("group 5 1 q").is_none());
    }

    #[test]
    fn test_entry_line_round_trip() {
        for line in ["comp.lang.rust 1500 100 y", "alt.old 10 1 =alt.new"] {
            let entry = ActiveEntry::parse(line).unwrap();
            assert_eq!(entry.to_line(), line);
        }
    }

    #[test]
    fn test_merge_primary_wins() {
        let mut primary = active_from("comp.a 100 1 y\ncomp.b 200 1 y\n");
        let secondary = active_from("comp.b 999 50 m\ncomp.c 300 1 y\n");
        primary.merge(&secondary);

        // comp.b keeps the primary record
        assert_eq!(primary.get("comp.b").unwrap().high, 200);
        // comp.c was added from the secondary
        assert_eq!(primary.get("comp.c").unwrap().high, 300);
        assert_eq!(primary.len(), 3);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut merged = active_from("comp.a 100 1 y\n");
        let secondary = active_from("comp.b 200 1 y\ncomp.a 999 1 n\n");
        merged.merge(&secondary);
        let once = merged.render();
        merged.merge(&secondary);
        assert_eq!(merged.render(), once);
    }

    #[test]
    fn test_render_preserves_order() {
        let active = active_from("z.last 1 1 y\na.first 2 1 y\n");
        let rendered = active.render();
        let z = rendered.find("z.last").unwrap();
        let a = rendered.find("a.first").unwrap();
        assert!(z < a);
    }
}
