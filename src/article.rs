//! Transient article model and per-article wire formats.
//!
//! An `Article` is the parsed form of one message as it moves through the
//! ingest path: promoted headers, the raw line sequences kept for
//! retransmission, and derived threading fields. This module also owns the
//! TAB-delimited overview row format used by XOVER and the group store, and
//! the `N` / `N-` / `N-M` range syntax shared by XOVER, XHDR and LISTGROUP.

use chrono::{DateTime, FixedOffset, Utc};
use std::collections::HashMap;

use crate::config::{MSGID_MAX_LEN, MSGID_MIN_LEN};

/// A parsed article in flight.
///
/// Raw header and body lines are kept verbatim (minus dot-stuffing) so the
/// article can be re-served byte-identically; promoted fields are
/// convenience copies of the headers the engine routes on.
#[derive(Debug, Clone, Default)]
pub struct Article {
    pub message_id: String,
    /// Group names from the Newsgroups header, split on comma, trimmed.
    pub newsgroups: Vec<String>,
    /// All headers, keyed by lowercase name. Values keep original case.
    /// Folded continuation lines are joined with a single space.
    pub headers: HashMap<String, Vec<String>>,
    /// Raw header lines as received (continuations unfolded into the map
    /// but preserved here).
    pub head_lines: Vec<String>,
    /// Raw body lines, dot-unstuffed.
    pub body_lines: Vec<String>,
    /// Total size in bytes as received (CRLF included).
    pub bytes: u64,
    /// Body line count.
    pub lines: u64,
    pub subject: String,
    pub from: String,
    pub references: String,
    pub path: String,
    pub date: String,
    /// No References header: this article starts a thread.
    pub is_thread_root: bool,
    pub is_reply: bool,
}

impl Article {
    /// First header value for `name` (case-insensitive), if present.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .and_then(|v| v.first())
            .map(|s| s.as_str())
    }

    /// Recompute promoted fields and derived flags from the header map.
    /// Called once by the wire reader after all headers are in.
    pub fn promote_headers(&mut self) {
        if let Some(v) = self.header("message-id") {
            self.message_id = v.trim().to_string();
        }
        if let Some(v) = self.header("subject") {
            self.subject = v.to_string();
        }
        if let Some(v) = self.header("from") {
            self.from = v.to_string();
        }
        if let Some(v) = self.header("references") {
            self.references = v.to_string();
        }
        if let Some(v) = self.header("path") {
            self.path = v.to_string();
        }
        if let Some(v) = self.header("date") {
            self.date = v.to_string();
        }
        if let Some(v) = self.header("newsgroups") {
            self.newsgroups = v
                .split(',')
                .map(|g| g.trim().to_string())
                .filter(|g| !g.is_empty())
                .collect();
        }
        self.is_reply = !self.references.trim().is_empty();
        self.is_thread_root = !self.is_reply;
    }

    /// Parsed Date header, if it parses as RFC 2822.
    pub fn parsed_date(&self) -> Option<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc2822(self.date.trim()).ok()
    }
}

/// Syntactic message-id check: `<local@domain>`, length-bounded.
pub fn valid_message_id(id: &str) -> bool {
    let len = id.len();
    if !(MSGID_MIN_LEN..=MSGID_MAX_LEN).contains(&len) {
        return false;
    }
    if !id.starts_with('<') || !id.ends_with('>') {
        return false;
    }
    let inner = &id[1..len - 1];
    let Some(at) = inner.find('@') else {
        return false;
    };
    let (local, domain) = inner.split_at(at);
    let domain = &domain[1..];
    if local.is_empty() || domain.is_empty() {
        return false;
    }
    // No whitespace or nested angle brackets anywhere inside.
    !inner
        .chars()
        .any(|c| c.is_whitespace() || c == '<' || c == '>')
}

/// Storage token `group:articleNumber` pointing into the group store.
pub fn storage_token(group: &str, artnum: u64) -> String {
    format!("{}:{}", group, artnum)
}

/// Split a storage token back into `(group, articleNumber)`.
pub fn parse_storage_token(token: &str) -> Option<(&str, u64)> {
    let idx = token.rfind(':')?;
    let num = token[idx + 1..].parse().ok()?;
    Some((&token[..idx], num))
}

// =============================================================================
// Overview rows
// =============================================================================

/// One overview (NOV) row: the compact per-article summary served by XOVER.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverviewRow {
    pub num: u64,
    pub subject: String,
    pub from: String,
    pub date: String,
    pub message_id: String,
    pub references: String,
    pub bytes: u64,
    pub lines: u64,
}

impl OverviewRow {
    pub fn from_article(num: u64, article: &Article) -> Self {
        Self {
            num,
            subject: article.subject.clone(),
            from: article.from.clone(),
            date: article.date.clone(),
            message_id: article.message_id.clone(),
            references: article.references.clone(),
            bytes: article.bytes,
            lines: article.lines,
        }
    }

    /// Render as a TAB-delimited wire line. TABs inside fields are replaced
    /// with spaces so the column count stays fixed.
    pub fn to_wire(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.num,
            sanitize(&self.subject),
            sanitize(&self.from),
            sanitize(&self.date),
            sanitize(&self.message_id),
            sanitize(&self.references),
            self.bytes,
            self.lines
        )
    }

    /// Parse a TAB-delimited overview line. Returns `None` on short rows or
    /// an unparseable article number.
    pub fn parse(line: &str) -> Option<Self> {
        // NUL marks end-of-data in overview files.
        if line.starts_with('\0') {
            return None;
        }
        let mut fields = line.split('\t');
        let num = fields.next()?.trim().parse().ok()?;
        let subject = fields.next()?.to_string();
        let from = fields.next()?.to_string();
        let date = fields.next()?.to_string();
        let message_id = fields.next()?.to_string();
        let references = fields.next()?.to_string();
        let bytes = fields.next().and_then(|f| f.trim().parse().ok()).unwrap_or(0);
        let lines = fields.next().and_then(|f| f.trim().parse().ok()).unwrap_or(0);
        Some(Self {
            num,
            subject,
            from,
            date,
            message_id,
            references,
            bytes,
            lines,
        })
    }
}

fn sanitize(field: &str) -> String {
    if field.contains('\t') {
        field.replace('\t', " ")
    } else {
        field.to_string()
    }
}

// =============================================================================
// Article ranges
// =============================================================================

/// Range argument accepted by XOVER, XHDR and LISTGROUP: `N`, `N-`, `N-M`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArticleRange {
    Single(u64),
    From(u64),
    Span(u64, u64),
}

impl ArticleRange {
    pub fn parse(arg: &str) -> Option<Self> {
        let arg = arg.trim();
        if arg.is_empty() {
            return None;
        }
        match arg.split_once('-') {
            None => arg.parse().ok().map(ArticleRange::Single),
            Some((start, "")) => start.parse().ok().map(ArticleRange::From),
            Some((start, end)) => {
                let start = start.parse().ok()?;
                let end = end.parse().ok()?;
                Some(ArticleRange::Span(start, end))
            }
        }
    }

    /// Resolve against a group's high watermark into inclusive bounds.
    pub fn bounds(self, high: u64) -> (u64, u64) {
        match self {
            ArticleRange::Single(n) => (n, n),
            ArticleRange::From(n) => (n, high),
            ArticleRange::Span(a, b) => (a, b),
        }
    }

    /// Render back to the wire syntax.
    pub fn to_wire(self) -> String {
        match self {
            ArticleRange::Single(n) => n.to_string(),
            ArticleRange::From(n) => format!("{}-", n),
            ArticleRange::Span(a, b) => format!("{}-{}", a, b),
        }
    }
}

/// Seconds the article's Date header lies in the future relative to `now`,
/// or 0 if it is not in the future.
pub fn future_date_secs(date: &DateTime<FixedOffset>, now: DateTime<Utc>) -> i64 {
    let delta = date.with_timezone(&Utc).timestamp() - now.timestamp();
    delta.max(0)
}
