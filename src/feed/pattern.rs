//! Newsgroup feed pattern evaluation.
//!
//! Patterns are globs with `*` (any length) and `?` (one char), kept in
//! three ordered lists per peer: `send`, `exclude` (spelled `!pattern` in
//! feeds), and `reject` (spelled `@pattern`). A reject match anywhere kills
//! the whole article even when it is crossposted elsewhere; an exclude only
//! prunes that group from the send set.

use serde::Deserialize;

/// Glob match with `*` and `?`. Case-sensitive; group names are expected
/// lowercase on the wire.
pub fn wildmat(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();

    let (mut pi, mut ni) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ni < name.len() {
        if pi < pattern.len() && (pattern[pi] == '?' || pattern[pi] == name[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < pattern.len() && pattern[pi] == '*' {
            star = Some((pi, ni));
            pi += 1;
        } else if let Some((star_pi, star_ni)) = star {
            // Backtrack: let the last * swallow one more char.
            pi = star_pi + 1;
            ni = star_ni + 1;
            star = Some((star_pi, star_ni + 1));
        } else {
            return false;
        }
    }
    while pi < pattern.len() && pattern[pi] == '*' {
        pi += 1;
    }
    pi == pattern.len()
}

/// Decision for a single group against one peer's lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupDecision {
    /// A reject pattern matched; the whole article must not go.
    Reject,
    /// The group is pruned from the send set.
    Exclude,
    /// At least one send pattern matched.
    Send,
    /// Nothing matched.
    NoMatch,
}

/// Decision for a whole (possibly crossposted) article.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArticleDecision {
    /// At least one group hit a reject pattern; `group` names the culprit.
    Reject { group: String },
    Send,
    Exclude,
    NoSend,
}

/// A peer's compiled feed-pattern lists.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedPatterns {
    pub send: Vec<String>,
    pub exclude: Vec<String>,
    pub reject: Vec<String>,
}

impl FeedPatterns {
    /// Build from raw config lists. Leading `!` and `@` markers are
    /// stripped and only select which list a pattern lands in, so a
    /// `send = ["comp.*", "!comp.binaries.*", "@*.warez.*"]` feed works
    /// the way an INN newsfeeds entry reads.
    pub fn from_lists(send: &[String], exclude: &[String], reject: &[String]) -> Self {
        let mut patterns = FeedPatterns::default();
        for raw in send {
            patterns.add(raw);
        }
        for raw in exclude {
            patterns.exclude.push(strip_marker(raw));
        }
        for raw in reject {
            patterns.reject.push(strip_marker(raw));
        }
        patterns
    }

    /// Route one raw pattern to its list by marker.
    pub fn add(&mut self, raw: &str) {
        if let Some(rest) = raw.strip_prefix('@') {
            self.reject.push(rest.to_string());
        } else if let Some(rest) = raw.strip_prefix('!') {
            self.exclude.push(rest.to_string());
        } else {
            self.send.push(raw.to_string());
        }
    }

    /// Preload the default administrative exclusions and binary rejects.
    /// `reject_adult` adds the adult-group patterns to the reject list.
    pub fn with_defaults(mut self, reject_adult: bool) -> Self {
        for pattern in ADMINISTRATIVE_EXCLUDES {
            self.exclude.push((*pattern).to_string());
        }
        for pattern in BINARY_REJECTS {
            self.reject.push((*pattern).to_string());
        }
        if reject_adult {
            for pattern in ADULT_REJECTS {
                self.reject.push((*pattern).to_string());
            }
        }
        self
    }

    /// Evaluate a single group. Reject wins over exclude wins over send.
    pub fn decide_group(&self, group: &str) -> GroupDecision {
        if self.reject.iter().any(|p| wildmat(p, group)) {
            return GroupDecision::Reject;
        }
        if self.exclude.iter().any(|p| wildmat(p, group)) {
            return GroupDecision::Exclude;
        }
        if self.send.iter().any(|p| wildmat(p, group)) {
            return GroupDecision::Send;
        }
        GroupDecision::NoMatch
    }

    /// Fold the per-group decisions for a crossposted article: reject on
    /// any group beats all; else send if any group says send; else exclude
    /// if any says exclude; else no-send.
    pub fn decide_article<'a, I>(&self, groups: I) -> ArticleDecision
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut any_send = false;
        let mut any_exclude = false;
        for group in groups {
            match self.decide_group(group) {
                GroupDecision::Reject => {
                    return ArticleDecision::Reject {
                        group: group.to_string(),
                    }
                }
                GroupDecision::Send => any_send = true,
                GroupDecision::Exclude => any_exclude = true,
                GroupDecision::NoMatch => {}
            }
        }
        if any_send {
            ArticleDecision::Send
        } else if any_exclude {
            ArticleDecision::Exclude
        } else {
            ArticleDecision::NoSend
        }
    }
}

fn strip_marker(raw: &str) -> String {
    raw.trim_start_matches(['!', '@']).to_string()
}

/// Administrative hierarchies never fed to peers.
pub const ADMINISTRATIVE_EXCLUDES: &[&str] = &[
    "control.*",
    "junk.*",
    "local.*",
    "ka.*",
    "gmane.*",
    "gwene.*",
];

/// Binary hierarchies rejected outright.
pub const BINARY_REJECTS: &[&str] = &[
    "*.binaries.*",
    "*.binaries",
    "*.binarios.*",
    "*.binaer.*",
    "*bin.*",
    "*.bin",
    "*.files.*",
    "*.files",
    "*.nzb*",
    "*.mp3.*",
    "*.mp3",
    "*.mpeg.*",
    "*.warez.*",
    "*.warez",
    "*.dvd.*",
    "*.dvdr.*",
    "*.cd.image*",
    "*.pictures.*",
    "*.pix.*",
];

/// Adult hierarchies, rejected only when configured.
pub const ADULT_REJECTS: &[&str] = &["*.sex.*", "*.sex", "*.erotica.*", "*.erotica", "*.porn*"];
