//! Topic name patterns
//!
//! A pattern is either an exact topic name or a prefix. A pattern ending in
//! `*` is a prefix (`"/a/*"` matches `/a/b` but not `/b/a`); with
//! `prefix_match` set every pattern is a prefix.
//!
//! Prefix patterns never match names beginning with `$` (metadata topics)
//! unless the prefix itself begins with `$`.

use std::fmt;

/// Wildcard suffix marking a prefix pattern
pub const WILDCARD: char = '*';

/// Prefix marking metadata topics
pub const META_PREFIX: char = '$';

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicPattern {
    Exact(String),
    Prefix(String),
}

impl TopicPattern {
    /// Parse a pattern string
    pub fn parse(pattern: &str, prefix_match: bool) -> Self {
        if let Some(prefix) = pattern.strip_suffix(WILDCARD) {
            TopicPattern::Prefix(prefix.to_string())
        } else if prefix_match {
            TopicPattern::Prefix(pattern.to_string())
        } else {
            TopicPattern::Exact(pattern.to_string())
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            TopicPattern::Exact(exact) => exact == name,
            TopicPattern::Prefix(prefix) => {
                if name.starts_with(META_PREFIX) && !prefix.starts_with(META_PREFIX) {
                    return false;
                }
                name.starts_with(prefix.as_str())
            }
        }
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicPattern::Exact(exact) => f.write_str(exact),
            TopicPattern::Prefix(prefix) => write!(f, "{}{}", prefix, WILDCARD),
        }
    }
}
