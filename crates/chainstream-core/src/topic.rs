//! Routing topics and subscription patterns.
//!
//! Topics are dot-separated keys (`event.transfer`). A pattern is either an
//! exact topic or a prefix followed by a trailing `*` segment, which matches
//! every topic below that prefix.

use crate::error::StreamError;

/// Topic for [`EventKind::Transfer`](crate::types::EventKind::Transfer) events.
pub const TRANSFER: &str = "event.transfer";
/// Topic for [`EventKind::Approval`](crate::types::EventKind::Approval) events.
pub const APPROVAL: &str = "event.approval";
/// Aggregate topic covering every event kind.
pub const ALL_EVENTS: &str = "event.*";

const WILDCARD: &str = "*";

/// A parsed subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicPattern {
    /// Matches one topic exactly.
    Exact(String),
    /// Matches every topic strictly below `prefix` (stored without the
    /// trailing `.`).
    Prefix(String),
}

impl TopicPattern {
    /// Parse a pattern string.
    ///
    /// `*` may only appear as the final segment.
    pub fn parse(pattern: &str) -> Result<Self, StreamError> {
        let invalid = |why: &str| StreamError::Other(format!("invalid topic pattern '{pattern}': {why}"));

        if pattern.is_empty() {
            return Err(invalid("empty"));
        }
        let segments: Vec<&str> = pattern.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(invalid("empty segment"));
        }
        let (last, head) = segments.split_last().ok_or_else(|| invalid("empty"))?;
        if head.iter().any(|s| s.contains(WILDCARD)) {
            return Err(invalid("wildcard must be the last segment"));
        }
        if *last == WILDCARD {
            Ok(Self::Prefix(head.join(".")))
        } else if last.contains(WILDCARD) {
            Err(invalid("wildcard must be a whole segment"))
        } else {
            Ok(Self::Exact(pattern.to_string()))
        }
    }

    /// Returns `true` if a publish on `topic` should reach this pattern.
    ///
    /// A prefix pattern also matches the literal aggregate topic it spells
    /// (`event.*` matches a publish on `event.*`).
    pub fn matches(&self, topic: &str) -> bool {
        match self {
            Self::Exact(t) => t == topic,
            Self::Prefix(prefix) if prefix.is_empty() => true,
            Self::Prefix(prefix) => topic
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix('.'))
                .is_some_and(|rest| !rest.is_empty()),
        }
    }
}

impl std::fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exact(t) => f.write_str(t),
            Self::Prefix(p) if p.is_empty() => f.write_str(WILDCARD),
            Self::Prefix(p) => write!(f, "{p}.{WILDCARD}"),
        }
    }
}
