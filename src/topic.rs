//! Hierarchical paths and the patterns that match them
//!
//! Services address events and commands with `/`-delimited paths like
//! `/session/42/created`. On the wire these become dot-delimited routing
//! keys (`session.42.created`) so the broker's native topic exchange can
//! perform the actual routing. Local matching is still required to fan a
//! single bound queue out to multiple registered subscribers, which is what
//! [`TopicPattern`] provides, mirroring the broker's wildcard semantics.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Normalized hierarchical path
///
/// Normalization is deterministic: leading and trailing slashes are
/// insignificant, repeated slashes collapse into one. `/foo//bar/`,
/// `foo/bar` and `/foo/bar` all denote the same topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Topic {
    segments: Vec<String>,
}

impl Topic {
    /// Parses and normalizes a `/`-delimited path
    pub fn new(path: &str) -> Self {
        Self {
            segments: path
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect(),
        }
    }

    /// Parses a dot-delimited broker routing key back into a topic
    pub fn from_routing_key(key: &str) -> Self {
        Self {
            segments: key
                .split('.')
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect(),
        }
    }

    /// Routing key for the broker's topic exchange (`/foo/bar` → `foo.bar`)
    pub fn routing_key(&self) -> String {
        self.segments.join(".")
    }

    /// Normalized path segments
    pub fn segments(&self) -> &[String] {
        &self.segments
    }
}

impl Display for Topic {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.segments.join("/"))
    }
}

impl From<&str> for Topic {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for Topic {
    fn from(path: String) -> Self {
        Self::new(&path)
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternSegment {
    Literal(String),
    /// `*`, matches exactly one segment
    Single,
    /// `#`, matches zero or more segments
    Rest,
}

/// Wildcard-capable pattern over [`Topics`](Topic)
///
/// Follows the topic-exchange semantics of the broker so that a pattern
/// maps 1:1 onto a binding key without a translation layer: `*` matches
/// exactly one segment, `#` matches zero or more segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    segments: Vec<PatternSegment>,
}

impl TopicPattern {
    /// Parses a `/`-delimited pattern, normalized like [`Topic::new`]
    pub fn new(pattern: &str) -> Self {
        Self {
            segments: pattern
                .split('/')
                .filter(|s| !s.is_empty())
                .map(|s| match s {
                    "*" => PatternSegment::Single,
                    "#" => PatternSegment::Rest,
                    literal => PatternSegment::Literal(literal.to_owned()),
                })
                .collect(),
        }
    }

    /// Parses a dot-delimited binding key as used on the broker
    pub fn from_routing_key(key: &str) -> Self {
        Self::new(&key.replace('.', "/"))
    }

    /// Binding key for the broker's topic exchange
    pub fn routing_key(&self) -> String {
        self.segments
            .iter()
            .map(|s| match s {
                PatternSegment::Literal(literal) => literal.as_str(),
                PatternSegment::Single => "*",
                PatternSegment::Rest => "#",
            })
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Checks whether the given topic matches this pattern
    pub fn matches(&self, topic: &Topic) -> bool {
        matches_segments(&self.segments, topic.segments())
    }
}

impl Display for TopicPattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.routing_key().replace('.', "/"))
    }
}

impl From<&str> for TopicPattern {
    fn from(pattern: &str) -> Self {
        Self::new(pattern)
    }
}

fn matches_segments(pattern: &[PatternSegment], path: &[String]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((PatternSegment::Rest, rest)) => {
            (0..=path.len()).any(|skipped| matches_segments(rest, &path[skipped..]))
        }
        Some((PatternSegment::Single, rest)) => {
            !path.is_empty() && matches_segments(rest, &path[1..])
        }
        Some((PatternSegment::Literal(literal), rest)) => {
            path.first().map_or(false, |segment| segment == literal)
                && matches_segments(rest, &path[1..])
        }
    }
}
