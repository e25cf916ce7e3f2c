//! Topic pattern construction and matching.
//!
//! Topics are path-like strings such as `"robot1/odometry/raw"`. A
//! [`TopicPattern`] pairs a compiled regex with its source string; the
//! source string is what goes to the relay in subscribe messages, so it
//! must round-trip exactly.
//!
//! All literal segments are escaped before compiling: a topic literally
//! named `"a.b"` matches `"a.b"` and nothing else.

use crate::error::{RobofleetLinkError, Result};
use regex::Regex;

/// A compiled topic matcher plus the source string the relay subscribes with.
#[derive(Debug, Clone)]
pub struct TopicPattern {
    regex: Regex,
    source: String,
}

impl TopicPattern {
    fn compile(source: String) -> Result<Self> {
        let regex = Regex::new(&source).map_err(|e| {
            RobofleetLinkError::Configuration(format!("Invalid topic pattern '{}': {}", source, e))
        })?;
        Ok(Self { regex, source })
    }

    /// Match only the literal string `topic`.
    pub fn exact(topic: &str) -> Result<Self> {
        Self::compile(format!("^{}$", regex::escape(topic)))
    }

    /// Match `"{namespace}/{topic}"` literally.
    pub fn in_namespace(namespace: &str, topic: &str) -> Result<Self> {
        Self::compile(format!(
            "^{}/{}$",
            regex::escape(namespace),
            regex::escape(topic)
        ))
    }

    /// Match any topic under `namespace`. The suffix is captured as the
    /// named group `topic` (also group 1).
    pub fn any_topic_under(namespace: &str) -> Result<Self> {
        Self::compile(format!("^{}/(?P<topic>.+)$", regex::escape(namespace)))
    }

    /// Match `topic` in any (or no) namespace. The namespace, when present,
    /// is captured as the named group `ns`.
    pub fn any_namespace_for(topic: &str) -> Result<Self> {
        Self::compile(format!("^(?:(?P<ns>.*)/)?{}$", regex::escape(topic)))
    }

    /// Build a pattern from a raw regex string. The string is used verbatim
    /// as the subscription source, so callers are responsible for escaping.
    pub fn from_regex(source: &str) -> Result<Self> {
        Self::compile(source.to_string())
    }

    /// The source string sent to the relay in subscribe messages.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Test `topic` against this pattern.
    pub fn matches(&self, topic: &str) -> Option<TopicMatch> {
        let caps = self.regex.captures(topic)?;
        let groups = caps
            .iter()
            .map(|g| g.map(|m| m.as_str().to_string()))
            .collect();
        Some(TopicMatch {
            topic: topic.to_string(),
            groups,
            namespace: caps.name("ns").map(|m| m.as_str().to_string()),
            suffix: caps.name("topic").map(|m| m.as_str().to_string()),
        })
    }
}

/// The result of a successful topic match, handed to listeners alongside
/// the message frame.
#[derive(Debug, Clone)]
pub struct TopicMatch {
    topic: String,
    groups: Vec<Option<String>>,
    namespace: Option<String>,
    suffix: Option<String>,
}

impl TopicMatch {
    /// The full topic string that matched.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// A capture group by index (group 0 is the whole match).
    pub fn group(&self, index: usize) -> Option<&str> {
        self.groups.get(index).and_then(|g| g.as_deref())
    }

    /// The captured namespace, for patterns built with
    /// [`TopicPattern::any_namespace_for`].
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// The captured topic suffix, for patterns built with
    /// [`TopicPattern::any_topic_under`].
    pub fn suffix(&self) -> Option<&str> {
        self.suffix.as_deref()
    }
}
