use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ContextError;

const WILDCARD: &str = "*";

fn invalid(path: &str, reason: impl Into<String>) -> ContextError {
    ContextError::InvalidPath {
        path: path.to_string(),
        reason: reason.into(),
    }
}

fn check_segment(raw: &str, segment: &str, allow_wildcard: bool) -> Result<(), ContextError> {
    if segment.is_empty() {
        return Err(invalid(raw, "empty segment"));
    }
    if allow_wildcard && segment == WILDCARD {
        return Ok(());
    }
    if let Some(bad) = segment
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(invalid(raw, format!("illegal character '{bad}' in '{segment}'")));
    }
    Ok(())
}

/// Dot-addressed location in the context tree, e.g. `focus.current.level`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextPath {
    segments: Vec<String>,
}

impl ContextPath {
    pub fn parse(raw: &str) -> Result<Self, ContextError> {
        if raw.is_empty() {
            return Err(invalid(raw, "path is empty"));
        }
        let segments: Vec<String> = raw.split('.').map(str::to_string).collect();
        for segment in &segments {
            check_segment(raw, segment, false)?;
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// True if `self` equals `prefix` or lies beneath it.
    pub fn starts_with(&self, prefix: &ContextPath) -> bool {
        self.segments.starts_with(&prefix.segments)
    }

    /// Strict ancestors, nearest first.
    pub fn ancestors(&self) -> impl Iterator<Item = ContextPath> + '_ {
        (1..self.segments.len()).rev().map(|n| ContextPath {
            segments: self.segments[..n].to_vec(),
        })
    }
}

impl fmt::Display for ContextPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

impl std::str::FromStr for ContextPath {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ContextPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContextPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ContextPath::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Subscription pattern: a path whose segments may be `*`.
///
/// A pattern matches a written path when it matches the path itself or one
/// of its ancestors, so `focus` and `*.current` both match `focus.current.level`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    segments: Vec<String>,
}

impl PathPattern {
    pub fn parse(raw: &str) -> Result<Self, ContextError> {
        if raw.is_empty() {
            return Err(invalid(raw, "pattern is empty"));
        }
        let segments: Vec<String> = raw.split('.').map(str::to_string).collect();
        for segment in &segments {
            check_segment(raw, segment, true)?;
        }
        Ok(Self { segments })
    }

    pub fn matches(&self, path: &ContextPath) -> bool {
        let target = path.segments();
        self.segments.len() <= target.len()
            && self
                .segments
                .iter()
                .zip(target)
                .all(|(want, got)| want == WILDCARD || want == got)
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}
