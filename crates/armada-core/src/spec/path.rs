//! Run-spec and group path identifiers.
//!
//! Every run-spec lives at an absolute slash-separated path; the prefix
//! segments form the implicit group hierarchy. Segments are restricted to
//! lowercase alphanumerics, `-` and `.` so a path can be embedded into
//! instance ids and store keys without escaping ambiguity (`_`, `:` and `/`
//! are the reserved separators).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// An absolute path like `/prod/web/frontend`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathId {
    segments: Vec<String>,
}

/// Error returned when parsing an invalid [`PathId`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path {0:?} is not absolute")]
    NotAbsolute(String),

    #[error("path {path:?} has invalid segment {segment:?}")]
    InvalidSegment { path: String, segment: String },

    #[error("path has an empty segment: {0:?}")]
    EmptySegment(String),
}

fn segment_ok(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
}

impl PathId {
    /// The root path `/`.
    pub fn root() -> Self {
        Self { segments: Vec::new() }
    }

    /// Build from pre-validated segments; panics on an invalid segment, so
    /// only use with literals and already-parsed input.
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        for s in &segments {
            assert!(segment_ok(s), "invalid path segment {s:?}");
        }
        Self { segments }
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The final segment, or `None` for the root.
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// The containing path; the root is its own parent.
    pub fn parent(&self) -> PathId {
        if self.segments.is_empty() {
            return PathId::root();
        }
        PathId {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        }
    }

    /// All proper ancestors, nearest first, ending with the root.
    pub fn ancestors(&self) -> Vec<PathId> {
        let mut out = Vec::new();
        let mut current = self.clone();
        while !current.is_root() {
            current = current.parent();
            out.push(current.clone());
        }
        out
    }

    pub fn is_child_of(&self, other: &PathId) -> bool {
        self.segments.len() == other.segments.len() + 1 && self.starts_with(other)
    }

    pub fn starts_with(&self, prefix: &PathId) -> bool {
        self.segments.len() >= prefix.segments.len()
            && self.segments[..prefix.segments.len()] == prefix.segments[..]
    }

    pub fn join(&self, segment: &str) -> Result<PathId, PathError> {
        if !segment_ok(segment) {
            return Err(PathError::InvalidSegment {
                path: self.to_string(),
                segment: segment.to_string(),
            });
        }
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        Ok(PathId { segments })
    }

    /// The first segment, used for top-level group role enforcement.
    pub fn top_level(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    /// Render with `_` separators for embedding in instance and task ids.
    pub fn safe_id(&self) -> String {
        self.segments.join("_")
    }

    /// Inverse of [`PathId::safe_id`].
    pub fn from_safe_id(safe: &str) -> Result<PathId, PathError> {
        format!("/{}", safe.replace('_', "/")).parse()
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.segments.join("/"))
    }
}

impl FromStr for PathId {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.starts_with('/') {
            return Err(PathError::NotAbsolute(s.to_string()));
        }
        let trimmed = s.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(PathId::root());
        }
        let mut segments = Vec::new();
        for segment in trimmed.split('/') {
            if segment.is_empty() {
                return Err(PathError::EmptySegment(s.to_string()));
            }
            if !segment_ok(segment) {
                return Err(PathError::InvalidSegment {
                    path: s.to_string(),
                    segment: segment.to_string(),
                });
            }
            segments.push(segment.to_string());
        }
        Ok(PathId { segments })
    }
}

impl Serialize for PathId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PathId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_absolute_paths() {
        let p: PathId = "/prod/web/frontend".parse().unwrap();
        assert_eq!(p.segments(), ["prod", "web", "frontend"]);
        assert_eq!(p.to_string(), "/prod/web/frontend");
        assert_eq!(p.name(), Some("frontend"));
    }

    #[test]
    fn trailing_slash_is_tolerated() {
        let p: PathId = "/prod/web/".parse().unwrap();
        assert_eq!(p.to_string(), "/prod/web");
    }

    #[test]
    fn root_path() {
        let p: PathId = "/".parse().unwrap();
        assert!(p.is_root());
        assert_eq!(p.to_string(), "/");
        assert_eq!(p.parent(), PathId::root());
    }

    #[test]
    fn rejects_relative_and_bad_segments() {
        assert!(matches!(
            "web/frontend".parse::<PathId>(),
            Err(PathError::NotAbsolute(_))
        ));
        assert!(matches!(
            "/prod//web".parse::<PathId>(),
            Err(PathError::EmptySegment(_))
        ));
        assert!(matches!(
            "/prod/WEB".parse::<PathId>(),
            Err(PathError::InvalidSegment { .. })
        ));
        // Underscore is the instance-id separator, so it is not a path char.
        assert!(matches!(
            "/prod/my_app".parse::<PathId>(),
            Err(PathError::InvalidSegment { .. })
        ));
    }

    #[test]
    fn parent_and_ancestors() {
        let p: PathId = "/a/b/c".parse().unwrap();
        assert_eq!(p.parent().to_string(), "/a/b");
        let ancestors: Vec<String> = p.ancestors().iter().map(|a| a.to_string()).collect();
        assert_eq!(ancestors, vec!["/a/b", "/a", "/"]);
    }

    #[test]
    fn prefix_relations() {
        let parent: PathId = "/a/b".parse().unwrap();
        let child: PathId = "/a/b/c".parse().unwrap();
        let grandchild: PathId = "/a/b/c/d".parse().unwrap();
        assert!(child.is_child_of(&parent));
        assert!(!grandchild.is_child_of(&parent));
        assert!(grandchild.starts_with(&parent));
        assert!(!parent.starts_with(&child));
    }

    #[test]
    fn safe_id_roundtrip() {
        let p: PathId = "/prod/web/frontend".parse().unwrap();
        assert_eq!(p.safe_id(), "prod_web_frontend");
        assert_eq!(PathId::from_safe_id("prod_web_frontend").unwrap(), p);
    }

    #[test]
    fn serde_as_string() {
        let p: PathId = "/a/b".parse().unwrap();
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "\"/a/b\"");
        let back: PathId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
