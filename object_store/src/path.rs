use crate::{Error, ErrorKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A validated, store-relative object path.
///
/// Paths are `/`-separated, never absolute, and never contain `..`
/// segments; validation happens up front so no backend has to re-check for
/// traversal attempts at IO time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Path(String);

impl Path {
    /// Parse and validate a raw path string.
    pub fn parse(input: impl AsRef<str>) -> Result<Self, Error> {
        let input = input.as_ref();
        let invalid = |reason: &str| {
            Error::new(ErrorKind::InvalidPath, Some(input.to_string()))
                .with_context(reason.to_string())
        };

        if input.is_empty() {
            return Err(invalid("path is empty"));
        }
        if input.starts_with('/') {
            return Err(invalid("path must be relative"));
        }
        if input.contains('\0') {
            return Err(invalid("path contains NUL"));
        }
        for segment in input.split('/') {
            match segment {
                "" => return Err(invalid("path contains empty segment")),
                "." | ".." => return Err(invalid("path traversal segment")),
                _ => {}
            }
        }
        Ok(Self(input.to_string()))
    }

    /// Build from individual segments, validating each.
    pub fn from_segments<'a>(segments: impl IntoIterator<Item = &'a str>) -> Result<Self, Error> {
        let joined = segments.into_iter().collect::<Vec<_>>().join("/");
        Self::parse(joined)
    }

    /// Append a child segment (or relative sub-path).
    pub fn join(&self, child: &str) -> Result<Self, Error> {
        Self::parse(format!("{}/{}", self.0, child))
    }

    /// The raw string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Final path segment.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().expect("non-empty path")
    }

    /// Everything before the final segment, if any.
    pub fn parent(&self) -> Option<Self> {
        self.0.rsplit_once('/').map(|(dir, _)| Self(dir.to_string()))
    }

    /// Whether `self` is equal to or nested under `prefix`.
    pub fn starts_with(&self, prefix: &Self) -> bool {
        self.0 == prefix.0 || self.0.starts_with(&format!("{}/", prefix.0))
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Path {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Path> for String {
    fn from(p: Path) -> Self {
        p.0
    }
}
