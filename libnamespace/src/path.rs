//! Validated absolute namespace paths.

use std::fmt;

use crate::error::{MasterError, Result};

pub const SEPARATOR: char = '/';

/// An absolute, normalised namespace path. Repeated and trailing separators
/// are collapsed; `.`/`..` segments are rejected rather than resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NsPath {
    segments: Vec<String>,
}

impl NsPath {
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    pub fn new(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(MasterError::invalid_path(raw, "path is empty"));
        }
        if !raw.starts_with(SEPARATOR) {
            return Err(MasterError::invalid_path(raw, "path is not absolute"));
        }
        let mut segments = Vec::new();
        for part in raw.split(SEPARATOR).filter(|s| !s.is_empty()) {
            Self::check_name(raw, part)?;
            segments.push(part.to_string());
        }
        Ok(Self { segments })
    }

    fn check_name(raw: &str, name: &str) -> Result<()> {
        if name == "." || name == ".." {
            return Err(MasterError::invalid_path(
                raw,
                format!("relative segment {name:?}"),
            ));
        }
        if name.contains('\0') {
            return Err(MasterError::invalid_path(raw, "segment contains NUL"));
        }
        Ok(())
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Number of segments; the root has depth 0.
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn parent(&self) -> Option<NsPath> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Prefix of this path with `depth` segments.
    pub fn ancestor(&self, depth: usize) -> NsPath {
        Self {
            segments: self.segments[..depth.min(self.segments.len())].to_vec(),
        }
    }

    pub fn join(&self, name: &str) -> Result<NsPath> {
        Self::check_name(name, name)?;
        if name.is_empty() || name.contains(SEPARATOR) {
            return Err(MasterError::invalid_path(name, "not a single path segment"));
        }
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Ok(Self { segments })
    }

    /// True when `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &NsPath) -> bool {
        self.segments.len() < other.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }

    pub fn starts_with(&self, prefix: &NsPath) -> bool {
        prefix == self || prefix.is_ancestor_of(self)
    }

    /// Segments of `self` below `prefix`, if `prefix` encloses it.
    pub fn strip_prefix(&self, prefix: &NsPath) -> Option<&[String]> {
        if self.starts_with(prefix) {
            Some(&self.segments[prefix.segments.len()..])
        } else {
            None
        }
    }

    /// Number of leading segments shared with `other`.
    pub fn common_depth(&self, other: &NsPath) -> usize {
        self.segments
            .iter()
            .zip(other.segments.iter())
            .take_while(|(a, b)| a == b)
            .count()
    }
}

impl fmt::Display for NsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for seg in &self.segments {
            write!(f, "/{seg}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for NsPath {
    type Err = MasterError;

    fn from_str(s: &str) -> Result<Self> {
        NsPath::new(s)
    }
}

/// Join a UFS base path with namespace segments below a mount point.
pub fn join_ufs(base: &str, rest: &[String]) -> String {
    let mut out = base.trim_end_matches(SEPARATOR).to_string();
    for seg in rest {
        out.push(SEPARATOR);
        out.push_str(seg);
    }
    if out.is_empty() {
        out.push(SEPARATOR);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_normalises_separators() {
        let p = NsPath::new("//a///b/").unwrap();
        assert_eq!(p.to_string(), "/a/b");
        assert_eq!(p.depth(), 2);
        assert_eq!(NsPath::new("/").unwrap(), NsPath::root());
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in ["", "a/b", "/a/../b", "/./a", "/a\0b"] {
            let err = NsPath::new(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidPath, "{bad:?}");
        }
    }

    #[test]
    fn test_prefix_relations() {
        let a = NsPath::new("/a").unwrap();
        let ab = NsPath::new("/a/b").unwrap();
        let abc = NsPath::new("/ab/c").unwrap();
        assert!(a.is_ancestor_of(&ab));
        assert!(!a.is_ancestor_of(&abc));
        assert!(!a.is_ancestor_of(&a));
        assert!(ab.starts_with(&a));
        assert_eq!(ab.strip_prefix(&a).unwrap(), &["b".to_string()]);
        assert_eq!(ab.common_depth(&abc), 0);
        assert_eq!(ab.parent().unwrap(), a);
    }

    #[test]
    fn test_join_ufs() {
        assert_eq!(join_ufs("/", &[]), "/");
        assert_eq!(join_ufs("/data/", &["x".into(), "y".into()]), "/data/x/y");
        assert_eq!(join_ufs("", &["x".into()]), "/x");
    }
}
