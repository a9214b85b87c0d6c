//! Attribute paths into a resource tree
//!
//! Paths are attached to every diagnostic so a user can find the offending
//! attribute in their declaration, e.g. `rules[2].action.allow.update.as_path`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One step in an attribute path
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PathSegment {
    /// Named object attribute
    Field(String),
    /// Position in a list or set
    Index(usize),
    /// Active tag of a variant group
    Tag(String),
}

/// A path from the resource body root to a nested attribute
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AttrPath(Vec<PathSegment>);

impl AttrPath {
    /// The empty path (the resource body itself)
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Build a path from dotted field names
    pub fn from_fields(fields: &[&str]) -> Self {
        Self(
            fields
                .iter()
                .map(|f| PathSegment::Field((*f).to_string()))
                .collect(),
        )
    }

    pub fn field(&self, name: &str) -> Self {
        self.child(PathSegment::Field(name.to_string()))
    }

    pub fn index(&self, index: usize) -> Self {
        self.child(PathSegment::Index(index))
    }

    pub fn tag(&self, tag: &str) -> Self {
        self.child(PathSegment::Tag(tag.to_string()))
    }

    /// `other` appended to `self`
    pub fn join(&self, other: &AttrPath) -> Self {
        let mut segments = self.0.clone();
        segments.extend(other.0.iter().cloned());
        Self(segments)
    }

    fn child(&self, segment: PathSegment) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment);
        Self(segments)
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `self` is `other` or lies underneath it
    pub fn starts_with(&self, other: &AttrPath) -> bool {
        self.0.starts_with(&other.0)
    }
}

impl fmt::Display for AttrPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "(root)");
        }
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                PathSegment::Field(name) | PathSegment::Tag(name) => {
                    if i > 0 {
                        write!(f, ".")?;
                    }
                    write!(f, "{name}")?;
                }
                PathSegment::Index(index) => write!(f, "[{index}]")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_nested_path() {
        let path = AttrPath::root()
            .field("rules")
            .index(2)
            .field("action")
            .tag("allow")
            .field("update")
            .field("as_path");
        assert_eq!(path.to_string(), "rules[2].action.allow.update.as_path");
    }

    #[test]
    fn test_display_root() {
        assert_eq!(AttrPath::root().to_string(), "(root)");
    }

    #[test]
    fn test_join() {
        let prefix = AttrPath::root().field("rules").index(1);
        let joined = prefix.join(&AttrPath::from_fields(&["source_addresses"]).index(0));
        assert_eq!(joined.to_string(), "rules[1].source_addresses[0]");
    }

    #[test]
    fn test_starts_with() {
        let parent = AttrPath::from_fields(&["as_path"]);
        let child = parent.tag("prepend");
        assert!(child.starts_with(&parent));
        assert!(!parent.starts_with(&child));
    }
}
