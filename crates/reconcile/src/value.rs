//! In-memory representation of resource trees
//!
//! A [`Value`] is a tri-state tree: known values, `Null` for an attribute
//! that is explicitly absent, and `Unknown` for one that will only be known
//! after apply. Variant groups are first-class nodes holding the active tag
//! and its payload, so a sibling tag can never be activated by accident.

use crate::path::AttrPath;
use std::collections::BTreeMap;
use std::fmt;

/// A resource attribute tree
#[derive(Debug, Clone)]
pub enum Value {
    /// Attribute explicitly absent
    Null,
    /// Produced by apply; never equal to anything
    Unknown,
    Bool(bool),
    Int(i64),
    String(String),
    /// Ordered sequence
    List(Vec<Value>),
    /// Unordered; compared as a multiset
    Set(Vec<Value>),
    /// Fixed-schema record
    Object(BTreeMap<String, Value>),
    /// Tagged union: active tag and its payload
    Variant(String, Box<Value>),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }

    /// `{}`, the "selected with no body" marker for variant payloads
    pub fn empty_object() -> Self {
        Self::Object(BTreeMap::new())
    }

    pub fn object<K, I>(fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Self::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn variant(tag: impl Into<String>, payload: Value) -> Self {
        Self::Variant(tag.into(), Box::new(payload))
    }

    pub fn strings<S: Into<String>>(items: impl IntoIterator<Item = S>) -> Self {
        Self::List(items.into_iter().map(|s| Self::String(s.into())).collect())
    }

    pub fn string_set<S: Into<String>>(items: impl IntoIterator<Item = S>) -> Self {
        Self::Set(items.into_iter().map(|s| Self::String(s.into())).collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }

    /// Whether no `Unknown` appears anywhere in the tree
    pub fn is_wholly_known(&self) -> bool {
        let mut known = true;
        self.walk(&mut |_, v| {
            if v.is_unknown() {
                known = false;
            }
        });
        known
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Object(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut BTreeMap<String, Value>> {
        match self {
            Self::Object(fields) => Some(fields),
            _ => None,
        }
    }

    /// Items of a list or set
    pub fn items(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) | Self::Set(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_variant(&self) -> Option<(&str, &Value)> {
        match self {
            Self::Variant(tag, payload) => Some((tag, payload)),
            _ => None,
        }
    }

    /// Field of an object, `Null` when missing or not an object
    pub fn get(&self, field: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.as_object()
            .and_then(|fields| fields.get(field))
            .unwrap_or(&NULL)
    }

    /// Follow a path; `Null` when any step is missing
    ///
    /// A `Tag` segment only matches when the variant's active tag is the
    /// one named. Applied to an object it selects the variant group whose
    /// active tag it names, so paths never spell out group names.
    pub fn at(&self, path: &AttrPath) -> &Value {
        use crate::path::PathSegment;
        static NULL: Value = Value::Null;

        let mut current = self;
        for segment in path.segments() {
            current = match (segment, current) {
                (PathSegment::Field(name), Value::Object(fields)) => {
                    fields.get(name).unwrap_or(&NULL)
                }
                (PathSegment::Index(i), Value::List(items) | Value::Set(items)) => {
                    items.get(*i).unwrap_or(&NULL)
                }
                (PathSegment::Tag(tag), Value::Variant(active, payload)) if tag == active => {
                    payload
                }
                (PathSegment::Tag(tag), Value::Object(fields)) => fields
                    .values()
                    .find_map(|v| match v {
                        Value::Variant(active, payload) if active == tag => Some(payload.as_ref()),
                        _ => None,
                    })
                    .unwrap_or(&NULL),
                _ => return &NULL,
            };
        }
        current
    }

    /// Structural equality
    ///
    /// `Unknown` is never equal to anything, including another `Unknown`.
    /// Sets compare as multisets.
    pub fn equal(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Unknown, _) | (_, Self::Unknown) => false,
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::List(a), Self::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.equal(y))
            }
            (Self::Set(a), Self::Set(b)) => {
                if a.len() != b.len() {
                    return false;
                }
                let mut a: Vec<&Value> = a.iter().collect();
                let mut b: Vec<&Value> = b.iter().collect();
                a.sort_by_cached_key(|v| v.canonical());
                b.sort_by_cached_key(|v| v.canonical());
                a.iter().zip(&b).all(|(x, y)| x.equal(y))
            }
            (Self::Object(a), Self::Object(b)) => {
                // A missing field and an explicit Null are the same thing.
                let keys: std::collections::BTreeSet<&String> = a.keys().chain(b.keys()).collect();
                keys.into_iter().all(|k| {
                    let x = a.get(k).unwrap_or(&Value::Null);
                    let y = b.get(k).unwrap_or(&Value::Null);
                    x.equal(y)
                })
            }
            (Self::Variant(ta, pa), Self::Variant(tb, pb)) => ta == tb && pa.equal(pb),
            _ => false,
        }
    }

    /// Pre-order traversal with the path of every node
    ///
    /// Variant groups inside an object are entered through their active tag.
    pub fn walk(&self, visitor: &mut dyn FnMut(&AttrPath, &Value)) {
        self.walk_from(&AttrPath::root(), visitor);
    }

    fn walk_from(&self, path: &AttrPath, visitor: &mut dyn FnMut(&AttrPath, &Value)) {
        visitor(path, self);
        match self {
            Self::List(items) | Self::Set(items) => {
                for (i, item) in items.iter().enumerate() {
                    item.walk_from(&path.index(i), visitor);
                }
            }
            Self::Object(fields) => {
                for (name, value) in fields {
                    match value {
                        Self::Variant(tag, payload) => payload.walk_from(&path.tag(tag), visitor),
                        value => value.walk_from(&path.field(name), visitor),
                    }
                }
            }
            Self::Variant(tag, payload) => payload.walk_from(&path.tag(tag), visitor),
            _ => {}
        }
    }

    /// Deterministic rendering used to order set elements
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        self.write_canonical(&mut out);
        out
    }

    fn write_canonical(&self, out: &mut String) {
        use std::fmt::Write;
        match self {
            Self::Null => out.push_str("null"),
            Self::Unknown => out.push_str("<unknown>"),
            Self::Bool(b) => {
                let _ = write!(out, "{b}");
            }
            Self::Int(i) => {
                let _ = write!(out, "{i}");
            }
            Self::String(s) => {
                let _ = write!(out, "{s:?}");
            }
            Self::List(items) | Self::Set(items) => {
                let mut rendered: Vec<String> = items.iter().map(Value::canonical).collect();
                if matches!(self, Self::Set(_)) {
                    rendered.sort();
                }
                out.push('[');
                out.push_str(&rendered.join(","));
                out.push(']');
            }
            Self::Object(fields) => {
                out.push('{');
                let mut first = true;
                for (name, value) in fields {
                    if value.is_null() {
                        continue;
                    }
                    if !first {
                        out.push(',');
                    }
                    first = false;
                    let _ = write!(out, "{name:?}:");
                    value.write_canonical(out);
                }
                out.push('}');
            }
            Self::Variant(tag, payload) => {
                let _ = write!(out, "<{tag}>");
                payload.write_canonical(out);
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.equal(other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}
