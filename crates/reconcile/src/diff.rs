//! Diff computation for resources

use crate::codec;
use crate::error::Result;
use crate::path::AttrPath;
use crate::schema::{NodeType, ObjectSchema, SchemaRegistry};
use crate::types::{Resource, ResourceKey};
use crate::value::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Resources keyed by identity
pub type ResourceMap = BTreeMap<ResourceKey, Resource>;

/// How a resource differs between declared and observed state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Change {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// One changed attribute inside an update
#[derive(Debug, Clone, PartialEq)]
pub enum FieldChange {
    /// Attribute gets a new value
    Set {
        path: AttrPath,
        old: Value,
        new: Value,
    },
    /// Attribute is removed and must reach the device as unset
    Unset { path: AttrPath, old: Value },
    /// A variant group changes its active tag
    SwitchVariant {
        path: AttrPath,
        group: String,
        from: String,
        to: String,
    },
}

impl FieldChange {
    pub fn path(&self) -> &AttrPath {
        match self {
            Self::Set { path, .. } | Self::Unset { path, .. } | Self::SwitchVariant { path, .. } => {
                path
            }
        }
    }
}

/// A diff between observed and declared state of a resource
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDiff {
    pub key: ResourceKey,
    pub change: Change,
    /// Observed resource; absent for creates
    pub observed: Option<Resource>,
    /// Declared resource; absent for deletes
    pub declared: Option<Resource>,
    /// Changed attributes; only filled for updates
    pub fields: Vec<FieldChange>,
}

/// Compute diffs between declared and observed resources
///
/// Returns only resources that differ, sorted by key. Bodies are compared
/// modulo computed attributes.
pub fn compute_diffs(
    registry: &SchemaRegistry,
    declared: &ResourceMap,
    observed: &ResourceMap,
) -> Result<Vec<ResourceDiff>> {
    let mut diffs = Vec::new();

    for (key, want) in declared {
        let schema = registry.lookup(&key.kind)?;
        match observed.get(key) {
            None => diffs.push(ResourceDiff {
                key: key.clone(),
                change: Change::Create,
                observed: None,
                declared: Some(want.clone()),
                fields: Vec::new(),
            }),
            Some(have) => {
                let fields = field_changes(&schema.body, &have.body, &want.body);
                if !fields.is_empty() {
                    diffs.push(ResourceDiff {
                        key: key.clone(),
                        change: Change::Update,
                        observed: Some(have.clone()),
                        declared: Some(want.clone()),
                        fields,
                    });
                }
            }
        }
    }

    for (key, have) in observed {
        if !declared.contains_key(key) {
            diffs.push(ResourceDiff {
                key: key.clone(),
                change: Change::Delete,
                observed: Some(have.clone()),
                declared: None,
                fields: Vec::new(),
            });
        }
    }

    diffs.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(diffs)
}

/// Attribute-level changes from `old` to `new`, ignoring computed fields
///
/// Empty exactly when the two bodies are equal modulo computed fields and
/// duplicates the schema collapses.
pub fn field_changes(schema: &ObjectSchema, old: &Value, new: &Value) -> Vec<FieldChange> {
    let old = codec::collapse_duplicates(&codec::strip_computed(old, schema), schema);
    let new = codec::collapse_duplicates(&codec::strip_computed(new, schema), schema);
    let mut changes = Vec::new();
    diff_object(schema, &old, &new, &AttrPath::root(), &mut changes);
    changes
}

fn diff_object(
    schema: &ObjectSchema,
    old: &Value,
    new: &Value,
    path: &AttrPath,
    changes: &mut Vec<FieldChange>,
) {
    if !matches!((old, new), (Value::Object(_), Value::Object(_))) {
        diff_leaf(old, new, path, changes);
        return;
    }

    for attr in schema.plain_attributes() {
        let field_path = path.field(&attr.name);
        let (a, b) = (old.get(&attr.name), new.get(&attr.name));
        match &attr.node {
            NodeType::Object(object) if !a.is_null() && !b.is_null() => {
                diff_object(object, a, b, &field_path, changes);
            }
            _ => diff_leaf(a, b, &field_path, changes),
        }
    }

    for group in &schema.groups {
        match (old.get(&group.name), new.get(&group.name)) {
            (Value::Variant(from, a), Value::Variant(to, b)) if from == to => {
                let tag_path = path.tag(to);
                match schema.member(&group.name, to).map(|m| &m.node) {
                    Some(NodeType::Object(object)) => diff_object(object, a, b, &tag_path, changes),
                    _ => diff_leaf(a, b, &tag_path, changes),
                }
            }
            (Value::Variant(from, a), Value::Variant(to, b)) => {
                changes.push(FieldChange::SwitchVariant {
                    path: path.clone(),
                    group: group.name.clone(),
                    from: from.clone(),
                    to: to.clone(),
                });
                changes.push(FieldChange::Unset {
                    path: path.tag(from),
                    old: (**a).clone(),
                });
                changes.push(FieldChange::Set {
                    path: path.tag(to),
                    old: Value::Null,
                    new: (**b).clone(),
                });
            }
            (Value::Variant(from, a), b) if b.is_null() => changes.push(FieldChange::Unset {
                path: path.tag(from),
                old: (**a).clone(),
            }),
            (a, Value::Variant(to, b)) if a.is_null() => changes.push(FieldChange::Set {
                path: path.tag(to),
                old: Value::Null,
                new: (**b).clone(),
            }),
            (a, b) => diff_leaf(a, b, &path.field(&group.name), changes),
        }
    }
}

fn diff_leaf(old: &Value, new: &Value, path: &AttrPath, changes: &mut Vec<FieldChange>) {
    if old.equal(new) {
        return;
    }
    if new.is_null() {
        changes.push(FieldChange::Unset {
            path: path.clone(),
            old: old.clone(),
        });
    } else {
        changes.push(FieldChange::Set {
            path: path.clone(),
            old: old.clone(),
            new: new.clone(),
        });
    }
}

/// Diff summary statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffSummary {
    pub additions: usize,
    pub removals: usize,
    pub modifications: usize,
}

impl DiffSummary {
    /// Create a summary from a list of diffs
    pub fn from_diffs(diffs: &[ResourceDiff]) -> Self {
        let mut summary = Self::default();
        for diff in diffs {
            match diff.change {
                Change::Create => summary.additions += 1,
                Change::Delete => summary.removals += 1,
                Change::Update => summary.modifications += 1,
            }
        }
        summary
    }

    /// Total number of changes
    pub fn total(&self) -> usize {
        self.additions + self.removals + self.modifications
    }

    /// Check if there are any changes
    pub fn has_changes(&self) -> bool {
        self.total() > 0
    }
}
