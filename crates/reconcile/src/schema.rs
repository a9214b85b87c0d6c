//! Schema registry
//!
//! Every resource kind is a record in the registry rather than a Rust type.
//! A [`Schema`] describes the admissible locations, the attribute tree, the
//! variant groups and, for rule lists, the ordered collection the kind owns.
//! The engine is polymorphic over what the schema provides: parse, marshal,
//! validate, equality modulo computed fields, and reference extraction.

use crate::error::{Diagnostic, Error, Result};
use crate::location::LocationKind;
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Maximum name length when a schema does not set one
pub const DEFAULT_NAME_MAX_LEN: usize = 63;

/// Whether an attribute must, may, or cannot be declared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Required,
    Optional,
    /// Filled in by the device (e.g. a uuid issued on create)
    Computed,
}

/// Marks a string as the name of another resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Kinds the name may resolve to, tried in order
    pub kinds: Vec<String>,
    /// Literal values that are not references (e.g. `any`)
    pub wildcards: Vec<String>,
}

impl Reference {
    pub fn to(kinds: &[&str]) -> Self {
        Self {
            kinds: kinds.iter().map(|k| (*k).to_string()).collect(),
            wildcards: Vec::new(),
        }
    }

    pub fn with_wildcard(mut self, literal: &str) -> Self {
        self.wildcards.push(literal.to_string());
        self
    }

    pub fn is_wildcard(&self, value: &str) -> bool {
        self.wildcards.iter().any(|w| w == value)
    }
}

/// Constraints on a string leaf
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringSpec {
    /// Enumerated values; empty means unconstrained
    pub one_of: Vec<String>,
    pub max_len: Option<usize>,
    pub reference: Option<Reference>,
}

/// Type of an attribute node
#[derive(Debug, Clone, PartialEq)]
pub enum NodeType {
    Bool,
    Int {
        min: Option<i64>,
        max: Option<i64>,
    },
    String(StringSpec),
    List(Box<NodeType>),
    Set {
        element: Box<NodeType>,
        /// Duplicates collapse instead of being an error
        allow_duplicates: bool,
    },
    Object(ObjectSchema),
}

impl NodeType {
    pub fn string() -> Self {
        Self::String(StringSpec::default())
    }

    pub fn bounded_string(max_len: usize) -> Self {
        Self::String(StringSpec {
            max_len: Some(max_len),
            ..Default::default()
        })
    }

    pub fn one_of(values: &[&str]) -> Self {
        Self::String(StringSpec {
            one_of: values.iter().map(|v| (*v).to_string()).collect(),
            ..Default::default()
        })
    }

    pub fn reference(reference: Reference) -> Self {
        Self::String(StringSpec {
            reference: Some(reference),
            ..Default::default()
        })
    }

    pub fn int() -> Self {
        Self::Int {
            min: None,
            max: None,
        }
    }

    pub fn int_range(min: i64, max: i64) -> Self {
        Self::Int {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn list(element: NodeType) -> Self {
        Self::List(Box::new(element))
    }

    pub fn set(element: NodeType) -> Self {
        Self::Set {
            element: Box::new(element),
            allow_duplicates: false,
        }
    }

    /// Set in which repeated elements fold into one
    pub fn collapsing_set(element: NodeType) -> Self {
        Self::Set {
            element: Box::new(element),
            allow_duplicates: true,
        }
    }

    pub fn object(schema: ObjectSchema) -> Self {
        Self::Object(schema)
    }

    /// `{}` marker: an object with no attributes
    pub fn marker() -> Self {
        Self::Object(ObjectSchema::new())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int { .. } => "int",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Set { .. } => "set",
            Self::Object(_) => "object",
        }
    }
}

/// One attribute of an object
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub node: NodeType,
    pub presence: Presence,
    pub default: Option<Value>,
    /// Variant group this attribute is an alternative of
    pub group: Option<String>,
    /// Rendered as `(sensitive)` in plans and logs
    pub sensitive: bool,
}

impl Attribute {
    fn new(name: &str, node: NodeType, presence: Presence) -> Self {
        Self {
            name: name.to_string(),
            node,
            presence,
            default: None,
            group: None,
            sensitive: false,
        }
    }

    pub fn required(name: &str, node: NodeType) -> Self {
        Self::new(name, node, Presence::Required)
    }

    pub fn optional(name: &str, node: NodeType) -> Self {
        Self::new(name, node, Presence::Optional)
    }

    pub fn computed(name: &str, node: NodeType) -> Self {
        Self::new(name, node, Presence::Computed)
    }

    /// Alternative of variant group `group`
    pub fn variant(group: &str, name: &str, node: NodeType) -> Self {
        let mut attr = Self::new(name, node, Presence::Optional);
        attr.group = Some(group.to_string());
        attr
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn is_computed(&self) -> bool {
        self.presence == Presence::Computed
    }
}

/// A closed set of alternatives; at most one may be set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantGroup {
    pub name: String,
    /// Exactly one alternative must be set
    pub required: bool,
}

/// Attribute tree of an object
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectSchema {
    pub attributes: Vec<Attribute>,
    pub groups: Vec<VariantGroup>,
}

impl ObjectSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attr(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Declare a variant group where exactly one alternative must be set
    pub fn one_of(mut self, group: &str) -> Self {
        self.groups.push(VariantGroup {
            name: group.to_string(),
            required: true,
        });
        self
    }

    /// Declare a variant group where at most one alternative may be set
    pub fn at_most_one_of(mut self, group: &str) -> Self {
        self.groups.push(VariantGroup {
            name: group.to_string(),
            required: false,
        });
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn group(&self, name: &str) -> Option<&VariantGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Attributes that are not variant alternatives
    pub fn plain_attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter().filter(|a| a.group.is_none())
    }

    /// Alternatives of a variant group, in declaration order
    pub fn group_members(&self, group: &str) -> Vec<&Attribute> {
        self.attributes
            .iter()
            .filter(|a| a.group.as_deref() == Some(group))
            .collect()
    }

    /// The group alternative named `tag`
    pub fn member(&self, group: &str, tag: &str) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|a| a.name == tag && a.group.as_deref() == Some(group))
    }
}

/// An attribute whose element order is evaluation order on the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedCollection {
    /// List attribute holding the entries, e.g. `rules`
    pub attribute: String,
    /// Kind each entry is written as on the device
    pub element_kind: String,
}

/// Schema for one resource kind
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    pub kind: String,
    pub description: String,
    /// Admissible location variants
    pub locations: Vec<LocationKind>,
    pub body: ObjectSchema,
    pub ordered: Option<OrderedCollection>,
    /// Issued on apply and never persisted
    pub ephemeral: bool,
    pub name_max_len: usize,
    /// Set for kinds derived from an ordered collection's entries
    pub element_of: Option<String>,
}

impl Schema {
    pub fn new(kind: &str, locations: &[LocationKind], body: ObjectSchema) -> Self {
        Self {
            kind: kind.to_string(),
            description: String::new(),
            locations: locations.to_vec(),
            body,
            ordered: None,
            ephemeral: false,
            name_max_len: DEFAULT_NAME_MAX_LEN,
            element_of: None,
        }
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Declare `attribute` as an ordered collection of `element_kind` entries
    pub fn ordered(mut self, attribute: &str, element_kind: &str) -> Self {
        self.ordered = Some(OrderedCollection {
            attribute: attribute.to_string(),
            element_kind: element_kind.to_string(),
        });
        self
    }

    pub fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }

    pub fn name_max_len(mut self, max: usize) -> Self {
        self.name_max_len = max;
        self
    }

    pub fn allows(&self, location: LocationKind) -> bool {
        self.locations.contains(&location)
    }

    /// Entry schema of the ordered collection list, including `name`
    pub fn ordered_entry(&self) -> Option<&ObjectSchema> {
        let ordered = self.ordered.as_ref()?;
        match &self.body.attribute(&ordered.attribute)?.node {
            NodeType::List(element) => match element.as_ref() {
                NodeType::Object(entry) => Some(entry),
                _ => None,
            },
            _ => None,
        }
    }
}

fn schema_err(kind: &str, message: impl Into<String>) -> Error {
    Error::Schema {
        kind: kind.to_string(),
        message: message.into(),
    }
}

/// Immutable catalog of resource kinds
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, Arc<Schema>>,
}

impl SchemaRegistry {
    pub fn builder() -> SchemaRegistryBuilder {
        SchemaRegistryBuilder::default()
    }

    /// Schema for `kind`, or `UnknownKind`
    pub fn lookup(&self, kind: &str) -> Result<&Schema> {
        self.schemas
            .get(kind)
            .map(Arc::as_ref)
            .ok_or_else(|| Error::UnknownKind {
                kind: kind.to_string(),
            })
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.schemas.contains_key(kind)
    }

    /// Registered kinds in lexicographic order
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    pub fn schemas(&self) -> impl Iterator<Item = &Schema> {
        self.schemas.values().map(Arc::as_ref)
    }

    /// Check a value against the kind's schema
    pub fn validate(&self, kind: &str, value: &Value) -> Vec<Diagnostic> {
        match self.lookup(kind) {
            Ok(schema) => crate::validate::check_body(schema, value)
                .iter()
                .map(Diagnostic::from)
                .collect(),
            Err(e) => vec![Diagnostic::from(&e)],
        }
    }
}

/// Collects schemas, checks them, and freezes them into a registry
#[derive(Debug, Default)]
pub struct SchemaRegistryBuilder {
    schemas: BTreeMap<String, Schema>,
}

impl SchemaRegistryBuilder {
    /// Register a schema; ordered collections also register their entry kind
    pub fn register(mut self, schema: Schema) -> Result<Self> {
        check_schema(&schema)?;

        if let Some(element) = element_schema(&schema)? {
            self.insert(element)?;
        }
        self.insert(schema)?;
        Ok(self)
    }

    fn insert(&mut self, schema: Schema) -> Result<()> {
        if self.schemas.contains_key(&schema.kind) {
            return Err(schema_err(&schema.kind, "kind registered twice"));
        }
        log::debug!("Registered schema for {}", schema.kind);
        self.schemas.insert(schema.kind.clone(), schema);
        Ok(())
    }

    pub fn build(self) -> SchemaRegistry {
        SchemaRegistry {
            schemas: self
                .schemas
                .into_iter()
                .map(|(k, s)| (k, Arc::new(s)))
                .collect(),
        }
    }
}

/// Derive the device-side schema of an ordered collection's entries
fn element_schema(schema: &Schema) -> Result<Option<Schema>> {
    let Some(ordered) = &schema.ordered else {
        return Ok(None);
    };
    let entry = schema.ordered_entry().ok_or_else(|| {
        schema_err(
            &schema.kind,
            format!("ordered attribute '{}' must be a list of objects", ordered.attribute),
        )
    })?;

    match entry.attribute("name") {
        Some(name) if name.presence == Presence::Required && matches!(name.node, NodeType::String(_)) => {}
        _ => {
            return Err(schema_err(
                &schema.kind,
                "ordered collection entries need a required string 'name'",
            ));
        }
    }

    let body = ObjectSchema {
        attributes: entry
            .attributes
            .iter()
            .filter(|a| a.name != "name")
            .cloned()
            .collect(),
        groups: entry.groups.clone(),
    };

    let mut element = Schema::new(&ordered.element_kind, &schema.locations, body)
        .describe(&format!("entry of {}", schema.kind));
    element.element_of = Some(schema.kind.clone());
    Ok(Some(element))
}

fn check_schema(schema: &Schema) -> Result<()> {
    if schema.locations.is_empty() {
        return Err(schema_err(&schema.kind, "no admissible locations"));
    }
    if let Some(ordered) = &schema.ordered {
        if schema.body.attributes.len() != 1 || !schema.body.groups.is_empty() {
            return Err(schema_err(
                &schema.kind,
                format!(
                    "ordered collection kinds may only declare '{}'",
                    ordered.attribute
                ),
            ));
        }
    }
    check_object(&schema.kind, &schema.body, false)
}

fn check_object(kind: &str, object: &ObjectSchema, in_variant: bool) -> Result<()> {
    let mut seen = BTreeSet::new();
    for attr in &object.attributes {
        if !seen.insert(attr.name.as_str()) {
            return Err(schema_err(kind, format!("attribute '{}' declared twice", attr.name)));
        }
    }
    for group in &object.groups {
        if !seen.insert(group.name.as_str()) {
            return Err(schema_err(
                kind,
                format!("variant group '{}' clashes with another name", group.name),
            ));
        }
        if object.group_members(&group.name).is_empty() {
            return Err(schema_err(
                kind,
                format!("variant group '{}' has no alternatives", group.name),
            ));
        }
    }

    for attr in &object.attributes {
        let member = attr.group.is_some();
        if let Some(group) = &attr.group {
            if object.group(group).is_none() {
                return Err(schema_err(
                    kind,
                    format!("'{}' belongs to undeclared group '{group}'", attr.name),
                ));
            }
            if attr.presence != Presence::Optional {
                return Err(schema_err(
                    kind,
                    format!("variant alternative '{}' must be optional", attr.name),
                ));
            }
        }
        if attr.default.is_some() {
            // Defaults inside a variant payload would activate a sibling tag.
            if member || in_variant {
                return Err(schema_err(
                    kind,
                    format!("'{}' is inside a variant and cannot carry a default", attr.name),
                ));
            }
            if attr.presence != Presence::Optional {
                return Err(schema_err(
                    kind,
                    format!("only optional attributes may have defaults ('{}')", attr.name),
                ));
            }
        }
        check_node(kind, &attr.node, in_variant || member)?;
    }
    Ok(())
}

fn check_node(kind: &str, node: &NodeType, in_variant: bool) -> Result<()> {
    match node {
        NodeType::List(element) | NodeType::Set { element, .. } => {
            check_node(kind, element, in_variant)
        }
        NodeType::Object(object) => check_object(kind, object, in_variant),
        NodeType::Int {
            min: Some(min),
            max: Some(max),
        } if min > max => Err(schema_err(kind, format!("empty int range {min}..{max}"))),
        _ => Ok(()),
    }
}
