//! Conversion between [`Value`] trees and the device serialization
//!
//! The device speaks nested key/value documents (carried here as JSON).
//! Variant groups are flattened on the wire: the active alternative appears
//! as a field of the enclosing object, and its siblings are absent.
//!
//! Marshal is deterministic: object keys are sorted, lists keep their order,
//! and set elements are sorted by their serialized form.

use crate::error::{Error, Result};
use crate::path::{AttrPath, PathSegment};
use crate::schema::{NodeType, ObjectSchema, Presence};
use crate::value::Value;
use serde_json::{Map, Value as Raw};
use std::collections::{BTreeMap, BTreeSet};

/// Display form of a sensitive attribute
pub const REDACTED: &str = "(sensitive)";

/// Parse a device document into a value
///
/// Missing attributes become `Null`, never a zero value. Two alternatives of
/// one variant group being present is a `VariantConflict`; an attribute the
/// schema does not know is a schema-version mismatch.
///
/// Set elements keep the order the device sent them in. Marshal sorts them,
/// so a document with unsorted sets does not come back byte for byte; the
/// parsed values still compare equal.
pub fn parse(raw: &Raw, schema: &ObjectSchema) -> Result<Value> {
    let mut errors = Vec::new();
    let value = parse_object(raw, schema, &AttrPath::root(), &mut errors);
    match Error::from_many(errors) {
        Some(e) => Err(e),
        None => Ok(value),
    }
}

/// Serialize a value for the device
///
/// Refuses `Unknown` anywhere in the tree: every value sent to the device
/// must be known.
pub fn marshal(value: &Value, schema: &ObjectSchema) -> Result<Raw> {
    marshal_object(value, schema, &AttrPath::root())
}

fn parse_object(raw: &Raw, schema: &ObjectSchema, path: &AttrPath, errors: &mut Vec<Error>) -> Value {
    let Some(map) = raw.as_object() else {
        errors.push(mismatch(path, "object", raw));
        return Value::Null;
    };

    for key in map.keys() {
        if schema.attribute(key).is_none() {
            errors.push(Error::Schema {
                kind: path.to_string(),
                message: format!("unknown attribute '{key}' at {}", path.field(key)),
            });
        }
    }

    let mut fields = BTreeMap::new();
    for attr in schema.plain_attributes() {
        let field = match map.get(&attr.name) {
            None | Some(Raw::Null) => Value::Null,
            Some(raw) => parse_node(raw, &attr.node, &path.field(&attr.name), errors),
        };
        fields.insert(attr.name.clone(), field);
    }

    for group in &schema.groups {
        let present: Vec<_> = schema
            .group_members(&group.name)
            .into_iter()
            .filter(|m| map.get(&m.name).is_some_and(|v| !v.is_null()))
            .collect();
        let value = match present.as_slice() {
            [] => Value::Null,
            [member] => {
                let tag_path = path.tag(&member.name);
                let payload = parse_node(&map[&member.name], &member.node, &tag_path, errors);
                Value::variant(member.name.clone(), payload)
            }
            many => {
                errors.push(Error::VariantConflict {
                    path: path.field(&group.name),
                    tags: many.iter().map(|m| m.name.clone()).collect(),
                });
                Value::Null
            }
        };
        fields.insert(group.name.clone(), value);
    }

    Value::Object(fields)
}

fn parse_node(raw: &Raw, node: &NodeType, path: &AttrPath, errors: &mut Vec<Error>) -> Value {
    match (node, raw) {
        (NodeType::Bool, Raw::Bool(b)) => Value::Bool(*b),
        (NodeType::Int { .. }, Raw::Number(n)) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => {
                errors.push(mismatch(path, "integer", raw));
                Value::Null
            }
        },
        (NodeType::String(_), Raw::String(s)) => Value::String(s.clone()),
        (NodeType::List(element), Raw::Array(items)) => Value::List(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| parse_node(item, element, &path.index(i), errors))
                .collect(),
        ),
        (NodeType::Set { element, .. }, Raw::Array(items)) => Value::Set(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| parse_node(item, element, &path.index(i), errors))
                .collect(),
        ),
        (NodeType::Object(object), raw) => parse_object(raw, object, path, errors),
        (node, raw) => {
            errors.push(mismatch(path, node.type_name(), raw));
            Value::Null
        }
    }
}

fn marshal_object(value: &Value, schema: &ObjectSchema, path: &AttrPath) -> Result<Raw> {
    let fields = match value {
        Value::Object(fields) => fields,
        Value::Unknown => return Err(unknown(path)),
        other => {
            return Err(Error::validation(
                path.clone(),
                format!("expected object, got {other}"),
            ));
        }
    };

    let mut map = Map::new();
    for (name, field) in fields {
        if field.is_null() {
            continue;
        }
        if let Some(attr) = schema.plain_attributes().find(|a| &a.name == name) {
            map.insert(name.clone(), marshal_node(field, &attr.node, &path.field(name))?);
        } else if let Some(group) = schema.group(name) {
            let (tag, payload) = match field {
                Value::Variant(tag, payload) => (tag, payload),
                Value::Unknown => return Err(unknown(&path.field(name))),
                other => {
                    return Err(Error::validation(
                        path.field(name),
                        format!("expected variant, got {other}"),
                    ));
                }
            };
            let member = schema.member(&group.name, tag).ok_or_else(|| Error::Schema {
                kind: group.name.clone(),
                message: format!("{}: unknown variant '{tag}'", path.field(name)),
            })?;
            if payload.is_null() {
                return Err(Error::validation(
                    path.tag(tag),
                    "selected variant has no value",
                ));
            }
            map.insert(tag.clone(), marshal_node(payload, &member.node, &path.tag(tag))?);
        } else {
            return Err(Error::validation(path.field(name), "unsupported attribute"));
        }
    }
    Ok(Raw::Object(map))
}

fn marshal_node(value: &Value, node: &NodeType, path: &AttrPath) -> Result<Raw> {
    match (node, value) {
        (_, Value::Unknown) => Err(unknown(path)),
        (NodeType::Bool, Value::Bool(b)) => Ok(Raw::Bool(*b)),
        (NodeType::Int { .. }, Value::Int(i)) => Ok(Raw::from(*i)),
        (NodeType::String(_), Value::String(s)) => Ok(Raw::String(s.clone())),
        (NodeType::List(element), Value::List(items)) => items
            .iter()
            .enumerate()
            .map(|(i, item)| marshal_node(item, element, &path.index(i)))
            .collect::<Result<Vec<_>>>()
            .map(Raw::Array),
        (
            NodeType::Set {
                element,
                allow_duplicates,
            },
            Value::Set(items),
        ) => {
            let mut rendered = items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    let raw = marshal_node(item, element, &path.index(i))?;
                    Ok((raw.to_string(), raw))
                })
                .collect::<Result<Vec<_>>>()?;
            rendered.sort_by(|a, b| a.0.cmp(&b.0));
            if *allow_duplicates {
                rendered.dedup_by(|a, b| a.0 == b.0);
            }
            Ok(Raw::Array(rendered.into_iter().map(|(_, raw)| raw).collect()))
        }
        (NodeType::Object(object), value) => marshal_object(value, object, path),
        (node, other) => Err(Error::validation(
            path.clone(),
            format!("expected {}, got {other}", node.type_name()),
        )),
    }
}

/// Fill unset optional attributes with their schema defaults
///
/// Never descends into variant payloads: a default there would activate a
/// sibling tag the declaration did not select.
pub fn apply_defaults(value: &Value, schema: &ObjectSchema) -> Value {
    let Value::Object(fields) = value else {
        return value.clone();
    };

    let mut out = fields.clone();
    for attr in schema.plain_attributes() {
        let current = fields.get(&attr.name).unwrap_or(&Value::Null);
        let next = match (&attr.default, current) {
            (Some(default), Value::Null) => default.clone(),
            (_, current) => defaults_in_node(current, &attr.node),
        };
        out.insert(attr.name.clone(), next);
    }
    Value::Object(out)
}

fn defaults_in_node(value: &Value, node: &NodeType) -> Value {
    match (node, value) {
        (NodeType::Object(object), Value::Object(_)) => apply_defaults(value, object),
        (NodeType::List(element), Value::List(items)) => {
            Value::List(items.iter().map(|i| defaults_in_node(i, element)).collect())
        }
        (NodeType::Set { element, .. }, Value::Set(items)) => {
            Value::Set(items.iter().map(|i| defaults_in_node(i, element)).collect())
        }
        _ => value.clone(),
    }
}

/// Replace every computed attribute with `Null`
///
/// Used to compare declared and observed values modulo device-computed
/// fields.
pub fn strip_computed(value: &Value, schema: &ObjectSchema) -> Value {
    map_computed(value, schema, &|_| Value::Null)
}

/// Mark computed attributes that are still unset as `Unknown`
///
/// Planned state for a create: the device fills these in.
pub fn mark_computed_unknown(value: &Value, schema: &ObjectSchema) -> Value {
    map_computed(value, schema, &|current| {
        if current.is_null() {
            Value::Unknown
        } else {
            current.clone()
        }
    })
}

/// Replace the value of every sensitive attribute for display
pub fn redact(value: &Value, schema: &ObjectSchema) -> Value {
    let Value::Object(fields) = value else {
        return value.clone();
    };
    let mut out = fields.clone();
    for attr in &schema.attributes {
        let Some(current) = fields.get(&attr.name) else {
            continue;
        };
        if attr.sensitive && !current.is_null() {
            out.insert(attr.name.clone(), Value::string(REDACTED));
        } else if attr.group.is_none() {
            out.insert(attr.name.clone(), redact_node(current, &attr.node));
        }
    }
    for group in &schema.groups {
        if let Some(Value::Variant(tag, payload)) = fields.get(&group.name)
            && let Some(member) = schema.member(&group.name, tag)
        {
            let payload = if member.sensitive {
                Value::string(REDACTED)
            } else {
                redact_node(payload, &member.node)
            };
            out.insert(group.name.clone(), Value::variant(tag.clone(), payload));
        }
    }
    Value::Object(out)
}

fn redact_node(value: &Value, node: &NodeType) -> Value {
    match (node, value) {
        (NodeType::Object(object), Value::Object(_)) => redact(value, object),
        (NodeType::List(element), Value::List(items)) => {
            Value::List(items.iter().map(|i| redact_node(i, element)).collect())
        }
        (NodeType::Set { element, .. }, Value::Set(items)) => {
            Value::Set(items.iter().map(|i| redact_node(i, element)).collect())
        }
        _ => value.clone(),
    }
}

/// Drop repeated elements of sets whose schema lets duplicates collapse
///
/// The device keeps one copy of each such element, so both sides of a diff
/// go through this before they are compared.
pub fn collapse_duplicates(value: &Value, schema: &ObjectSchema) -> Value {
    let Value::Object(fields) = value else {
        return value.clone();
    };
    let mut out = fields.clone();
    for attr in schema.plain_attributes() {
        if let Some(current) = fields.get(&attr.name) {
            out.insert(attr.name.clone(), collapse_node(current, &attr.node));
        }
    }
    for group in &schema.groups {
        if let Some(Value::Variant(tag, payload)) = fields.get(&group.name)
            && let Some(member) = schema.member(&group.name, tag)
        {
            out.insert(group.name.clone(), Value::variant(tag.clone(), collapse_node(payload, &member.node)));
        }
    }
    Value::Object(out)
}

fn collapse_node(value: &Value, node: &NodeType) -> Value {
    match (node, value) {
        (NodeType::Object(object), Value::Object(_)) => collapse_duplicates(value, object),
        (NodeType::List(element), Value::List(items)) => {
            Value::List(items.iter().map(|i| collapse_node(i, element)).collect())
        }
        (
            NodeType::Set {
                element,
                allow_duplicates,
            },
            Value::Set(items),
        ) => {
            let mut seen = BTreeSet::new();
            Value::Set(
                items
                    .iter()
                    .map(|i| collapse_node(i, element))
                    .filter(|i| !*allow_duplicates || seen.insert(i.canonical()))
                    .collect(),
            )
        }
        _ => value.clone(),
    }
}

/// Whether the attribute at `path`, or one enclosing it, is sensitive
pub fn is_sensitive(schema: &ObjectSchema, path: &AttrPath) -> bool {
    let mut object = schema;
    let mut segments = path.segments().iter().peekable();
    while let Some(segment) = segments.next() {
        let attr = match segment {
            PathSegment::Field(name) if object.group(name).is_some() => continue,
            PathSegment::Field(name) | PathSegment::Tag(name) => match object.attribute(name) {
                Some(attr) => attr,
                None => return false,
            },
            PathSegment::Index(_) => return false,
        };
        if attr.sensitive {
            return true;
        }
        let mut node = &attr.node;
        while let (NodeType::List(element) | NodeType::Set { element, .. }, Some(PathSegment::Index(_))) =
            (node, segments.peek())
        {
            segments.next();
            node = &**element;
        }
        match node {
            NodeType::Object(inner) => object = inner,
            _ => return false,
        }
    }
    false
}

fn map_computed(value: &Value, schema: &ObjectSchema, f: &dyn Fn(&Value) -> Value) -> Value {
    let Value::Object(fields) = value else {
        return value.clone();
    };
    let mut out = fields.clone();
    for attr in &schema.attributes {
        if attr.presence == Presence::Computed && attr.group.is_none() {
            let current = fields.get(&attr.name).unwrap_or(&Value::Null);
            out.insert(attr.name.clone(), f(current));
        } else if let Some(current) = fields.get(&attr.name) {
            out.insert(attr.name.clone(), map_computed_node(current, &attr.node, f));
        }
    }
    for group in &schema.groups {
        if let Some(Value::Variant(tag, payload)) = fields.get(&group.name)
            && let Some(member) = schema.member(&group.name, tag)
        {
            out.insert(
                group.name.clone(),
                Value::variant(tag.clone(), map_computed_node(payload, &member.node, f)),
            );
        }
    }
    Value::Object(out)
}

fn map_computed_node(value: &Value, node: &NodeType, f: &dyn Fn(&Value) -> Value) -> Value {
    match (node, value) {
        (NodeType::Object(object), Value::Object(_)) => map_computed(value, object, f),
        (NodeType::List(element), Value::List(items)) => {
            Value::List(items.iter().map(|i| map_computed_node(i, element, f)).collect())
        }
        (NodeType::Set { element, .. }, Value::Set(items)) => {
            Value::Set(items.iter().map(|i| map_computed_node(i, element, f)).collect())
        }
        _ => value.clone(),
    }
}

/// Copy computed attributes from `observed` into `declared` where unset
///
/// Planned state for an update keeps the device-issued values.
pub fn carry_computed(declared: &Value, observed: &Value, schema: &ObjectSchema) -> Value {
    let (Value::Object(fields), Value::Object(seen)) = (declared, observed) else {
        return declared.clone();
    };
    let mut out = fields.clone();
    for attr in schema.plain_attributes() {
        let current = fields.get(&attr.name).unwrap_or(&Value::Null);
        let prior = seen.get(&attr.name).unwrap_or(&Value::Null);
        if attr.presence == Presence::Computed {
            if current.is_null() || current.is_unknown() {
                out.insert(attr.name.clone(), prior.clone());
            }
        } else if let NodeType::Object(object) = &attr.node {
            out.insert(attr.name.clone(), carry_computed(current, prior, object));
        }
    }
    Value::Object(out)
}

fn unknown(path: &AttrPath) -> Error {
    Error::validation(path.clone(), "value is not known until apply")
}

fn mismatch(path: &AttrPath, expected: &str, raw: &Raw) -> Error {
    let got = match raw {
        Raw::Null => "null",
        Raw::Bool(_) => "bool",
        Raw::Number(_) => "number",
        Raw::String(_) => "string",
        Raw::Array(_) => "array",
        Raw::Object(_) => "object",
    };
    Error::validation(path.clone(), format!("expected {expected}, got {got}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::kinds;
    use serde_json::json;

    fn body(kind: &str) -> ObjectSchema {
        kinds::builtin_registry().lookup(kind).unwrap().body.clone()
    }

    #[test]
    fn test_redact_hides_sensitive_attributes() {
        let value = Value::object([
            ("username", Value::from("admin")),
            ("password", Value::from("hunter2")),
            ("key", Value::Null),
        ]);
        let shown = redact(&value, &body("api_key"));
        assert_eq!(shown.get("username").as_str(), Some("admin"));
        assert_eq!(shown.get("password").as_str(), Some(REDACTED));
        assert!(shown.get("key").is_null());
    }

    #[test]
    fn test_sensitive_path_lookup() {
        assert!(is_sensitive(&body("api_key"), &AttrPath::from_fields(&["password"])));
        assert!(!is_sensitive(&body("api_key"), &AttrPath::from_fields(&["username"])));
        let as_path = AttrPath::from_fields(&["rules"]).index(0).field("action").tag("allow");
        assert!(!is_sensitive(&body("bgp_export_rules"), &as_path.field("update")));
    }

    #[test]
    fn test_parse_flattened_variant() {
        let value = parse(&json!({"ip_netmask": "8.8.8.8/32"}), &body("address")).unwrap();
        assert_eq!(
            value.get("value"),
            &Value::variant("ip_netmask", Value::from("8.8.8.8/32"))
        );
        assert!(value.get("description").is_null());
    }

    #[test]
    fn test_parse_rejects_two_variant_siblings() {
        let err = parse(
            &json!({"ip_netmask": "10.0.0.1", "fqdn": "example.com"}),
            &body("address"),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VariantConflict);
        assert!(err.to_string().contains("ip_netmask, fqdn"));
    }

    #[test]
    fn test_parse_null_sibling_is_not_a_conflict() {
        let value = parse(
            &json!({"ip_netmask": null, "fqdn": "example.com"}),
            &body("address"),
        )
        .unwrap();
        assert_eq!(value.get("value").as_variant().unwrap().0, "fqdn");
    }

    #[test]
    fn test_parse_unknown_attribute_is_schema_mismatch() {
        let err = parse(&json!({"fqdn": "a.b", "mac": "x"}), &body("address")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Schema);
    }

    #[test]
    fn test_parse_type_mismatch() {
        let err = parse(&json!({"fqdn": 42}), &body("address")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().starts_with("fqdn: expected string"));
    }

    #[test]
    fn test_empty_object_marker_roundtrips() {
        let schema = body("bgp_export_rule");
        let raw = json!({
            "action": {"allow": {"update": {"as_path": {"remove": {}}}}}
        });
        let value = parse(&raw, &schema).unwrap();
        let as_path = AttrPath::from_fields(&["action"])
            .tag("allow")
            .field("update")
            .field("as_path");
        assert_eq!(
            value.at(&as_path).get("type"),
            &Value::variant("remove", Value::empty_object())
        );
        assert_eq!(marshal(&value, &schema).unwrap(), raw);
    }

    #[test]
    fn test_roundtrip_canonical_documents() {
        let cases = [
            ("address", json!({"description": "dns", "ip_netmask": "8.8.8.8/32", "tags": ["a", "b"]})),
            ("address_group", json!({"static": ["a", "b"]})),
            ("service", json!({"tcp": {"destination_port": "443"}, "timeout": 30})),
            (
                "security_rule",
                json!({
                    "action": "allow",
                    "destination_addresses": ["any"],
                    "disabled": false,
                    "source_addresses": ["a", "g"],
                    "uuid": "00000000-0000-0000-0000-000000000001"
                }),
            ),
        ];
        for (kind, raw) in cases {
            let schema = body(kind);
            let value = parse(&raw, &schema).unwrap();
            assert_eq!(marshal(&value, &schema).unwrap(), raw, "{kind}");
        }
    }

    #[test]
    fn test_marshal_sorts_sets() {
        let schema = body("address_group");
        let value = Value::object([("members", Value::variant("static", Value::string_set(["z", "a", "m"])))]);
        assert_eq!(marshal(&value, &schema).unwrap(), json!({"static": ["a", "m", "z"]}));
    }

    #[test]
    fn test_unsorted_set_survives_as_equal_value() {
        let schema = body("address_group");
        let raw = json!({"static": ["z", "a", "m"]});
        let value = parse(&raw, &schema).unwrap();
        let written = marshal(&value, &schema).unwrap();
        assert_eq!(written, json!({"static": ["a", "m", "z"]}));
        assert!(parse(&written, &schema).unwrap().equal(&value));
    }

    #[test]
    fn test_collapsing_set_writes_each_element_once() {
        let schema = ObjectSchema::new().attr(crate::schema::Attribute::optional(
            "members",
            NodeType::collapsing_set(NodeType::string()),
        ));
        let declared = Value::object([("members", Value::string_set(["b", "a", "b"]))]);
        let written = marshal(&declared, &schema).unwrap();
        assert_eq!(written, json!({"members": ["a", "b"]}));

        let read_back = parse(&written, &schema).unwrap();
        assert!(!read_back.equal(&declared));
        assert!(collapse_duplicates(&read_back, &schema).equal(&collapse_duplicates(&declared, &schema)));
    }

    #[test]
    fn test_marshal_emits_only_active_sibling() {
        let schema = body("address");
        let value = Value::object([("value", Value::variant("fqdn", Value::from("a.example")))]);
        let raw = marshal(&value, &schema).unwrap();
        let map = raw.as_object().unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("fqdn"));
    }

    #[test]
    fn test_marshal_refuses_unknown() {
        let schema = body("address");
        let value = Value::object([("value", Value::Unknown)]);
        assert!(marshal(&value, &schema).is_err());
    }

    #[test]
    fn test_defaults_skip_variant_payloads() {
        let schema = body("security_rule");
        let value = apply_defaults(&Value::object([("action", Value::from("deny"))]), &schema);
        assert_eq!(value.get("disabled"), &Value::Bool(false));

        let schema = body("bgp_export_rule");
        let value = apply_defaults(
            &Value::object([(
                "action",
                Value::object([("type", Value::variant("allow", Value::empty_object()))]),
            )]),
            &schema,
        );
        let allow = value.get("action").get("type").as_variant().unwrap().1;
        assert!(allow.get("update").is_null());
    }

    #[test]
    fn test_strip_and_mark_computed() {
        let schema = body("security_rule");
        let value = Value::object([
            ("action", Value::from("allow")),
            ("uuid", Value::from("abc")),
        ]);
        assert!(strip_computed(&value, &schema).get("uuid").is_null());

        let planned = mark_computed_unknown(&Value::object([("action", Value::from("allow"))]), &schema);
        assert!(planned.get("uuid").is_unknown());
    }

    #[test]
    fn test_carry_computed_keeps_device_values() {
        let schema = body("security_rule");
        let declared = Value::object([("action", Value::from("deny"))]);
        let observed = Value::object([("action", Value::from("allow")), ("uuid", Value::from("u-1"))]);
        let planned = carry_computed(&declared, &observed, &schema);
        assert_eq!(planned.get("uuid"), &Value::from("u-1"));
        assert_eq!(planned.get("action"), &Value::from("deny"));
    }
}
