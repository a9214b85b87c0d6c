//! Schema validation of declared values

use crate::error::Error;
use crate::path::AttrPath;
use crate::schema::{NodeType, ObjectSchema, Presence, Schema, SchemaRegistry};
use crate::types::{Resource, ResourceKey};
use crate::value::Value;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

static NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9A-Za-z][0-9A-Za-z ._\-]*$").expect("name pattern is a valid regex")
});

/// Validate a whole resource: location, name, and body
pub fn check_resource(registry: &SchemaRegistry, resource: &Resource) -> Vec<Error> {
    let schema = match registry.lookup(resource.kind()) {
        Ok(schema) => schema,
        Err(e) => return vec![e],
    };

    let mut errors = Vec::new();
    let location = resource.location().kind();
    if !schema.allows(location) {
        errors.push(Error::validation(
            AttrPath::root(),
            format!(
                "{} cannot be placed in location '{}' (allowed: {})",
                schema.kind,
                location,
                schema
                    .locations
                    .iter()
                    .map(|l| l.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        ));
    }
    if let Err(e) = check_name(schema, resource.name()) {
        errors.push(e);
    }
    errors.extend(check_body(schema, &resource.body));
    errors.extend(check_ordered_names(schema, &resource.key, &resource.body));
    errors
}

/// Check a name against the schema's length and character rules
pub fn check_name(schema: &Schema, name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::validation(AttrPath::root(), "name cannot be empty"));
    }
    if name.chars().count() > schema.name_max_len {
        return Err(Error::validation(
            AttrPath::root(),
            format!(
                "name '{name}' is longer than {} characters",
                schema.name_max_len
            ),
        ));
    }
    if !NAME_PATTERN.is_match(name) {
        return Err(Error::validation(
            AttrPath::root(),
            format!(
                "name '{name}' must start with a letter or digit and contain only letters, digits, spaces, '.', '_' or '-'"
            ),
        ));
    }
    Ok(())
}

/// Validate a body value against a schema
pub fn check_body(schema: &Schema, value: &Value) -> Vec<Error> {
    let mut errors = Vec::new();
    check_object(&schema.body, value, &AttrPath::root(), &mut errors);
    errors
}

/// Names inside an ordered collection must be unique
pub fn check_ordered_names(schema: &Schema, key: &ResourceKey, value: &Value) -> Vec<Error> {
    let Some(ordered) = &schema.ordered else {
        return Vec::new();
    };
    let Some(entries) = value.get(&ordered.attribute).items() else {
        return Vec::new();
    };

    let mut seen = BTreeSet::new();
    let mut errors = Vec::new();
    let base = AttrPath::root().field(&ordered.attribute);
    for (i, entry) in entries.iter().enumerate() {
        if let Some(name) = entry.get("name").as_str()
            && !seen.insert(name)
        {
            errors.push(Error::DuplicateOrderedName {
                collection: key.clone(),
                name: name.to_string(),
                path: base.index(i).field("name"),
            });
        }
    }
    errors
}

fn check_object(schema: &ObjectSchema, value: &Value, path: &AttrPath, errors: &mut Vec<Error>) {
    let fields = match value {
        Value::Object(fields) => fields,
        Value::Unknown => return,
        other => {
            errors.push(type_mismatch(path, "object", other));
            return;
        }
    };

    for name in fields.keys() {
        let known = schema.plain_attributes().any(|a| &a.name == name) || schema.group(name).is_some();
        if !known {
            errors.push(Error::validation(
                path.field(name),
                "unsupported attribute",
            ));
        }
    }

    for attr in schema.plain_attributes() {
        let field_path = path.field(&attr.name);
        let field = fields.get(&attr.name).unwrap_or(&Value::Null);
        match (attr.presence, field) {
            (Presence::Required, Value::Null) => {
                errors.push(Error::validation(field_path, "required attribute is missing"));
            }
            (Presence::Computed, Value::Null | Value::Unknown) => {}
            (Presence::Computed, _) => {
                errors.push(Error::validation(
                    field_path,
                    "attribute is computed by the device and cannot be set",
                ));
            }
            (_, Value::Null) => {}
            (_, field) => check_node(&attr.node, field, &field_path, errors),
        }
    }

    for group in &schema.groups {
        let group_path = path.field(&group.name);
        let members = schema.group_members(&group.name);
        match fields.get(&group.name).unwrap_or(&Value::Null) {
            Value::Null => {
                if group.required {
                    errors.push(Error::validation(
                        group_path,
                        format!(
                            "exactly one of [{}] must be set",
                            members
                                .iter()
                                .map(|m| m.name.as_str())
                                .collect::<Vec<_>>()
                                .join(", ")
                        ),
                    ));
                }
            }
            Value::Unknown => {}
            Value::Variant(tag, payload) => match schema.member(&group.name, tag) {
                Some(member) => {
                    let tag_path = path.tag(tag);
                    if payload.is_null() {
                        errors.push(Error::validation(
                            tag_path,
                            "selected variant needs a value (use {} for an empty body)",
                        ));
                    } else {
                        check_node(&member.node, payload, &tag_path, errors);
                    }
                }
                None => errors.push(Error::Schema {
                    kind: group.name.clone(),
                    message: format!("{group_path}: unknown variant '{tag}'"),
                }),
            },
            other => errors.push(type_mismatch(&group_path, "variant", other)),
        }
    }
}

fn check_node(node: &NodeType, value: &Value, path: &AttrPath, errors: &mut Vec<Error>) {
    if value.is_unknown() {
        return;
    }
    match (node, value) {
        (NodeType::Bool, Value::Bool(_)) => {}
        (NodeType::Int { min, max }, Value::Int(i)) => {
            if min.is_some_and(|m| *i < m) || max.is_some_and(|m| *i > m) {
                errors.push(Error::validation(
                    path.clone(),
                    format!(
                        "{i} is out of range {}..={}",
                        min.map_or("-inf".to_string(), |m| m.to_string()),
                        max.map_or("inf".to_string(), |m| m.to_string())
                    ),
                ));
            }
        }
        (NodeType::String(spec), Value::String(s)) => {
            if !spec.one_of.is_empty() && !spec.one_of.iter().any(|v| v == s) {
                errors.push(Error::validation(
                    path.clone(),
                    format!("'{s}' is not one of [{}]", spec.one_of.join(", ")),
                ));
            }
            if let Some(max) = spec.max_len
                && s.chars().count() > max
            {
                errors.push(Error::validation(
                    path.clone(),
                    format!("longer than {max} characters"),
                ));
            }
        }
        (NodeType::List(element), Value::List(items)) => {
            for (i, item) in items.iter().enumerate() {
                check_element(element, item, &path.index(i), errors);
            }
        }
        (
            NodeType::Set {
                element,
                allow_duplicates,
            },
            Value::Set(items),
        ) => {
            let mut seen = BTreeSet::new();
            for (i, item) in items.iter().enumerate() {
                check_element(element, item, &path.index(i), errors);
                if !allow_duplicates && !seen.insert(item.canonical()) {
                    errors.push(Error::validation(
                        path.index(i),
                        format!("duplicate set element {item}"),
                    ));
                }
            }
        }
        (NodeType::Object(object), value) => check_object(object, value, path, errors),
        (node, other) => errors.push(type_mismatch(path, node.type_name(), other)),
    }
}

fn check_element(node: &NodeType, value: &Value, path: &AttrPath, errors: &mut Vec<Error>) {
    if value.is_null() {
        errors.push(Error::validation(path.clone(), "collection elements cannot be null"));
    } else {
        check_node(node, value, path, errors);
    }
}

fn type_mismatch(path: &AttrPath, expected: &str, got: &Value) -> Error {
    let got = match got {
        Value::Null => "null",
        Value::Unknown => "unknown",
        Value::Bool(_) => "bool",
        Value::Int(_) => "int",
        Value::String(_) => "string",
        Value::List(_) => "list",
        Value::Set(_) => "set",
        Value::Object(_) => "object",
        Value::Variant(..) => "variant",
    };
    Error::validation(path.clone(), format!("expected {expected}, got {got}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::kinds;
    use crate::location::Location;

    fn registry() -> SchemaRegistry {
        kinds::builtin_registry()
    }

    fn address(body: Value) -> Resource {
        Resource::new(
            ResourceKey::new("address", Location::shared(), "web"),
            body,
        )
    }

    #[test]
    fn test_address_requires_one_value_variant() {
        let errors = check_resource(&registry(), &address(Value::empty_object()));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("exactly one of [ip_netmask"));
    }

    #[test]
    fn test_valid_address_passes() {
        let body = Value::object([(
            "value",
            Value::variant("ip_netmask", Value::from("10.0.0.1/32")),
        )]);
        assert!(check_resource(&registry(), &address(body)).is_empty());
    }

    #[test]
    fn test_unknown_variant_tag_is_schema_error() {
        let body = Value::object([("value", Value::variant("mac", Value::from("aa:bb")))]);
        let errors = check_resource(&registry(), &address(body));
        assert_eq!(errors[0].kind(), ErrorKind::Schema);
    }

    #[test]
    fn test_location_admissibility() {
        let resource = Resource::new(
            ResourceKey::new("template", Location::device_group("dg"), "t1"),
            Value::empty_object(),
        );
        let errors = check_resource(&registry(), &resource);
        assert!(errors[0].to_string().contains("cannot be placed"));
    }

    #[test]
    fn test_name_rules() {
        let reg = registry();
        let schema = reg.lookup("address").unwrap();
        assert!(check_name(schema, "web-01.prod").is_ok());
        assert!(check_name(schema, "-leading").is_err());
        assert!(check_name(schema, "bad/slash").is_err());
        assert!(check_name(schema, &"x".repeat(64)).is_err());
    }

    #[test]
    fn test_int_bounds_and_enum() {
        let reg = registry();
        let schema = reg.lookup("service").unwrap();
        let body = Value::object([
            (
                "protocol",
                Value::variant(
                    "tcp",
                    Value::object([("destination_port", Value::from("443"))]),
                ),
            ),
            ("timeout", Value::Int(0)),
        ]);
        let errors = check_body(schema, &body);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().starts_with("timeout"));
    }

    #[test]
    fn test_duplicate_set_elements() {
        let reg = registry();
        let schema = reg.lookup("address_group").unwrap();
        let body = Value::object([(
            "members",
            Value::variant("static", Value::string_set(["a", "a"])),
        )]);
        let errors = check_body(schema, &body);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("duplicate set element"));
    }

    #[test]
    fn test_computed_attribute_cannot_be_set() {
        let reg = registry();
        let schema = reg.lookup("security_rule").unwrap();
        let body = Value::object([
            ("action", Value::from("allow")),
            ("uuid", Value::from("1234")),
        ]);
        let errors = check_body(schema, &body);
        assert!(errors.iter().any(|e| e.to_string().contains("computed")));
    }

    #[test]
    fn test_duplicate_ordered_names() {
        let rule = |name: &str| Value::object([("name", Value::from(name)), ("action", Value::from("allow"))]);
        let resource = Resource::new(
            ResourceKey::new("security_policy", Location::device_group("dg"), "pre"),
            Value::object([("rules", Value::List(vec![rule("r1"), rule("r2"), rule("r1")]))]),
        );
        let errors = check_resource(&registry(), &resource);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind(), ErrorKind::DuplicateOrderedName);
        assert_eq!(errors[0].path().unwrap().to_string(), "rules[2].name");
    }

    #[test]
    fn test_unsupported_attribute() {
        let body = Value::object([
            ("value", Value::variant("fqdn", Value::from("example.com"))),
            ("colour", Value::from("red")),
        ]);
        let errors = check_resource(&registry(), &address(body));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path().unwrap().to_string(), "colour");
    }
}
