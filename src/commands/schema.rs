use anyhow::Result;
use colored::Colorize;
use reconcile::schema::{Attribute, NodeType, ObjectSchema, Presence};
use reconcile::{Schema, kinds};

use crate::Context;
use crate::ui;

pub fn run(_ctx: &Context, kind: Option<&str>) -> Result<()> {
    let registry = kinds::builtin_registry();
    match kind {
        Some(kind) => describe(registry.lookup(kind)?),
        None => {
            ui::header("Resource kinds");
            for schema in registry.schemas() {
                let note = match (&schema.element_of, schema.ephemeral) {
                    (Some(parent), _) => format!("entry of {parent}"),
                    (None, true) => format!("{} (ephemeral)", schema.description),
                    (None, false) => schema.description.clone(),
                };
                println!("  {:<20} {}", schema.kind.bold(), note.dimmed());
            }
        }
    }
    Ok(())
}

fn describe(schema: &Schema) {
    ui::header(&schema.kind);
    if !schema.description.is_empty() {
        ui::dim(&schema.description);
    }
    let locations: Vec<&str> = schema.locations.iter().map(|l| l.as_str()).collect();
    ui::kv("locations", &locations.join(", "));
    ui::kv("max name length", &schema.name_max_len.to_string());
    if let Some(ordered) = &schema.ordered {
        ui::kv("ordered", &format!("{} → {}", ordered.attribute, ordered.element_kind));
    }
    if schema.ephemeral {
        ui::kv("ephemeral", "issued on apply, never stored");
    }

    ui::section("Attributes");
    for line in attribute_lines(&schema.body, 1) {
        println!("{line}");
    }
}

/// One line per attribute, nested objects indented beneath their parent
fn attribute_lines(object: &ObjectSchema, depth: usize) -> Vec<String> {
    let indent = "  ".repeat(depth);
    let mut lines = Vec::new();
    for attr in object.plain_attributes() {
        lines.push(format!("{indent}{}", attribute_line(attr)));
        lines.extend(nested_lines(&attr.node, depth + 1));
    }
    for group in &object.groups {
        let rule = if group.required { "exactly one of" } else { "at most one of" };
        lines.push(format!("{indent}{} ({rule})", group.name));
        for member in object.group_members(&group.name) {
            lines.push(format!("{indent}  | {}", attribute_line(member)));
            lines.extend(nested_lines(&member.node, depth + 2));
        }
    }
    lines
}

fn nested_lines(node: &NodeType, depth: usize) -> Vec<String> {
    match node {
        NodeType::Object(object) => attribute_lines(object, depth),
        NodeType::List(element) | NodeType::Set { element, .. } => nested_lines(element, depth),
        _ => Vec::new(),
    }
}

fn attribute_line(attr: &Attribute) -> String {
    let mut line = format!("{}: {}", attr.name, attr.node.type_name());
    match attr.presence {
        Presence::Required if attr.group.is_none() => line.push_str(", required"),
        Presence::Computed => line.push_str(", computed"),
        _ => {}
    }
    if let Some(default) = &attr.default {
        line.push_str(&format!(", default {default}"));
    }
    if attr.sensitive {
        line.push_str(", sensitive");
    }
    line
}
