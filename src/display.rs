//! Rendering of plans, apply reports and diagnostics

use colored::{ColoredString, Colorize};
use reconcile::codec::{self, REDACTED};
use reconcile::{
    Action, ApplyReport, Diagnostic, FieldChange, OpKind, Operation, Plan, Position, SchemaRegistry,
    Severity, Value,
};

use crate::ui;

/// Display a plan grouped by stage
pub fn display_plan(plan: &Plan, registry: &SchemaRegistry, verbose: bool) {
    if plan.is_empty() {
        println!();
        println!("  {} No changes needed", "✓".green());
        return;
    }

    println!();
    println!("┌─ {} ─────────────────────────────────────────┐", "Reconciliation Plan".bold());
    println!("│");

    for stage in &plan.stages {
        println!("│ {}", format!("Stage {}", stage.index + 1).bold());
        for op in &stage.ops {
            println!("│   {} {:<40} {}", symbol(op.kind()), op.key.to_string(), describe(op).dimmed());
            for line in detail_lines(op, registry, verbose) {
                println!("│       {}", line.dimmed());
            }
        }
        println!("│");
    }

    let summary = plan.summary();
    println!("├─────────────────────────────────────────────────────┤");
    println!(
        "│ Summary: {} changes ({} create, {} update, {} delete, {} move)",
        summary.total().to_string().bold(),
        summary.creates.to_string().green(),
        summary.updates.to_string().yellow(),
        summary.deletes.to_string().red(),
        summary.moves.to_string().cyan()
    );
    println!("└─────────────────────────────────────────────────────┘");
}

fn symbol(kind: OpKind) -> ColoredString {
    match kind {
        OpKind::Create => kind.symbol().green(),
        OpKind::Update => kind.symbol().yellow(),
        OpKind::Delete => kind.symbol().red(),
        OpKind::Move => kind.symbol().cyan(),
    }
}

fn describe(op: &Operation) -> String {
    match &op.action {
        Action::Create { placement, .. } => match placement {
            Some(Position::Bottom) | None => "(new)".to_string(),
            Some(position) => format!("(new, {position})"),
        },
        Action::Update { changes, .. } => format!("({} changed)", changes.len()),
        Action::Delete => "(will remove)".to_string(),
        Action::Move { position } => format!("({position})"),
    }
}

/// Field-level lines under an op, sensitive values hidden
fn detail_lines(op: &Operation, registry: &SchemaRegistry, verbose: bool) -> Vec<String> {
    let Ok(schema) = registry.lookup(&op.key.kind) else {
        return Vec::new();
    };
    match &op.action {
        Action::Update { changes, .. } => changes
            .iter()
            .map(|change| {
                let shown = |value: &Value| {
                    if codec::is_sensitive(&schema.body, change.path()) && !value.is_null() {
                        REDACTED.to_string()
                    } else {
                        value.to_string()
                    }
                };
                match change {
                    FieldChange::Set { path, old, new } if old.is_null() => {
                        format!("+ {path}: {}", shown(new))
                    }
                    FieldChange::Set { path, old, new } => {
                        format!("~ {path}: {} → {}", shown(old), shown(new))
                    }
                    FieldChange::Unset { path, old } => format!("- {path}: {}", shown(old)),
                    FieldChange::SwitchVariant { group, from, to, .. } => {
                        format!("↔ {group}: {from} → {to}")
                    }
                }
            })
            .collect(),
        Action::Create { body, .. } if verbose => vec![codec::redact(body, &schema.body).to_string()],
        _ => Vec::new(),
    }
}

/// Print the outcome of an apply
pub fn display_report(report: &ApplyReport) {
    let summary = &report.summary;
    println!();
    if report.is_success() {
        println!("  {} Configuration applied successfully!", "✓".green().bold());
    } else if report.cancelled {
        println!("  {} Apply cancelled", "⚠".yellow().bold());
    } else {
        println!("  {} Configuration applied with errors", "⚠".yellow().bold());
    }

    let lines = [
        (summary.created, "created"),
        (summary.updated, "updated"),
        (summary.deleted, "deleted"),
        (summary.moved, "moved"),
        (summary.skipped, "skipped"),
    ];
    for (count, verb) in lines {
        if count > 0 {
            println!("    • {count} resources {verb}");
        }
    }
    if summary.failed > 0 {
        println!("    • {} {} failed", summary.failed, "resources".red());
    }
    if report.committed {
        println!("    • changes committed");
    }

    for failure in report.failures() {
        ui::error(&format!("{}: {}", failure.key, failure.message));
    }
    display_diagnostics(&report.diagnostics);
}

/// Print diagnostics with their remediation advice
pub fn display_diagnostics(diagnostics: &[Diagnostic]) {
    for diagnostic in diagnostics {
        let marker = match diagnostic.severity {
            Severity::Error => "✗".red(),
            Severity::Warning => "⚠".yellow(),
        };
        println!("  {marker} {diagnostic}");
        println!("      {}", diagnostic.remediation.advice().dimmed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconcile::{AttrPath, Location, ResourceKey, kinds};

    fn update(kind: &str, changes: Vec<FieldChange>) -> Operation {
        Operation {
            id: 0,
            key: ResourceKey::new(kind, Location::panorama(), "automation"),
            action: Action::Update {
                body: Value::empty_object(),
                changes,
            },
            depends_on: Vec::new(),
            collection: None,
            stage: 0,
        }
    }

    #[test]
    fn test_sensitive_change_is_hidden() {
        let op = update(
            "api_key",
            vec![
                FieldChange::Set {
                    path: AttrPath::from_fields(&["password"]),
                    old: Value::from("old-secret"),
                    new: Value::from("new-secret"),
                },
                FieldChange::Set {
                    path: AttrPath::from_fields(&["username"]),
                    old: Value::from("admin"),
                    new: Value::from("ops"),
                },
            ],
        );
        let lines = detail_lines(&op, &kinds::builtin_registry(), false);
        assert_eq!(lines.len(), 2);
        assert!(!lines[0].contains("secret"));
        assert!(lines[0].contains(REDACTED));
        assert!(lines[1].contains("admin"));
    }

    #[test]
    fn test_describe_actions() {
        let key = ResourceKey::new("security_rule", Location::device_group("edge"), "r1");
        let op = |action| Operation {
            id: 0,
            key: key.clone(),
            action,
            depends_on: Vec::new(),
            collection: None,
            stage: 0,
        };
        assert_eq!(describe(&op(Action::Delete)), "(will remove)");
        assert_eq!(
            describe(&op(Action::Move {
                position: Position::Before("r2".into())
            })),
            "(before 'r2')"
        );
        assert_eq!(
            describe(&op(Action::Create {
                body: Value::empty_object(),
                placement: Some(Position::Bottom)
            })),
            "(new)"
        );
    }
}
