use anyhow::{Result, bail};
use reconcile::validate::check_resource;
use reconcile::{Diagnostic, Resource, ResourceKey, SchemaRegistry, kinds};
use std::collections::BTreeSet;
use std::path::Path;

use crate::Context;
use crate::config::Declarations;
use crate::{display, ui};

pub fn run(ctx: &Context, file: &Path) -> Result<()> {
    let registry = kinds::builtin_registry();
    let resources = Declarations::load(file)?.resources(&registry)?;
    let diagnostics = check(&registry, &resources);

    if diagnostics.is_empty() {
        if !ctx.quiet {
            ui::success(&format!("{} resources in {} are valid", resources.len(), file.display()));
        }
        return Ok(());
    }

    display::display_diagnostics(&diagnostics);
    bail!("{} problem(s) in {}", diagnostics.len(), file.display())
}

/// Schema, name and location checks plus duplicate keys
fn check(registry: &SchemaRegistry, resources: &[Resource]) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    let mut seen: BTreeSet<&ResourceKey> = BTreeSet::new();
    for resource in resources {
        if !seen.insert(&resource.key) {
            diagnostics.push(
                Diagnostic::error(reconcile::ErrorKind::Validation, "declared more than once")
                    .with_resource(resource.key.clone()),
            );
        }
        for error in check_resource(registry, resource) {
            let mut diagnostic = Diagnostic::from(&error);
            if diagnostic.resource.is_none() {
                diagnostic.resource = Some(resource.key.clone());
            }
            diagnostics.push(diagnostic);
        }
    }
    diagnostics
}
