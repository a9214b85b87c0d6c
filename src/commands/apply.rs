use anyhow::Result;
use reconcile::{
    ApplyReport, AutoConfirm, CancellationToken, ConfirmCallback, OpStatus, Plan, Resource, SchemaRegistry,
    StateFile, StoredState,
};
use std::io;

use super::{Session, planning_failed};
use crate::Context;
use crate::cli::ApplyArgs;
use crate::display;
use crate::progress::ApplyProgress;
use crate::ui;

/// Asks on the terminal
struct PromptConfirm;

impl ConfirmCallback for PromptConfirm {
    fn confirm(&mut self, prompt: &str) -> io::Result<bool> {
        use dialoguer::Confirm;

        Confirm::new()
            .with_prompt(prompt)
            .default(true)
            .interact()
            .map_err(io::Error::other)
    }
}

pub fn run(ctx: &Context, args: ApplyArgs) -> Result<()> {
    let mut session = Session::open(ctx)?;
    if let Some(jobs) = args.jobs {
        session.config.parallelism = jobs;
    }
    if args.continue_on_failure {
        session.config.continue_on_failure = true;
    }
    session.config.validate()?;

    let declared = session.declared(&args.file)?;
    let engine = session.engine();
    let plan = engine.plan(&declared, &session.state.keys()).map_err(planning_failed)?;
    display::display_plan(&plan, &session.registry, ctx.verbose > 0);

    if plan.is_empty() {
        let applied = engine.applied_state(&plan, &ApplyReport::default())?;
        let next = record_apply(&session.state, &plan, &ApplyReport::default(), &applied, &session.registry)?;
        if next != session.state {
            session.state = next;
            session.save_state()?;
        }
        return Ok(());
    }

    if args.dry_run {
        println!();
        ui::info("Dry run - no changes made");
        return Ok(());
    }

    let mut confirm: Box<dyn ConfirmCallback> = if args.yes {
        Box::new(AutoConfirm)
    } else {
        Box::new(PromptConfirm)
    };
    if !confirm.confirm("Apply these changes?")? {
        println!();
        ui::warn("Aborted, no changes made");
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let mut progress = ApplyProgress::new(plan.len(), plan.stages.len(), ctx.quiet);
    let report = engine.apply(&plan, &cancel, &mut progress)?;
    progress.finish();
    display::display_report(&report);

    for issued in report.ephemeral() {
        ui::info(&format!("Issued {} (not stored)", issued.key));
    }

    let applied = engine.applied_state(&plan, &report)?;
    session.state = record_apply(&session.state, &plan, &report, &applied, &session.registry)?;
    session.save_state()?;
    session.save_device()?;

    match report.error() {
        Some(error) => Err(error.into()),
        None => Ok(()),
    }
}

/// State after an apply
///
/// Applied resources replace their entries. A prior entry without an applied
/// counterpart survives only while one of its ops is unfinished.
fn record_apply(
    prior: &StateFile,
    plan: &Plan,
    report: &ApplyReport,
    applied: &[Resource],
    registry: &SchemaRegistry,
) -> reconcile::Result<StateFile> {
    let mut next = StateFile::default();
    for resource in applied {
        next.upsert(StoredState::from_resource(registry, resource)?);
    }
    for stored in &prior.resources {
        let key = stored.key();
        if next.get(&key).is_some() {
            continue;
        }
        let unfinished = plan
            .ops()
            .filter(|op| op.key == key || op.collection.as_ref() == Some(&key))
            .any(|op| report.result(op.id).is_none_or(|r| r.status != OpStatus::Done));
        if unfinished {
            next.upsert(stored.clone());
        }
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconcile::memory::CallKind;
    use reconcile::{
        ClientError, ExecuteOptions, Location, MemoryDevice, NoProgress, Reconciler, ResourceKey, RetryConfig,
        Value, kinds,
    };
    use std::sync::Arc;

    fn address(name: &str) -> Resource {
        Resource::new(
            ResourceKey::new("address", Location::shared(), name),
            Value::object([("value", Value::variant("fqdn", Value::from(format!("{name}.example.com"))))]),
        )
    }

    fn apply(engine: &Reconciler, declared: &[Resource], prior: &StateFile) -> StateFile {
        let plan = engine.plan(declared, &prior.keys()).unwrap();
        let report = engine.apply(&plan, &CancellationToken::new(), &mut NoProgress).unwrap();
        let applied = engine.applied_state(&plan, &report).unwrap();
        record_apply(prior, &plan, &report, &applied, engine.registry()).unwrap()
    }

    fn names(state: &StateFile) -> Vec<String> {
        state.resources.iter().map(|s| s.name.clone()).collect()
    }

    #[test]
    fn test_failed_delete_keeps_entry() {
        let registry = kinds::builtin_registry();
        let device = Arc::new(MemoryDevice::new(registry.clone()));
        let options = ExecuteOptions {
            retry: RetryConfig::no_retry(),
            ..ExecuteOptions::default()
        };
        let engine = Reconciler::new(registry, device.clone()).with_options(options);

        let state = apply(&engine, &[address("a"), address("b")], &StateFile::default());
        assert_eq!(names(&state), ["a", "b"]);

        device.fail_next(CallKind::Delete, "b", 1, ClientError::Rejected("locked".into()));
        let state = apply(&engine, &[], &state);
        assert_eq!(names(&state), ["b"]);

        let state = apply(&engine, &[], &state);
        assert!(state.resources.is_empty());
    }

    #[test]
    fn test_unchanged_resources_stay_recorded() {
        let registry = kinds::builtin_registry();
        let device = Arc::new(MemoryDevice::new(registry.clone()));
        let engine = Reconciler::new(registry, device);

        let declared = [address("a")];
        let first = apply(&engine, &declared, &StateFile::default());
        let second = apply(&engine, &declared, &first);
        assert_eq!(first, second);
    }
}
