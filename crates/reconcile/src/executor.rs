//! Execution engine - applies a staged plan with parallelism and stage barriers

use crate::client::{ClientError, ClientResult, ConfigClient, Position};
use crate::codec;
use crate::context::{CancellationToken, OpStatus, ProgressCallback};
use crate::diff::{self, FieldChange};
use crate::error::{Diagnostic, Error, OpFailure, Result};
use crate::location::Location;
use crate::path::{AttrPath, PathSegment};
use crate::planner::{Action, OpKind, Operation, Plan};
use crate::retry::{RetryBounds, RetryCallback, with_retry};
use crate::schema::{Schema, SchemaRegistry};
use crate::types::{ExecuteOptions, ExecuteSummary, ResourceKey};
use crate::value::Value;
use rayon::prelude::*;
use serde_json::Value as Raw;
use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Resource created during apply, as the device returned it
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedResource {
    pub key: ResourceKey,
    pub value: Value,
    pub id: Option<String>,
    /// Issued by the device and never persisted
    pub ephemeral: bool,
}

/// Final status of one op
#[derive(Debug, Clone, PartialEq)]
pub struct OpResult {
    pub op: usize,
    pub key: ResourceKey,
    pub kind: OpKind,
    pub status: OpStatus,
    /// Device calls made, retries included
    pub attempts: u32,
    pub error: Option<OpFailure>,
}

/// Outcome of applying a plan
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub summary: ExecuteSummary,
    /// One entry per op, in plan order
    pub results: Vec<OpResult>,
    pub diagnostics: Vec<Diagnostic>,
    /// Resources created, keyed by device identity
    pub applied: BTreeMap<ResourceKey, AppliedResource>,
    pub committed: bool,
    pub cancelled: bool,
    pub commit_error: Option<ClientError>,
}

impl ApplyReport {
    pub fn result(&self, op: usize) -> Option<&OpResult> {
        self.results.iter().find(|r| r.op == op)
    }

    pub fn failures(&self) -> Vec<OpFailure> {
        self.results.iter().filter_map(|r| r.error.clone()).collect()
    }

    /// Values issued during apply that must not be persisted
    pub fn ephemeral(&self) -> impl Iterator<Item = &AppliedResource> {
        self.applied.values().filter(|a| a.ephemeral)
    }

    pub fn is_success(&self) -> bool {
        self.error().is_none()
    }

    /// The apply as an error, if it did not fully succeed
    pub fn error(&self) -> Option<Error> {
        let failures = self.failures();
        if !failures.is_empty() {
            return Some(Error::PartialApply {
                succeeded: self.results.iter().filter(|r| r.status == OpStatus::Done).count(),
                skipped: self.summary.skipped,
                failures,
            });
        }
        if let Some(e) = &self.commit_error {
            return Some(Error::Commit(e.clone()));
        }
        self.cancelled.then_some(Error::Cancelled)
    }
}

/// Answer of a device call that outlived its watchdog
type Stale<T> = Option<Receiver<ClientResult<T>>>;

/// Run a device call on a watchdog thread, giving up after `limit`
///
/// A call that times out keeps running in the background and is parked in
/// `stale`. No new call is issued while it is outstanding: the next attempt
/// waits up to `fence` for its answer and returns that instead, so a write
/// the device applied but acknowledged late is never sent twice.
fn timed<T, F>(
    client: &Arc<dyn ConfigClient>,
    limit: Duration,
    fence: Duration,
    stale: &mut Stale<T>,
    call: F,
) -> ClientResult<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn ConfigClient) -> ClientResult<T> + Send + 'static,
{
    if let Some(rx) = stale.take() {
        match rx.recv_timeout(fence) {
            Ok(result) => {
                log::debug!("Late answer from a timed-out device call");
                return result;
            }
            Err(RecvTimeoutError::Timeout) => {
                *stale = Some(rx);
                return Err(ClientError::Timeout(limit));
            }
            // Worker died without answering
            Err(RecvTimeoutError::Disconnected) => {}
        }
    }

    let (tx, rx) = mpsc::channel();
    let client = Arc::clone(client);
    let spawned = thread::Builder::new()
        .name("device-call".to_string())
        .spawn(move || {
            let _ = tx.send(call(client.as_ref()));
        });
    if let Err(e) = spawned {
        return Err(ClientError::transport(None, format!("cannot start device call: {e}")));
    }
    match rx.recv_timeout(limit) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            *stale = Some(rx);
            Err(ClientError::Timeout(limit))
        }
        Err(RecvTimeoutError::Disconnected) => Err(ClientError::transport(None, "device call aborted")),
    }
}

/// Shared by every worker of an apply
struct Runner<'a, P: ?Sized> {
    client: &'a Arc<dyn ConfigClient>,
    registry: &'a SchemaRegistry,
    opts: &'a ExecuteOptions,
    cancel: &'a CancellationToken,
    progress: Mutex<&'a mut P>,
}

/// Reports retries of one op as status transitions
struct OpRetry<'r, 'a, P: ?Sized> {
    runner: &'r Runner<'a, P>,
    op: &'r Operation,
}

impl<P: ProgressCallback + ?Sized> RetryCallback for OpRetry<'_, '_, P> {
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &ClientError, delay: Duration) {
        log::warn!(
            "{}: attempt {}/{} failed: {}. Retrying in {}ms",
            self.op,
            attempt,
            max_attempts,
            error,
            delay.as_millis()
        );
        self.runner.report(self.op, OpStatus::Retrying);
    }
}

/// Ops run as one unit of work
enum Unit<'p> {
    Single(&'p Operation),
    /// Deletes of one kind at one location
    DeleteBatch(Vec<&'p Operation>),
}

type Outcome = (OpResult, Option<AppliedResource>);

impl<P: ProgressCallback + ?Sized> Runner<'_, P> {
    fn report(&self, op: &Operation, status: OpStatus) {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .on_op_status(op, status);
    }

    fn finish(&self, op: &Operation, attempts: u32, error: Option<OpFailure>) -> OpResult {
        let status = if error.is_some() {
            OpStatus::Failed
        } else {
            OpStatus::Done
        };
        match &error {
            None => log::info!("{op}"),
            Some(f) => log::warn!("{op} failed: {}", f.message),
        }
        self.report(op, status);
        OpResult {
            op: op.id,
            key: op.key.clone(),
            kind: op.kind(),
            status,
            attempts,
            error,
        }
    }

    fn skip(&self, op: &Operation) -> OpResult {
        self.report(op, OpStatus::Skipped);
        OpResult {
            op: op.id,
            key: op.key.clone(),
            kind: op.kind(),
            status: OpStatus::Skipped,
            attempts: 0,
            error: None,
        }
    }

    /// Retried, time-limited device call on behalf of `op`
    fn call<T, F>(&self, op: &Operation, deadline: Instant, call: F) -> (ClientResult<T>, u32)
    where
        T: Send + 'static,
        F: Fn(&dyn ConfigClient) -> ClientResult<T> + Clone + Send + 'static,
    {
        let retry = OpRetry { runner: self, op };
        let bounds = RetryBounds {
            cancel: Some(self.cancel),
            deadline: Some(deadline),
        };
        let mut stale = None;
        with_retry(&self.opts.retry, bounds, Some(&retry), || {
            let now = Instant::now();
            if now >= deadline {
                return Err(ClientError::Timeout(self.opts.timeouts.stage));
            }
            let limit = self.opts.timeouts.op.min(deadline - now);
            timed(self.client, limit, deadline - now, &mut stale, call.clone())
        })
    }

    fn run(&self, unit: &Unit<'_>, deadline: Instant) -> Vec<Outcome> {
        match unit {
            Unit::Single(op) => vec![self.run_op(op, deadline)],
            Unit::DeleteBatch(ops) => self
                .run_deletes(ops, deadline)
                .into_iter()
                .map(|r| (r, None))
                .collect(),
        }
    }

    fn run_op(&self, op: &Operation, deadline: Instant) -> Outcome {
        if self.cancel.is_cancelled() {
            return (self.skip(op), None);
        }
        self.report(op, OpStatus::Running);

        let schema = match self.registry.lookup(&op.key.kind) {
            Ok(schema) => schema,
            Err(e) => return (self.finish(op, 0, Some(failure(&op.key, &e))), None),
        };
        let location = op.key.location.clone();
        let kind = op.key.kind.clone();
        let name = op.key.name.clone();

        match &op.action {
            Action::Create { body, placement } => {
                let raw = match payload(schema, body, &[]) {
                    Ok(raw) => raw,
                    Err(e) => return (self.finish(op, 0, Some(failure(&op.key, &e))), None),
                };
                let (created, mut attempts) = {
                    let (location, kind, name) = (location.clone(), kind.clone(), name.clone());
                    self.call(op, deadline, move |c| c.create(&location, &kind, &name, &raw))
                };
                let entry = match created {
                    Ok(entry) => entry,
                    Err(e) => return (self.finish(op, attempts, Some(client_failure(&op.key, &e))), None),
                };

                if let Some(position) = placement.clone().filter(|p| *p != Position::Bottom) {
                    let (moved, more) = self.call(op, deadline, move |c| c.move_entry(&location, &kind, &name, &position));
                    attempts += more;
                    if let Err(e) = moved {
                        return (self.finish(op, attempts, Some(client_failure(&op.key, &e))), None);
                    }
                }

                let value = codec::parse(&entry.body, &schema.body).unwrap_or_else(|e| {
                    log::warn!("{}: cannot read back created entry: {e}", op.key);
                    body.clone()
                });
                let applied = AppliedResource {
                    key: op.key.clone(),
                    value,
                    id: entry.id,
                    ephemeral: schema.ephemeral,
                };
                (self.finish(op, attempts, None), Some(applied))
            }
            Action::Update { body, changes } => {
                let raw = match payload(schema, body, changes) {
                    Ok(raw) => raw,
                    Err(e) => return (self.finish(op, 0, Some(failure(&op.key, &e))), None),
                };
                let (updated, attempts) = self.call(op, deadline, move |c| c.update(&location, &kind, &name, &raw));
                let error = updated.err().map(|e| client_failure(&op.key, &e));
                (self.finish(op, attempts, error), None)
            }
            Action::Move { position } => {
                let position = position.clone();
                let (moved, attempts) =
                    self.call(op, deadline, move |c| c.move_entry(&location, &kind, &name, &position));
                let error = moved.err().map(|e| client_failure(&op.key, &e));
                (self.finish(op, attempts, error), None)
            }
            Action::Delete => self.run_deletes(&[op], deadline).into_iter().next().map_or_else(
                || (self.skip(op), None),
                |r| (r, None),
            ),
        }
    }

    /// One delete call for several names; a partial failure is mapped back
    /// to the ops that failed
    fn run_deletes(&self, ops: &[&Operation], deadline: Instant) -> Vec<OpResult> {
        let Some(first) = ops.first() else {
            return Vec::new();
        };
        if self.cancel.is_cancelled() {
            return ops.iter().map(|op| self.skip(op)).collect();
        }
        for op in ops {
            self.report(op, OpStatus::Running);
        }

        let location: Location = first.key.location.clone();
        let kind = first.key.kind.clone();
        let names: Vec<String> = ops.iter().map(|op| op.key.name.clone()).collect();
        if names.len() > 1 {
            log::debug!("Deleting {} {} entries at {location} in one call", names.len(), kind);
        }
        let (deleted, attempts) = self.call(first, deadline, move |c| c.delete(&location, &kind, &names));

        ops.iter()
            .map(|op| {
                let error = match &deleted {
                    Ok(()) => None,
                    Err(ClientError::PartialFailure { failed }) => failed
                        .iter()
                        .find(|f| f.name == op.key.name)
                        .filter(|f| f.error != ClientError::NotFound)
                        .map(|f| client_failure(&op.key, &f.error)),
                    // Already gone
                    Err(ClientError::NotFound) => None,
                    Err(e) => Some(client_failure(&op.key, e)),
                };
                self.finish(op, attempts, error)
            })
            .collect()
    }
}

fn failure(key: &ResourceKey, error: &Error) -> OpFailure {
    OpFailure {
        key: key.clone(),
        kind: error.kind(),
        message: error.to_string(),
    }
}

fn client_failure(key: &ResourceKey, error: &ClientError) -> OpFailure {
    OpFailure {
        key: key.clone(),
        kind: error.kind(),
        message: error.to_string(),
    }
}

/// Device payload for a create or update
///
/// Computed attributes are left to the device. Attributes an update
/// removes, including the previously active tag of a switched variant
/// group, are sent as explicit nulls.
fn payload(schema: &Schema, body: &Value, changes: &[FieldChange]) -> Result<Raw> {
    let stripped = codec::strip_computed(body, &schema.body);
    let mut raw = codec::marshal(&stripped, &schema.body)?;
    for change in changes {
        if let FieldChange::Unset { path, .. } = change {
            mark_unset(&mut raw, path);
        }
    }
    Ok(raw)
}

/// Set the attribute at `path` to null if its parent object is present
fn mark_unset(raw: &mut Raw, path: &AttrPath) {
    let Some((last, parents)) = path.segments().split_last() else {
        return;
    };
    let mut node = raw;
    for segment in parents {
        let next = match segment {
            PathSegment::Field(name) | PathSegment::Tag(name) => node.get_mut(name.as_str()),
            PathSegment::Index(i) => node.get_mut(*i),
        };
        match next {
            Some(child) => node = child,
            None => return,
        }
    }
    if let (PathSegment::Field(name) | PathSegment::Tag(name), Some(fields)) = (last, node.as_object_mut()) {
        fields.insert(name.clone(), Raw::Null);
    }
}

/// Apply a plan
///
/// Stages run in order, separated by barriers; ops within a stage run on a
/// pool of `opts.parallelism` workers. An op whose dependency did not
/// complete is skipped. After a stage with failures no further stage starts
/// unless `continue_on_failure` is set.
pub fn execute(
    client: &Arc<dyn ConfigClient>,
    registry: &SchemaRegistry,
    plan: &Plan,
    opts: &ExecuteOptions,
    cancel: &CancellationToken,
    progress: &mut dyn ProgressCallback,
) -> Result<ApplyReport> {
    let mut report = ApplyReport::default();
    if plan.is_empty() {
        return Ok(report);
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(opts.parallelism.max(1))
        .build()
        .map_err(|e| Error::Internal(format!("failed to create thread pool: {e}")))?;

    let runner = Runner {
        client,
        registry,
        opts,
        cancel,
        progress: Mutex::new(progress),
    };

    let mut status: BTreeMap<usize, OpStatus> = plan.ops().map(|op| (op.id, OpStatus::Pending)).collect();
    let mut results: BTreeMap<usize, OpResult> = BTreeMap::new();
    let mut halted = false;

    for stage in &plan.stages {
        if cancel.is_cancelled() {
            report.cancelled = true;
            halted = true;
        }

        let mut stage_summary = ExecuteSummary::default();
        let mut outcomes: Vec<Outcome> = Vec::new();
        if halted {
            for op in &stage.ops {
                outcomes.push((runner.skip(op), None));
            }
        } else {
            {
                let mut progress = runner.progress.lock().unwrap_or_else(PoisonError::into_inner);
                progress.on_stage_start(stage);
                for op in &stage.ops {
                    progress.on_op_status(op, OpStatus::Pending);
                }
            }

            let mut units = Vec::new();
            let mut batches: BTreeMap<(String, Location), Vec<&Operation>> = BTreeMap::new();
            for op in &stage.ops {
                if op.depends_on.iter().any(|d| status.get(d) != Some(&OpStatus::Done)) {
                    outcomes.push((runner.skip(op), None));
                } else if op.kind() == OpKind::Delete {
                    batches
                        .entry((op.key.kind.clone(), op.key.location.clone()))
                        .or_default()
                        .push(op);
                } else {
                    units.push(Unit::Single(op));
                }
            }
            units.extend(batches.into_values().map(Unit::DeleteBatch));

            let deadline = Instant::now() + opts.timeouts.stage;
            let ran: Vec<Vec<Outcome>> = pool.install(|| units.par_iter().map(|unit| runner.run(unit, deadline)).collect());
            outcomes.extend(ran.into_iter().flatten());
        }

        for (result, applied) in outcomes {
            match (result.status, result.kind) {
                (OpStatus::Done, OpKind::Create) => stage_summary.created += 1,
                (OpStatus::Done, OpKind::Update) => stage_summary.updated += 1,
                (OpStatus::Done, OpKind::Delete) => stage_summary.deleted += 1,
                (OpStatus::Done, OpKind::Move) => stage_summary.moved += 1,
                (OpStatus::Failed, _) => stage_summary.failed += 1,
                _ => stage_summary.skipped += 1,
            }
            if let Some(applied) = applied {
                report.applied.insert(applied.key.clone(), applied);
            }
            status.insert(result.op, result.status);
            results.insert(result.op, result);
        }

        if !halted {
            runner
                .progress
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .on_stage_complete(stage, &stage_summary);
        }
        if stage_summary.failed > 0 && !opts.continue_on_failure {
            halted = true;
        }
        report.summary.merge(&stage_summary);
    }

    report.cancelled |= cancel.is_cancelled();
    report.results = results.into_values().collect();
    for failure in report.failures() {
        report
            .diagnostics
            .push(Diagnostic::error(failure.kind, failure.message.clone()).with_resource(failure.key.clone()));
    }

    let clean = report.summary.failed == 0 && !report.cancelled;
    if clean && report.summary.total_changes() > 0 && client.commit_required() {
        commit(&runner, plan, &mut report);
    }
    if clean && opts.verify {
        verify(&runner, plan, &mut report);
    }

    if let Some(e) = report.error() {
        report.diagnostics.push(Diagnostic::from(&e));
    }
    log::debug!(
        "Applied {} changes, {} failed, {} skipped",
        report.summary.total_changes(),
        report.summary.failed,
        report.summary.skipped
    );
    Ok(report)
}

fn commit<P: ProgressCallback + ?Sized>(runner: &Runner<'_, P>, plan: &Plan, report: &mut ApplyReport) {
    let Some(anchor) = plan.ops().next() else {
        return;
    };
    let deadline = Instant::now() + runner.opts.timeouts.stage;
    let (committed, _) = runner.call(anchor, deadline, |c| c.commit());
    match committed {
        Ok(()) => {
            log::info!("Committed configuration");
            report.committed = true;
        }
        Err(e) => {
            log::warn!("Commit failed: {e}");
            report.commit_error = Some(e);
        }
    }
}

/// Re-read what was applied and report drift
fn verify<P: ProgressCallback + ?Sized>(runner: &Runner<'_, P>, plan: &Plan, report: &mut ApplyReport) {
    let deadline = Instant::now() + runner.opts.timeouts.stage;

    for op in plan.ops() {
        if report.result(op.id).map(|r| r.status) != Some(OpStatus::Done) {
            continue;
        }
        let Ok(schema) = runner.registry.lookup(&op.key.kind) else {
            continue;
        };
        if schema.ephemeral {
            continue;
        }
        let (location, kind, name) = (op.key.location.clone(), op.key.kind.clone(), op.key.name.clone());
        let (read, _) = runner.call(op, deadline, move |c| c.read(&location, &kind, &name));

        match (op.body(), read) {
            (Some(body), Ok(entry)) => {
                let observed = match codec::parse(&entry.body, &schema.body) {
                    Ok(value) => codec::apply_defaults(&value, &schema.body),
                    Err(e) => {
                        report
                            .diagnostics
                            .push(Diagnostic::drift(op.key.clone(), AttrPath::root(), e.to_string()));
                        continue;
                    }
                };
                let declared = codec::apply_defaults(body, &schema.body);
                if let Some(change) = diff::field_changes(&schema.body, &observed, &declared).first() {
                    let path = change.path().clone();
                    log::warn!("{}: drift at {path} after apply", op.key);
                    report.diagnostics.push(Diagnostic::drift(
                        op.key.clone(),
                        path.clone(),
                        format!("{}: {path} differs from the applied value", op.key),
                    ));
                }
            }
            (Some(_), Err(ClientError::NotFound)) => {
                report.diagnostics.push(Diagnostic::drift(
                    op.key.clone(),
                    AttrPath::root(),
                    format!("{} is missing after apply", op.key),
                ));
            }
            (None, Ok(_)) if op.kind() == OpKind::Delete => {
                report.diagnostics.push(Diagnostic::drift(
                    op.key.clone(),
                    AttrPath::root(),
                    format!("{} is still present after delete", op.key),
                ));
            }
            (_, Err(e)) if e != ClientError::NotFound => {
                log::warn!("{}: cannot verify: {e}", op.key);
            }
            _ => {}
        }
    }

    for collection in &plan.collections {
        let Some(op) = plan
            .ops()
            .find(|op| op.collection.as_ref() == Some(&collection.collection))
        else {
            continue;
        };
        let (location, kind) = (collection.collection.location.clone(), collection.element_kind.clone());
        let listed = runner.call(op, deadline, move |c| c.list(&location, &kind)).0;
        let Ok(entries) = listed else {
            continue;
        };
        let order: Vec<String> = entries.into_iter().map(|e| e.name).collect();
        if order != collection.order {
            log::warn!("{}: entry order differs after apply", collection.collection);
            report.diagnostics.push(Diagnostic::drift(
                collection.collection.clone(),
                AttrPath::root().field("rules"),
                format!(
                    "{}: device order is [{}], declared [{}]",
                    collection.collection,
                    order.join(", "),
                    collection.order.join(", ")
                ),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NoProgress;
    use crate::kinds;
    use crate::memory::{CallKind, MemoryDevice};
    use crate::planner::{self, PlanInput};
    use crate::types::{Resource, RetryConfig, Timeouts};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn address(name: &str) -> Resource {
        Resource::new(
            ResourceKey::new("address", Location::shared(), name),
            Value::object([("value", Value::variant("ip_netmask", Value::from("10.0.0.1/32")))]),
        )
    }

    fn fast_options() -> ExecuteOptions {
        ExecuteOptions {
            parallelism: 4,
            retry: RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                backoff_factor: 1.0,
                max_delay: Duration::from_millis(5),
            },
            ..ExecuteOptions::default()
        }
    }

    fn run(device: &Arc<MemoryDevice>, declared: Vec<Resource>, observed: Vec<Resource>, opts: &ExecuteOptions) -> ApplyReport {
        let registry = kinds::builtin_registry();
        let plan = planner::plan(
            &registry,
            &PlanInput {
                declared,
                observed,
                ..PlanInput::default()
            },
        )
        .unwrap();
        let client: Arc<dyn ConfigClient> = device.clone();
        execute(&client, &registry, &plan, opts, &CancellationToken::new(), &mut NoProgress).unwrap()
    }

    #[test]
    fn test_creates_apply_and_verify_clean() {
        let device = Arc::new(MemoryDevice::new(kinds::builtin_registry()));
        let report = run(&device, vec![address("a"), address("b")], Vec::new(), &fast_options());
        assert!(report.is_success(), "{:?}", report.error());
        assert_eq!(report.summary.created, 2);
        assert!(report.diagnostics.is_empty());
        assert_eq!(device.names(&Location::shared(), "address"), vec!["a", "b"]);
    }

    #[test]
    fn test_transient_failure_is_retried() {
        let device = Arc::new(MemoryDevice::new(kinds::builtin_registry()));
        device.fail_next(CallKind::Create, "a", 2, ClientError::transport(Some(503), "busy"));
        let report = run(&device, vec![address("a")], Vec::new(), &fast_options());
        assert!(report.is_success());
        assert_eq!(report.results[0].attempts, 3);
    }

    #[test]
    fn test_op_timeout_fails_op() {
        let device = Arc::new(MemoryDevice::new(kinds::builtin_registry()).with_latency(Duration::from_millis(200)));
        let opts = ExecuteOptions {
            timeouts: Timeouts {
                op: Duration::from_millis(20),
                stage: Duration::from_secs(5),
            },
            retry: RetryConfig::no_retry(),
            ..fast_options()
        };
        let report = run(&device, vec![address("a")], Vec::new(), &opts);
        let failure = &report.failures()[0];
        assert_eq!(failure.kind, crate::error::ErrorKind::Timeout);
    }

    /// Stores every write at once but answers the first create late
    struct SlowAck {
        device: Arc<MemoryDevice>,
        delay: Duration,
        creates: AtomicUsize,
    }

    impl ConfigClient for SlowAck {
        fn read(&self, location: &Location, kind: &str, name: &str) -> ClientResult<crate::client::Entry> {
            self.device.read(location, kind, name)
        }

        fn list(&self, location: &Location, kind: &str) -> ClientResult<Vec<crate::client::Entry>> {
            self.device.list(location, kind)
        }

        fn create(&self, location: &Location, kind: &str, name: &str, body: &Raw) -> ClientResult<crate::client::Entry> {
            let issued = self.creates.fetch_add(1, Ordering::SeqCst);
            let entry = self.device.create(location, kind, name, body);
            if issued == 0 {
                thread::sleep(self.delay);
            }
            entry
        }

        fn update(&self, location: &Location, kind: &str, name: &str, body: &Raw) -> ClientResult<()> {
            self.device.update(location, kind, name, body)
        }

        fn delete(&self, location: &Location, kind: &str, names: &[String]) -> ClientResult<()> {
            self.device.delete(location, kind, names)
        }

        fn move_entry(&self, location: &Location, kind: &str, name: &str, position: &Position) -> ClientResult<()> {
            self.device.move_entry(location, kind, name, position)
        }
    }

    #[test]
    fn test_late_answer_is_awaited_instead_of_resending() {
        let registry = kinds::builtin_registry();
        let device = Arc::new(MemoryDevice::new(registry.clone()));
        let slow = Arc::new(SlowAck {
            device: device.clone(),
            delay: Duration::from_millis(300),
            creates: AtomicUsize::new(0),
        });
        let client: Arc<dyn ConfigClient> = slow.clone();
        let opts = ExecuteOptions {
            timeouts: Timeouts {
                op: Duration::from_millis(50),
                stage: Duration::from_secs(5),
            },
            ..fast_options()
        };
        let plan = planner::plan(
            &registry,
            &PlanInput {
                declared: vec![address("a")],
                ..PlanInput::default()
            },
        )
        .unwrap();

        let report = execute(&client, &registry, &plan, &opts, &CancellationToken::new(), &mut NoProgress).unwrap();
        assert!(report.is_success(), "{:?}", report.error());
        assert_eq!(slow.creates.load(Ordering::SeqCst), 1);
        assert_eq!(report.results[0].attempts, 2);
        assert!(report.applied.contains_key(&address("a").key));
        assert_eq!(device.names(&Location::shared(), "address"), vec!["a"]);
    }

    #[test]
    fn test_dependents_of_failed_op_are_skipped() {
        let device = Arc::new(MemoryDevice::new(kinds::builtin_registry()));
        device.fail_next(CallKind::Create, "a", 1, ClientError::Rejected("no".into()));
        let group = Resource::new(
            ResourceKey::new("address_group", Location::shared(), "g"),
            Value::object([("members", Value::variant("static", Value::string_set(["a"])))]),
        );
        let opts = ExecuteOptions {
            continue_on_failure: true,
            ..fast_options()
        };
        let report = run(&device, vec![address("a"), group], Vec::new(), &opts);
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.summary.skipped, 1);
        assert!(matches!(report.error(), Some(Error::PartialApply { .. })));
    }

    #[test]
    fn test_deletes_of_one_scope_share_a_call() {
        let device = Arc::new(MemoryDevice::new(kinds::builtin_registry()));
        for name in ["a", "b", "c"] {
            device.insert(&Location::shared(), "address", name, json!({"ip_netmask": "10.0.0.1/32"}));
        }
        let observed = vec![address("a"), address("b"), address("c")];
        let report = run(&device, Vec::new(), observed, &fast_options());
        assert_eq!(report.summary.deleted, 3);
        let deletes: Vec<_> = device
            .calls()
            .into_iter()
            .filter(|c| c.call == CallKind::Delete)
            .collect();
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cancelled_apply_skips_everything() {
        let device = Arc::new(MemoryDevice::new(kinds::builtin_registry()));
        let registry = kinds::builtin_registry();
        let plan = planner::plan(
            &registry,
            &PlanInput {
                declared: vec![address("a")],
                ..PlanInput::default()
            },
        )
        .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let client: Arc<dyn ConfigClient> = device.clone();
        let report = execute(&client, &registry, &plan, &fast_options(), &cancel, &mut NoProgress).unwrap();
        assert!(report.cancelled);
        assert_eq!(report.summary.skipped, 1);
        assert!(matches!(report.error(), Some(Error::Cancelled)));
        assert!(device.writes().is_empty());
    }

    #[test]
    fn test_commit_after_successful_apply() {
        let device = Arc::new(MemoryDevice::new(kinds::builtin_registry()).with_commit());
        let report = run(&device, vec![address("a")], Vec::new(), &fast_options());
        assert!(report.committed);
        assert_eq!(device.commits(), 1);
    }

    #[test]
    fn test_mark_unset_nulls_previous_tag() {
        let mut raw = json!({"action": {"allow": {"update": {"as_path": {"remove": {}}}}}});
        let path = AttrPath::from_fields(&["action"])
            .tag("allow")
            .field("update")
            .field("as_path")
            .tag("prepend");
        mark_unset(&mut raw, &path);
        assert_eq!(
            raw,
            json!({"action": {"allow": {"update": {"as_path": {"remove": {}, "prepend": null}}}}})
        );
    }
}
