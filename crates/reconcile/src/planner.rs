//! Execution planner - turns declared and observed state into staged ops
//!
//! Planning is pure: it reads nothing from the device. The caller supplies
//! the observed set and the names of unmanaged resources known to exist.

use crate::client::Position;
use crate::codec;
use crate::diff::{self, Change, FieldChange, ResourceDiff, ResourceMap};
use crate::error::{Error, Result};
use crate::graph::{self, Dag};
use crate::location::Location;
use crate::ordered;
use crate::path::AttrPath;
use crate::schema::SchemaRegistry;
use crate::types::{Resource, ResourceKey};
use crate::validate;
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Element kind and location identifying one ordered collection on the device
pub type Scope = (String, Location);

/// Everything the planner needs
#[derive(Debug, Clone, Default)]
pub struct PlanInput {
    /// Desired resources
    pub declared: Vec<Resource>,
    /// Managed resources as read from the device
    pub observed: Vec<Resource>,
    /// Unmanaged resources known to exist on the device
    pub external: BTreeSet<ResourceKey>,
}

/// Kind of a plan operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OpKind {
    Delete,
    Update,
    Create,
    Move,
}

impl OpKind {
    /// Single-character marker used when rendering plans
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Delete => "-",
            Self::Move => "↕",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
            Self::Move => write!(f, "move"),
        }
    }
}

/// What an operation does
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Create with the full body; `placement` positions a new collection entry
    Create {
        body: Value,
        placement: Option<Position>,
    },
    /// Replace the body; `changes` lists what differs
    Update {
        body: Value,
        changes: Vec<FieldChange>,
    },
    Delete,
    /// Reposition a collection entry
    Move { position: Position },
}

/// One step of a plan
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    /// Index in plan order
    pub id: usize,
    /// Device-side identity; collection entries use their element kind
    pub key: ResourceKey,
    pub action: Action,
    /// Ops that must complete first
    pub depends_on: Vec<usize>,
    /// Collection owning this entry, for collection entries
    pub collection: Option<ResourceKey>,
    pub stage: usize,
}

impl Operation {
    pub fn kind(&self) -> OpKind {
        match self.action {
            Action::Create { .. } => OpKind::Create,
            Action::Update { .. } => OpKind::Update,
            Action::Delete => OpKind::Delete,
            Action::Move { .. } => OpKind::Move,
        }
    }

    /// Body sent to the device, for creates and updates
    pub fn body(&self) -> Option<&Value> {
        match &self.action {
            Action::Create { body, .. } | Action::Update { body, .. } => Some(body),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.action {
            Action::Move { position } => write!(f, "move {} {position}", self.key),
            Action::Create {
                placement: Some(position),
                ..
            } if *position != Position::Bottom => write!(f, "create {} {position}", self.key),
            _ => write!(f, "{} {}", self.kind(), self.key),
        }
    }
}

/// Ops that may run concurrently
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub index: usize,
    pub ops: Vec<Operation>,
}

/// Desired entry order of a declared ordered collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionOrder {
    pub collection: ResourceKey,
    pub element_kind: String,
    pub order: Vec<String>,
}

/// Plan summary counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
    pub moves: usize,
}

impl PlanSummary {
    pub fn total(&self) -> usize {
        self.creates + self.updates + self.deletes + self.moves
    }
}

/// A staged execution plan
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    /// Stages run sequentially, ops within a stage concurrently
    pub stages: Vec<Stage>,
    /// Planned state of every declared resource; unknowns fill in on apply
    pub planned: BTreeMap<ResourceKey, Value>,
    /// Declared ordered collections, for post-apply order checks
    pub collections: Vec<CollectionOrder>,
}

impl Plan {
    /// All ops in plan order
    pub fn ops(&self) -> impl Iterator<Item = &Operation> {
        self.stages.iter().flat_map(|s| s.ops.iter())
    }

    pub fn len(&self) -> usize {
        self.stages.iter().map(|s| s.ops.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn op(&self, id: usize) -> Option<&Operation> {
        self.ops().find(|op| op.id == id)
    }

    /// Ops touching a device key
    pub fn ops_for<'a>(&'a self, key: &'a ResourceKey) -> impl Iterator<Item = &'a Operation> {
        self.ops().filter(move |op| &op.key == key)
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for op in self.ops() {
            match op.kind() {
                OpKind::Create => summary.creates += 1,
                OpKind::Update => summary.updates += 1,
                OpKind::Delete => summary.deletes += 1,
                OpKind::Move => summary.moves += 1,
            }
        }
        summary
    }
}

/// Declared or observed resources with ordered collections expanded into
/// their entries
#[derive(Debug, Default)]
struct Expanded {
    resources: ResourceMap,
    /// entry key -> owning collection and the entry's path inside it
    origins: BTreeMap<ResourceKey, (ResourceKey, AttrPath)>,
    /// scope -> owning collection and entry order
    orders: BTreeMap<Scope, (ResourceKey, Vec<String>)>,
}

impl Expanded {
    /// Key and path prefix to report errors against
    fn origin(&self, key: &ResourceKey) -> (ResourceKey, AttrPath) {
        self.origins
            .get(key)
            .cloned()
            .unwrap_or_else(|| (key.clone(), AttrPath::root()))
    }

    fn collection_of(&self, key: &ResourceKey) -> Option<&ResourceKey> {
        self.origins.get(key).map(|(collection, _)| collection)
    }
}

/// Index resources by key, splitting ordered collections into entries
///
/// Unknown kinds are skipped; declared ones are reported by validation.
fn expand(registry: &SchemaRegistry, resources: &[Resource], errors: &mut Vec<Error>) -> Expanded {
    let mut out = Expanded::default();
    let mut seen = BTreeSet::new();

    for resource in resources {
        if !seen.insert(&resource.key) {
            errors.push(Error::validation(
                AttrPath::root(),
                format!("{} is declared more than once", resource.key),
            ));
            continue;
        }
        let Ok(schema) = registry.lookup(resource.kind()) else {
            continue;
        };

        let Some(ordered) = &schema.ordered else {
            out.resources.insert(resource.key.clone(), resource.clone());
            continue;
        };

        let scope = (ordered.element_kind.clone(), resource.location().clone());
        if let Some((owner, _)) = out.orders.get(&scope) {
            errors.push(Error::validation(
                AttrPath::root(),
                format!(
                    "{}: the {} entries at {} are already managed by {owner}",
                    resource.key,
                    ordered.element_kind,
                    resource.location()
                ),
            ));
            continue;
        }

        let base = AttrPath::root().field(&ordered.attribute);
        let mut order = Vec::new();
        for (i, entry) in resource.body.get(&ordered.attribute).items().unwrap_or_default().iter().enumerate() {
            let Some(name) = entry.get("name").as_str() else {
                continue;
            };
            let key = ResourceKey::new(ordered.element_kind.clone(), resource.location().clone(), name);
            if out.resources.contains_key(&key) {
                continue;
            }
            let mut body = entry.clone();
            if let Some(fields) = body.as_object_mut() {
                fields.remove("name");
            }
            order.push(name.to_string());
            out.origins
                .insert(key.clone(), (resource.key.clone(), base.index(i)));
            out.resources.insert(key.clone(), Resource::new(key, body));
        }
        out.orders.insert(scope, (resource.key.clone(), order));
    }
    out
}

/// Fill schema defaults into every body
///
/// Applied to both sides: an observed attribute the device left unset
/// takes its default there as well.
fn with_defaults(registry: &SchemaRegistry, resources: &[Resource]) -> Vec<Resource> {
    resources
        .iter()
        .map(|r| match registry.lookup(r.kind()) {
            Ok(schema) => Resource {
                body: codec::apply_defaults(&r.body, &schema.body),
                ..r.clone()
            },
            Err(_) => r.clone(),
        })
        .collect()
}

/// Build a staged plan
///
/// Fails before emitting anything on validation errors, unresolved
/// references, or reference cycles.
pub fn plan(registry: &SchemaRegistry, input: &PlanInput) -> Result<Plan> {
    let mut errors = Vec::new();
    for resource in &input.declared {
        errors.extend(validate::check_resource(registry, resource));
    }
    for resource in &input.observed {
        if let Err(e) = registry.lookup(resource.kind()) {
            errors.push(e);
        }
    }
    let declared_input = with_defaults(registry, &input.declared);
    let declared = expand(registry, &declared_input, &mut errors);
    let observed = expand(registry, &with_defaults(registry, &input.observed), &mut errors);
    if let Some(e) = Error::from_many(errors) {
        return Err(e);
    }

    let diffs = diff::compute_diffs(registry, &declared.resources, &observed.resources)?;
    let deleting: BTreeSet<&ResourceKey> = diffs
        .iter()
        .filter(|d| d.change == Change::Delete)
        .map(|d| &d.key)
        .collect();

    let deps = declared_dependencies(registry, &declared, &observed, &deleting, &input.external)?;
    let referrers = observed_referrers(registry, &observed, &input.external)?;

    let mut builder = OpBuilder::default();
    for d in &diffs {
        let collection = declared
            .collection_of(&d.key)
            .or_else(|| observed.collection_of(&d.key))
            .cloned();
        builder.push_diff(d, collection);
    }

    for (key, targets) in &deps {
        if let Some(op) = builder.write_op(key) {
            for target in targets {
                if let Some(dep) = builder.write_op(target) {
                    builder.dag.add_edge(op, dep);
                }
            }
        }
    }
    for (target, sources) in &referrers {
        if let Some(op) = builder.delete_op(target) {
            for source in sources {
                if let Some(dep) = builder.release_op(source) {
                    builder.dag.add_edge(op, dep);
                }
            }
        }
    }

    // A name is taken only once the resource holding it is gone
    let namespaces = graph::Namespaces::new(registry);
    for created in diffs.iter().filter(|d| d.change == Change::Create) {
        let freed = deleting.iter().filter(|gone| {
            gone.location == created.key.location
                && gone.name == created.key.name
                && namespaces.shared(&gone.kind, &created.key.kind)
        });
        for gone in freed {
            let (Some(op), Some(dep)) = (builder.write_op(&created.key), builder.delete_op(gone)) else {
                continue;
            };
            if builder.waits_on(dep, op) {
                log::debug!("{gone} is released only after {} is created", created.key);
            } else {
                builder.dag.add_edge(op, dep);
            }
        }
    }

    let scopes: BTreeSet<&Scope> = declared.orders.keys().chain(observed.orders.keys()).collect();
    for scope in scopes {
        let desired = declared.orders.get(scope);
        let current = observed.orders.get(scope);
        builder.order_collection(
            scope,
            current.map(|(_, o)| o.as_slice()).unwrap_or_default(),
            desired.map(|(_, o)| o.as_slice()).unwrap_or_default(),
            desired.or(current).map(|(k, _)| k.clone()),
        );
    }

    let stages = builder.into_stages()?;
    let planned = planned_state(registry, &declared_input, &declared, &observed, &diffs)?;
    let collections = declared
        .orders
        .iter()
        .map(|((element_kind, _), (collection, order))| CollectionOrder {
            collection: collection.clone(),
            element_kind: element_kind.clone(),
            order: order.clone(),
        })
        .collect();

    let plan = Plan {
        stages,
        planned,
        collections,
    };
    log::debug!(
        "Planned {} ops in {} stages",
        plan.len(),
        plan.stages.len()
    );
    Ok(plan)
}

/// Resolve every declared reference; edges point at declared referents
fn declared_dependencies(
    registry: &SchemaRegistry,
    declared: &Expanded,
    observed: &Expanded,
    deleting: &BTreeSet<&ResourceKey>,
    external: &BTreeSet<ResourceKey>,
) -> Result<BTreeMap<ResourceKey, BTreeSet<ResourceKey>>> {
    let mut dag = Dag::new();
    let mut deps: BTreeMap<ResourceKey, BTreeSet<ResourceKey>> = BTreeMap::new();
    let mut errors = Vec::new();

    for (key, resource) in &declared.resources {
        dag.add_node(key.clone());
        let schema = registry.lookup(&key.kind)?;
        for site in graph::references(schema, &resource.body) {
            let found = graph::resolve(key, &site, |k| {
                declared.resources.contains_key(k)
                    || (observed.resources.contains_key(k) && !deleting.contains(k))
                    || external.contains(k)
            });
            match found {
                Some(target) if declared.resources.contains_key(&target) => {
                    dag.add_edge(key.clone(), target.clone());
                    deps.entry(key.clone()).or_default().insert(target);
                }
                Some(_) => {}
                None => {
                    let (from, prefix) = declared.origin(key);
                    errors.push(Error::UnresolvedReference {
                        from,
                        path: prefix.join(&site.path),
                        target: site.target,
                        kinds: site.kinds,
                    });
                }
            }
        }
    }

    if let Some(e) = Error::from_many(errors) {
        return Err(e);
    }
    if let Err(cycle) = dag.levels() {
        return Err(Error::CyclicDependency { cycle });
    }
    Ok(deps)
}

/// For each observed resource, the observed resources referring to it
fn observed_referrers(
    registry: &SchemaRegistry,
    observed: &Expanded,
    external: &BTreeSet<ResourceKey>,
) -> Result<BTreeMap<ResourceKey, BTreeSet<ResourceKey>>> {
    let mut referrers: BTreeMap<ResourceKey, BTreeSet<ResourceKey>> = BTreeMap::new();
    for (key, resource) in &observed.resources {
        let schema = registry.lookup(&key.kind)?;
        for site in graph::references(schema, &resource.body) {
            let found = graph::resolve(key, &site, |k| {
                observed.resources.contains_key(k) || external.contains(k)
            });
            if let Some(target) = found.filter(|t| observed.resources.contains_key(t)) {
                referrers.entry(target).or_default().insert(key.clone());
            }
        }
    }
    Ok(referrers)
}

/// Ops under construction and their dependency graph
#[derive(Debug, Default)]
struct OpBuilder {
    ops: Vec<Operation>,
    dag: Dag<usize>,
    by_key: BTreeMap<ResourceKey, usize>,
}

impl OpBuilder {
    fn push(&mut self, key: ResourceKey, action: Action, collection: Option<ResourceKey>) -> usize {
        let id = self.ops.len();
        self.ops.push(Operation {
            id,
            key,
            action,
            depends_on: Vec::new(),
            collection,
            stage: 0,
        });
        self.dag.add_node(id);
        id
    }

    fn push_diff(&mut self, diff: &ResourceDiff, collection: Option<ResourceKey>) {
        let body = || {
            diff.declared
                .as_ref()
                .map(|r| r.body.clone())
                .unwrap_or(Value::Null)
        };
        let action = match diff.change {
            Change::Create => Action::Create {
                body: body(),
                placement: None,
            },
            Change::Update => Action::Update {
                body: body(),
                changes: diff.fields.clone(),
            },
            Change::Delete => Action::Delete,
        };
        let id = self.push(diff.key.clone(), action, collection);
        self.by_key.insert(diff.key.clone(), id);
    }

    fn op_matching(&self, key: &ResourceKey, kinds: &[OpKind]) -> Option<usize> {
        self.by_key
            .get(key)
            .copied()
            .filter(|id| kinds.contains(&self.ops[*id].kind()))
    }

    /// Create or update writing `key`
    fn write_op(&self, key: &ResourceKey) -> Option<usize> {
        self.op_matching(key, &[OpKind::Create, OpKind::Update])
    }

    fn delete_op(&self, key: &ResourceKey) -> Option<usize> {
        self.op_matching(key, &[OpKind::Delete])
    }

    /// Whether `from` already runs after `to`
    fn waits_on(&self, from: usize, to: usize) -> bool {
        let mut stack = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if seen.insert(id) {
                stack.extend(self.dag.dependencies(&id).copied());
            }
        }
        false
    }

    /// Op after which `key` no longer refers to what it used to
    fn release_op(&self, key: &ResourceKey) -> Option<usize> {
        self.op_matching(key, &[OpKind::Delete, OpKind::Update])
    }

    /// Sequence deletes, moves and creates of one ordered collection
    fn order_collection(
        &mut self,
        scope: &Scope,
        current: &[String],
        desired: &[String],
        collection: Option<ResourceKey>,
    ) {
        let (element_kind, location) = scope;
        let key = |name: &str| ResourceKey::new(element_kind.clone(), location.clone(), name);

        let mut settle = Vec::new();
        for name in current {
            if let Some(id) = self.release_op(&key(name)) {
                settle.push(id);
            }
        }

        let plan = ordered::reconcile_order(current, desired);
        let mut previous: Option<usize> = None;
        for m in plan.moves {
            let id = self.push(
                key(&m.name),
                Action::Move {
                    position: m.position,
                },
                collection.clone(),
            );
            match previous {
                Some(prev) => self.dag.add_edge(id, prev),
                None => {
                    for dep in &settle {
                        self.dag.add_edge(id, *dep);
                    }
                }
            }
            previous = Some(id);
        }

        let mut last_at_anchor: BTreeMap<Position, usize> = BTreeMap::new();
        for placement in plan.placements {
            let Some(id) = self.write_op(&key(&placement.name)) else {
                continue;
            };
            if let Action::Create { placement: slot, .. } = &mut self.ops[id].action {
                *slot = Some(placement.position.clone());
            }
            for dep in &settle {
                self.dag.add_edge(id, *dep);
            }
            if let Some(last_move) = previous {
                self.dag.add_edge(id, last_move);
            }
            if let Some(prev) = last_at_anchor.insert(placement.position, id) {
                self.dag.add_edge(id, prev);
            }
        }
    }

    /// Assign stages by dependency depth and number ops in plan order
    fn into_stages(self) -> Result<Vec<Stage>> {
        let levels = self.dag.levels().map_err(|cycle| {
            Error::Internal(format!("operation graph has a cycle through ops {cycle:?}"))
        })?;

        let mut order: Vec<(usize, usize)> = Vec::new();
        for (stage, ids) in levels.iter().enumerate() {
            let mut ids = ids.clone();
            ids.sort_by(|a, b| {
                let (x, y) = (&self.ops[*a], &self.ops[*b]);
                (&x.key, x.kind()).cmp(&(&y.key, y.kind()))
            });
            order.extend(ids.into_iter().map(|id| (stage, id)));
        }
        let renumber: BTreeMap<usize, usize> = order
            .iter()
            .enumerate()
            .map(|(new, (_, old))| (*old, new))
            .collect();

        let mut stages: Vec<Stage> = (0..levels.len())
            .map(|index| Stage {
                index,
                ops: Vec::new(),
            })
            .collect();
        for (stage, old) in order {
            let mut op = self.ops[old].clone();
            op.id = renumber[&old];
            op.stage = stage;
            op.depends_on = self.dag.dependencies(&old).map(|d| renumber[d]).collect();
            op.depends_on.sort_unstable();
            stages[stage].ops.push(op);
        }

        for stage in &stages {
            let mut keys = BTreeSet::new();
            for op in &stage.ops {
                if !keys.insert(&op.key) {
                    return Err(Error::Internal(format!(
                        "stage {} touches {} more than once",
                        stage.index, op.key
                    )));
                }
            }
        }
        Ok(stages)
    }
}

/// Planned value of every declared resource
fn planned_state(
    registry: &SchemaRegistry,
    declared_input: &[Resource],
    declared: &Expanded,
    observed: &Expanded,
    diffs: &[ResourceDiff],
) -> Result<BTreeMap<ResourceKey, Value>> {
    let creates: BTreeSet<&ResourceKey> = diffs
        .iter()
        .filter(|d| d.change == Change::Create)
        .map(|d| &d.key)
        .collect();

    let planned_body = |key: &ResourceKey, body: &Value| -> Result<Value> {
        let schema = registry.lookup(&key.kind)?;
        Ok(match observed.resources.get(key) {
            Some(have) if !creates.contains(key) => codec::carry_computed(body, &have.body, &schema.body),
            _ => codec::mark_computed_unknown(body, &schema.body),
        })
    };

    let mut planned = BTreeMap::new();
    for resource in declared_input {
        let schema = registry.lookup(resource.kind())?;
        let value = match &schema.ordered {
            None => planned_body(&resource.key, &resource.body)?,
            Some(ordered) => {
                let scope = (ordered.element_kind.clone(), resource.location().clone());
                let names = declared
                    .orders
                    .get(&scope)
                    .map(|(_, order)| order.as_slice())
                    .unwrap_or_default();
                let mut entries = Vec::with_capacity(names.len());
                for name in names {
                    let key = ResourceKey::new(ordered.element_kind.clone(), resource.location().clone(), name.clone());
                    let Some(entry) = declared.resources.get(&key) else {
                        continue;
                    };
                    let mut value = planned_body(&key, &entry.body)?;
                    if let Some(fields) = value.as_object_mut() {
                        fields.insert("name".to_string(), Value::String(name.clone()));
                    }
                    entries.push(value);
                }
                Value::object([(ordered.attribute.clone(), Value::List(entries))])
            }
        };
        planned.insert(resource.key.clone(), value);
    }
    Ok(planned)
}
