//! Reference extraction and dependency graphs
//!
//! References are string attributes whose schema marks them as naming
//! another resource. They are found by walking a value alongside its schema.

use crate::path::AttrPath;
use crate::schema::{NodeType, ObjectSchema, Reference, Schema, SchemaRegistry};
use crate::types::ResourceKey;
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// One reference found in a resource body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefSite {
    pub path: AttrPath,
    /// Name of the referenced resource
    pub target: String,
    /// Kinds the name may resolve to
    pub kinds: Vec<String>,
}

/// Collect every reference in `body`, in pre-order
///
/// Wildcard literals and unknown values are skipped.
pub fn references(schema: &Schema, body: &Value) -> Vec<RefSite> {
    let mut sites = Vec::new();
    refs_in_object(&schema.body, body, &AttrPath::root(), &mut sites);
    sites
}

fn refs_in_object(schema: &ObjectSchema, value: &Value, path: &AttrPath, sites: &mut Vec<RefSite>) {
    let Value::Object(fields) = value else {
        return;
    };
    for attr in schema.plain_attributes() {
        if let Some(field) = fields.get(&attr.name) {
            refs_in_node(&attr.node, field, &path.field(&attr.name), sites);
        }
    }
    for group in &schema.groups {
        if let Some(Value::Variant(tag, payload)) = fields.get(&group.name)
            && let Some(member) = schema.member(&group.name, tag)
        {
            refs_in_node(&member.node, payload, &path.tag(tag), sites);
        }
    }
}

fn refs_in_node(node: &NodeType, value: &Value, path: &AttrPath, sites: &mut Vec<RefSite>) {
    match (node, value) {
        (NodeType::String(spec), Value::String(s)) => {
            if let Some(reference) = &spec.reference {
                push_site(reference, s, path, sites);
            }
        }
        (NodeType::List(element) | NodeType::Set { element, .. }, Value::List(items) | Value::Set(items)) => {
            for (i, item) in items.iter().enumerate() {
                refs_in_node(element, item, &path.index(i), sites);
            }
        }
        (NodeType::Object(object), value) => refs_in_object(object, value, path, sites),
        _ => {}
    }
}

fn push_site(reference: &Reference, target: &str, path: &AttrPath, sites: &mut Vec<RefSite>) {
    if reference.is_wildcard(target) {
        return;
    }
    sites.push(RefSite {
        path: path.clone(),
        target: target.to_string(),
        kinds: reference.kinds.clone(),
    });
}

/// Kinds whose names collide at one location
///
/// Two kinds share a namespace when some reference may resolve to either
/// of them; a name held by one is then unavailable to the other.
#[derive(Debug, Clone, Default)]
pub struct Namespaces {
    groups: Vec<BTreeSet<String>>,
}

impl Namespaces {
    pub fn new(registry: &SchemaRegistry) -> Self {
        let mut groups = Vec::new();
        for schema in registry.schemas() {
            namespaces_in_object(&schema.body, &mut groups);
        }
        Self { groups }
    }

    pub fn shared(&self, a: &str, b: &str) -> bool {
        a == b || self.groups.iter().any(|g| g.contains(a) && g.contains(b))
    }

    /// Kinds other than `kind` sharing its namespace
    pub fn peers<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a str> {
        let peers: BTreeSet<&str> = self
            .groups
            .iter()
            .filter(|g| g.contains(kind))
            .flatten()
            .map(String::as_str)
            .filter(|k| *k != kind)
            .collect();
        peers.into_iter()
    }
}

fn namespaces_in_object(object: &ObjectSchema, groups: &mut Vec<BTreeSet<String>>) {
    for attr in &object.attributes {
        namespaces_in_node(&attr.node, groups);
    }
}

fn namespaces_in_node(node: &NodeType, groups: &mut Vec<BTreeSet<String>>) {
    match node {
        NodeType::String(spec) => {
            if let Some(reference) = spec.reference.as_ref().filter(|r| r.kinds.len() > 1) {
                let group: BTreeSet<String> = reference.kinds.iter().cloned().collect();
                if !groups.contains(&group) {
                    groups.push(group);
                }
            }
        }
        NodeType::List(element) | NodeType::Set { element, .. } => namespaces_in_node(element, groups),
        NodeType::Object(object) => namespaces_in_object(object, groups),
        NodeType::Bool | NodeType::Int { .. } => {}
    }
}

/// Resolve a reference made from `from`
///
/// Tries each location of the lookup chain in order and, within a location,
/// each admissible kind in order. Returns the first key `exists` accepts.
pub fn resolve(
    from: &ResourceKey,
    site: &RefSite,
    mut exists: impl FnMut(&ResourceKey) -> bool,
) -> Option<ResourceKey> {
    for location in from.location.lookup_chain() {
        for kind in &site.kinds {
            let candidate = ResourceKey::new(kind.clone(), location.clone(), site.target.clone());
            if exists(&candidate) {
                return Some(candidate);
            }
        }
    }
    None
}

/// Directed acyclic graph where an edge `a -> b` means `a` depends on `b`
#[derive(Debug, Clone)]
pub struct Dag<N: Ord + Clone> {
    /// node -> nodes it depends on
    deps: BTreeMap<N, BTreeSet<N>>,
}

impl<N: Ord + Clone> Default for Dag<N> {
    fn default() -> Self {
        Self {
            deps: BTreeMap::new(),
        }
    }
}

impl<N: Ord + Clone> Dag<N> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: N) {
        self.deps.entry(node).or_default();
    }

    /// Record that `node` depends on `on`
    pub fn add_edge(&mut self, node: N, on: N) {
        self.add_node(on.clone());
        self.deps.entry(node).or_default().insert(on);
    }

    pub fn contains(&self, node: &N) -> bool {
        self.deps.contains_key(node)
    }

    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    pub fn dependencies(&self, node: &N) -> impl Iterator<Item = &N> {
        self.deps.get(node).into_iter().flatten()
    }

    /// Group nodes by longest-path depth
    ///
    /// Level 0 holds nodes with no dependencies; every node sits one level
    /// above its deepest dependency. Nodes within a level are sorted.
    /// Returns the cycle when the graph has one.
    pub fn levels(&self) -> Result<Vec<Vec<N>>, Vec<N>> {
        let mut remaining: BTreeMap<&N, usize> =
            self.deps.iter().map(|(n, deps)| (n, deps.len())).collect();
        let mut dependents: BTreeMap<&N, Vec<&N>> = BTreeMap::new();
        for (node, deps) in &self.deps {
            for dep in deps {
                dependents.entry(dep).or_default().push(node);
            }
        }

        let mut level_of: BTreeMap<&N, usize> = BTreeMap::new();
        let mut queue: VecDeque<&N> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(n, _)| *n)
            .collect();

        while let Some(node) = queue.pop_front() {
            let level = self.deps[node]
                .iter()
                .filter_map(|d| level_of.get(d))
                .max()
                .map_or(0, |l| l + 1);
            level_of.insert(node, level);

            for dependent in dependents.get(node).into_iter().flatten() {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        queue.push_back(*dependent);
                    }
                }
            }
        }

        if level_of.len() != self.deps.len() {
            return Err(self.find_cycle().unwrap_or_default());
        }

        let depth = level_of.values().max().map_or(0, |l| l + 1);
        let mut levels = vec![Vec::new(); depth];
        for (node, level) in level_of {
            levels[level].push(node.clone());
        }
        for level in &mut levels {
            level.sort();
        }
        Ok(levels)
    }

    /// First cycle found by a depth-first search in node order
    ///
    /// The returned path starts and ends with the same node.
    pub fn find_cycle(&self) -> Option<Vec<N>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a, N: Ord + Clone>(
            dag: &'a Dag<N>,
            node: &'a N,
            marks: &mut BTreeMap<&'a N, Mark>,
            stack: &mut Vec<&'a N>,
        ) -> Option<Vec<N>> {
            match marks.get(node) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => {
                    let start = stack.iter().position(|n| *n == node).unwrap_or(0);
                    let mut cycle: Vec<N> = stack[start..].iter().map(|n| (*n).clone()).collect();
                    cycle.push(node.clone());
                    return Some(cycle);
                }
                None => {}
            }
            marks.insert(node, Mark::Visiting);
            stack.push(node);
            for dep in dag.dependencies(node) {
                if let Some(cycle) = visit(dag, dep, marks, stack) {
                    return Some(cycle);
                }
            }
            stack.pop();
            marks.insert(node, Mark::Done);
            None
        }

        let mut marks = BTreeMap::new();
        let mut stack = Vec::new();
        self.deps
            .keys()
            .find_map(|node| visit(self, node, &mut marks, &mut stack))
    }
}
