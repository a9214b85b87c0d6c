//! In-memory device
//!
//! [`MemoryDevice`] implements [`ConfigClient`] over a process-local store.
//! It behaves like a device for the purposes of reconciliation: entries
//! keep server order, creates append, deletes refuse entries that are still
//! referenced, and computed attributes are filled in on create. Calls are
//! logged and can be made to fail on demand.

use crate::client::{ClientError, ClientResult, ConfigClient, Entry, NameFailure, Position};
use crate::codec;
use crate::graph;
use crate::location::Location;
use crate::ordered;
use crate::schema::{NodeType, Presence, Schema, SchemaRegistry};
use crate::types::ResourceKey;
use serde::{Deserialize, Serialize};
use serde_json::Value as Raw;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

/// Device call classes, for the call log and fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Read,
    List,
    Create,
    Update,
    Delete,
    Move,
    Commit,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Read => "read",
            Self::List => "list",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Move => "move",
            Self::Commit => "commit",
        };
        write!(f, "{s}")
    }
}

/// One logged device call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub call: CallKind,
    /// Absent for commit
    pub location: Option<Location>,
    pub kind: String,
    pub names: Vec<String>,
}

#[derive(Debug, Clone)]
struct Fault {
    call: CallKind,
    name: String,
    remaining: usize,
    error: ClientError,
}

/// Entries of one kind at one location, in device order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeSnapshot {
    pub location: Location,
    pub kind: String,
    pub entries: Vec<Entry>,
}

/// Serializable copy of a device's configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    #[serde(default)]
    pub scopes: Vec<ScopeSnapshot>,
    #[serde(default)]
    pub next_id: u64,
}

#[derive(Debug, Default)]
struct DeviceState {
    entries: BTreeMap<(Location, String), Vec<Entry>>,
    next_id: u64,
    faults: Vec<Fault>,
    calls: Vec<Call>,
    commits: usize,
    uncommitted: bool,
}

impl DeviceState {
    fn scope(&self, location: &Location, kind: &str) -> &[Entry] {
        self.entries
            .get(&(location.clone(), kind.to_string()))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn find(&self, location: &Location, kind: &str, name: &str) -> Option<&Entry> {
        self.scope(location, kind).iter().find(|e| e.name == name)
    }

    fn contains(&self, key: &ResourceKey) -> bool {
        self.find(&key.location, &key.kind, &key.name).is_some()
    }

    fn issue_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Consume a matching fault, if one is armed
    fn take_fault(&mut self, call: CallKind, name: &str) -> Option<ClientError> {
        let fault = self
            .faults
            .iter_mut()
            .find(|f| f.call == call && f.name == name && f.remaining > 0)?;
        fault.remaining -= 1;
        let error = fault.error.clone();
        self.faults.retain(|f| f.remaining > 0);
        Some(error)
    }
}

/// A device held in memory
#[derive(Debug)]
pub struct MemoryDevice {
    registry: SchemaRegistry,
    state: Mutex<DeviceState>,
    commit_required: bool,
    latency: Option<Duration>,
}

impl MemoryDevice {
    pub fn new(registry: SchemaRegistry) -> Self {
        Self {
            registry,
            state: Mutex::new(DeviceState::default()),
            commit_required: false,
            latency: None,
        }
    }

    /// Restore a device from a snapshot
    pub fn from_snapshot(registry: SchemaRegistry, snapshot: DeviceSnapshot) -> Self {
        let device = Self::new(registry);
        {
            let mut state = device.lock();
            for scope in snapshot.scopes {
                state.entries.insert((scope.location, scope.kind), scope.entries);
            }
            state.next_id = snapshot.next_id;
        }
        device
    }

    /// Require a commit before writes take effect
    pub fn with_commit(mut self) -> Self {
        self.commit_required = true;
        self
    }

    /// Delay every call by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        let state = self.lock();
        DeviceSnapshot {
            scopes: state
                .entries
                .iter()
                .filter(|(_, entries)| !entries.is_empty())
                .map(|((location, kind), entries)| ScopeSnapshot {
                    location: location.clone(),
                    kind: kind.clone(),
                    entries: entries.clone(),
                })
                .collect(),
            next_id: state.next_id,
        }
    }

    /// Store an entry directly, bypassing every device check
    pub fn insert(&self, location: &Location, kind: &str, name: &str, body: Raw) {
        let mut state = self.lock();
        let id = state.issue_id();
        let entry = Entry {
            name: name.to_string(),
            id: Some(id.to_string()),
            body,
        };
        let scope = state
            .entries
            .entry((location.clone(), kind.to_string()))
            .or_default();
        match scope.iter_mut().find(|e| e.name == name) {
            Some(existing) => *existing = entry,
            None => scope.push(entry),
        }
    }

    /// Entry names of one kind at one location, in device order
    pub fn names(&self, location: &Location, kind: &str) -> Vec<String> {
        self.lock()
            .scope(location, kind)
            .iter()
            .map(|e| e.name.clone())
            .collect()
    }

    pub fn get(&self, location: &Location, kind: &str, name: &str) -> Option<Entry> {
        self.lock().find(location, kind, name).cloned()
    }

    /// Fail the next `count` calls of class `call` naming `name`
    ///
    /// List calls are matched on the kind, commit on the empty name.
    pub fn fail_next(&self, call: CallKind, name: &str, count: usize, error: ClientError) {
        self.lock().faults.push(Fault {
            call,
            name: name.to_string(),
            remaining: count,
            error,
        });
    }

    /// Calls received so far, in arrival order
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Logged calls that change configuration
    pub fn writes(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c.call, CallKind::Read | CallKind::List))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Number of successful commits
    pub fn commits(&self) -> usize {
        self.lock().commits
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Log the call, wait out the latency, and return the guarded state
    fn begin(&self, call: CallKind, location: Option<&Location>, kind: &str, names: &[&str]) -> MutexGuard<'_, DeviceState> {
        if let Some(latency) = self.latency {
            thread::sleep(latency);
        }
        let mut state = self.lock();
        state.calls.push(Call {
            call,
            location: location.cloned(),
            kind: kind.to_string(),
            names: names.iter().map(|n| (*n).to_string()).collect(),
        });
        state
    }

    fn schema(&self, location: &Location, kind: &str) -> ClientResult<&Schema> {
        let schema = self
            .registry
            .lookup(kind)
            .map_err(|e| ClientError::Rejected(e.to_string()))?;
        if !schema.allows(location.kind()) {
            return Err(ClientError::Rejected(format!(
                "{kind} cannot be configured at {location}"
            )));
        }
        Ok(schema)
    }

    /// Parse a body the way the device would and check its references
    fn check_body(&self, state: &DeviceState, key: &ResourceKey, schema: &Schema, body: &Raw) -> ClientResult<()> {
        let value = codec::parse(body, &schema.body).map_err(|e| ClientError::Rejected(e.to_string()))?;
        for site in graph::references(schema, &value) {
            if graph::resolve(key, &site, |k| state.contains(k)).is_none() {
                return Err(ClientError::Rejected(format!(
                    "{} '{}' does not exist",
                    site.kinds.join(" or "),
                    site.target
                )));
            }
        }
        Ok(())
    }

    /// Entries outside `leaving` that refer to `target`
    fn referrers(&self, state: &DeviceState, target: &ResourceKey, leaving: &BTreeSet<ResourceKey>) -> Vec<ResourceKey> {
        let mut found = Vec::new();
        for ((location, kind), entries) in &state.entries {
            let Ok(schema) = self.registry.lookup(kind) else {
                continue;
            };
            for entry in entries {
                let key = ResourceKey::new(kind.clone(), location.clone(), entry.name.clone());
                if leaving.contains(&key) {
                    continue;
                }
                let Ok(value) = codec::parse(&entry.body, &schema.body) else {
                    continue;
                };
                let refers = graph::references(schema, &value).iter().any(|site| {
                    graph::resolve(&key, site, |k| state.contains(k)).as_ref() == Some(target)
                });
                if refers {
                    found.push(key);
                }
            }
        }
        found
    }
}

/// Fill computed attributes the body leaves unset
fn fill_computed(schema: &Schema, body: &mut Raw, id: u64) {
    let Some(fields) = body.as_object_mut() else {
        return;
    };
    for attr in schema.body.plain_attributes() {
        if attr.presence != Presence::Computed || !matches!(attr.node, NodeType::String(_)) {
            continue;
        }
        if fields.get(&attr.name).is_some_and(|v| !v.is_null()) {
            continue;
        }
        let generated = if attr.name == "uuid" {
            format!("00000000-0000-4000-8000-{id:012x}")
        } else {
            format!("{:016x}{:016x}", id.wrapping_mul(0x9e37_79b9_7f4a_7c15), id)
        };
        fields.insert(attr.name.clone(), Raw::String(generated));
    }
}

/// An explicit null removes the attribute
fn drop_nulls(body: &mut Raw) {
    match body {
        Raw::Object(fields) => {
            fields.retain(|_, v| !v.is_null());
            fields.values_mut().for_each(drop_nulls);
        }
        Raw::Array(items) => items.iter_mut().for_each(drop_nulls),
        _ => {}
    }
}

/// Copy computed attributes from the stored body where the new one lacks them
fn keep_computed(schema: &Schema, body: &mut Raw, stored: &Raw) {
    let (Some(fields), Some(prior)) = (body.as_object_mut(), stored.as_object()) else {
        return;
    };
    for attr in schema.body.plain_attributes() {
        if attr.presence != Presence::Computed || fields.get(&attr.name).is_some_and(|v| !v.is_null()) {
            continue;
        }
        if let Some(value) = prior.get(&attr.name) {
            fields.insert(attr.name.clone(), value.clone());
        }
    }
}

impl ConfigClient for MemoryDevice {
    fn read(&self, location: &Location, kind: &str, name: &str) -> ClientResult<Entry> {
        let mut state = self.begin(CallKind::Read, Some(location), kind, &[name]);
        if let Some(error) = state.take_fault(CallKind::Read, name) {
            return Err(error);
        }
        state.find(location, kind, name).cloned().ok_or(ClientError::NotFound)
    }

    fn list(&self, location: &Location, kind: &str) -> ClientResult<Vec<Entry>> {
        let mut state = self.begin(CallKind::List, Some(location), kind, &[]);
        if let Some(error) = state.take_fault(CallKind::List, kind) {
            return Err(error);
        }
        Ok(state.scope(location, kind).to_vec())
    }

    fn create(&self, location: &Location, kind: &str, name: &str, body: &Raw) -> ClientResult<Entry> {
        let mut state = self.begin(CallKind::Create, Some(location), kind, &[name]);
        if let Some(error) = state.take_fault(CallKind::Create, name) {
            return Err(error);
        }
        let schema = self.schema(location, kind)?;
        let namespaces = graph::Namespaces::new(&self.registry);
        let taken = std::iter::once(kind)
            .chain(namespaces.peers(kind))
            .any(|k| state.find(location, k, name).is_some());
        if taken {
            return Err(ClientError::Conflict);
        }
        let key = ResourceKey::new(kind, location.clone(), name);
        self.check_body(&state, &key, schema, body)?;

        let id = state.issue_id();
        let mut stored = body.clone();
        fill_computed(schema, &mut stored, id);
        let entry = Entry {
            name: name.to_string(),
            id: Some(id.to_string()),
            body: stored,
        };
        // Ephemeral kinds are issued, not stored
        if !schema.ephemeral {
            state
                .entries
                .entry((location.clone(), kind.to_string()))
                .or_default()
                .push(entry.clone());
            state.uncommitted = true;
        }
        Ok(entry)
    }

    fn update(&self, location: &Location, kind: &str, name: &str, body: &Raw) -> ClientResult<()> {
        let mut state = self.begin(CallKind::Update, Some(location), kind, &[name]);
        if let Some(error) = state.take_fault(CallKind::Update, name) {
            return Err(error);
        }
        let schema = self.schema(location, kind)?;
        let stored = state
            .find(location, kind, name)
            .map(|e| e.body.clone())
            .ok_or(ClientError::NotFound)?;
        let key = ResourceKey::new(kind, location.clone(), name);
        self.check_body(&state, &key, schema, body)?;

        let mut next = body.clone();
        drop_nulls(&mut next);
        keep_computed(schema, &mut next, &stored);
        if let Some(entry) = state
            .entries
            .get_mut(&(location.clone(), kind.to_string()))
            .and_then(|entries| entries.iter_mut().find(|e| e.name == name))
        {
            entry.body = next;
        }
        state.uncommitted = true;
        Ok(())
    }

    fn delete(&self, location: &Location, kind: &str, names: &[String]) -> ClientResult<()> {
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let mut state = self.begin(CallKind::Delete, Some(location), kind, &refs);

        let leaving: BTreeSet<ResourceKey> = names
            .iter()
            .map(|n| ResourceKey::new(kind, location.clone(), n.clone()))
            .collect();
        let mut failed = Vec::new();
        let mut removed = BTreeSet::new();
        for name in names {
            if let Some(error) = state.take_fault(CallKind::Delete, name) {
                failed.push(NameFailure {
                    name: name.clone(),
                    error,
                });
                continue;
            }
            let key = ResourceKey::new(kind, location.clone(), name.clone());
            if !state.contains(&key) {
                failed.push(NameFailure {
                    name: name.clone(),
                    error: ClientError::NotFound,
                });
                continue;
            }
            let referrers = self.referrers(&state, &key, &leaving);
            if !referrers.is_empty() {
                let by: Vec<String> = referrers.iter().map(ToString::to_string).collect();
                failed.push(NameFailure {
                    name: name.clone(),
                    error: ClientError::Rejected(format!("'{name}' is referenced by {}", by.join(", "))),
                });
                continue;
            }
            removed.insert(name.clone());
        }

        if !removed.is_empty() {
            if let Some(entries) = state.entries.get_mut(&(location.clone(), kind.to_string())) {
                entries.retain(|e| !removed.contains(&e.name));
            }
            state.uncommitted = true;
        }

        match failed.len() {
            0 => Ok(()),
            1 if names.len() == 1 => Err(failed.remove(0).error),
            _ => Err(ClientError::PartialFailure { failed }),
        }
    }

    fn move_entry(&self, location: &Location, kind: &str, name: &str, position: &Position) -> ClientResult<()> {
        let mut state = self.begin(CallKind::Move, Some(location), kind, &[name]);
        if let Some(error) = state.take_fault(CallKind::Move, name) {
            return Err(error);
        }
        let Some(entries) = state.entries.get_mut(&(location.clone(), kind.to_string())) else {
            return Err(ClientError::NotFound);
        };
        if !entries.iter().any(|e| e.name == name) {
            return Err(ClientError::NotFound);
        }

        let mut order: Vec<String> = entries.iter().map(|e| e.name.clone()).collect();
        if !ordered::apply_move(&mut order, name, position) {
            return Err(ClientError::Rejected(format!("cannot move '{name}' {position}")));
        }
        let mut by_name: BTreeMap<String, Entry> = entries.drain(..).map(|e| (e.name.clone(), e)).collect();
        entries.extend(order.iter().filter_map(|n| by_name.remove(n)));
        state.uncommitted = true;
        Ok(())
    }

    fn commit_required(&self) -> bool {
        self.commit_required
    }

    fn commit(&self) -> ClientResult<()> {
        let mut state = self.begin(CallKind::Commit, None, "", &[]);
        if let Some(error) = state.take_fault(CallKind::Commit, "") {
            return Err(error);
        }
        if state.uncommitted {
            state.commits += 1;
            state.uncommitted = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds;
    use serde_json::json;

    fn device() -> MemoryDevice {
        MemoryDevice::new(kinds::builtin_registry())
    }

    #[test]
    fn test_create_appends_and_conflicts() {
        let dev = device();
        let shared = Location::shared();
        dev.create(&shared, "address", "a", &json!({"ip_netmask": "10.0.0.1/32"})).unwrap();
        dev.create(&shared, "address", "b", &json!({"fqdn": "example.com"})).unwrap();
        assert_eq!(dev.names(&shared, "address"), vec!["a", "b"]);

        let err = dev
            .create(&shared, "address", "a", &json!({"ip_netmask": "10.0.0.2/32"}))
            .unwrap_err();
        assert_eq!(err, ClientError::Conflict);
    }

    #[test]
    fn test_address_and_group_names_collide() {
        let dev = device();
        let shared = Location::shared();
        dev.create(&shared, "address", "x", &json!({"ip_netmask": "10.0.0.1/32"})).unwrap();
        dev.create(&shared, "address", "z", &json!({"ip_netmask": "10.0.0.2/32"})).unwrap();

        let err = dev
            .create(&shared, "address_group", "x", &json!({"static": ["z"]}))
            .unwrap_err();
        assert_eq!(err, ClientError::Conflict);
        dev.create(&Location::device_group("dg"), "address_group", "x", &json!({"static": ["z"]}))
            .unwrap();
    }

    #[test]
    fn test_create_fills_computed_uuid() {
        let dev = device();
        let dg = Location::device_group("dg");
        let entry = dev
            .create(&dg, "security_rule", "r1", &json!({"action": "allow"}))
            .unwrap();
        assert!(entry.id.is_some());
        assert!(entry.body["uuid"].is_string());

        dev.update(&dg, "security_rule", "r1", &json!({"action": "deny"})).unwrap();
        let stored = dev.read(&dg, "security_rule", "r1").unwrap();
        assert_eq!(stored.body["uuid"], entry.body["uuid"]);
        assert_eq!(stored.body["action"], "deny");
    }

    #[test]
    fn test_two_variant_siblings_are_rejected() {
        let dev = device();
        let err = dev
            .create(
                &Location::shared(),
                "address",
                "a",
                &json!({"ip_netmask": "10.0.0.1/32", "fqdn": "x.example.com"}),
            )
            .unwrap_err();
        assert!(matches!(err, ClientError::Rejected(_)));
    }

    #[test]
    fn test_delete_refuses_referenced_entry() {
        let dev = device();
        let shared = Location::shared();
        dev.create(&shared, "address", "a", &json!({"ip_netmask": "10.0.0.1/32"})).unwrap();
        dev.create(&shared, "address_group", "g", &json!({"static": ["a"]})).unwrap();

        let err = dev.delete(&shared, "address", &["a".to_string()]).unwrap_err();
        assert!(err.to_string().contains("address_group[shared]/g"), "{err}");
        assert_eq!(dev.names(&shared, "address"), vec!["a"]);
    }

    #[test]
    fn test_batch_delete_reports_partial_failure() {
        let dev = device();
        let shared = Location::shared();
        for name in ["a", "b", "c"] {
            dev.create(&shared, "address", name, &json!({"ip_netmask": "10.0.0.1/32"})).unwrap();
        }
        dev.create(&shared, "address_group", "g", &json!({"static": ["b"]})).unwrap();

        let names: Vec<String> = ["a", "b", "c"].iter().map(|s| (*s).to_string()).collect();
        let err = dev.delete(&shared, "address", &names).unwrap_err();
        match err {
            ClientError::PartialFailure { failed } => {
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].name, "b");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(dev.names(&shared, "address"), vec!["b"]);
    }

    #[test]
    fn test_create_with_missing_referent_is_rejected() {
        let dev = device();
        let err = dev
            .create(&Location::shared(), "address_group", "g", &json!({"static": ["nope"]}))
            .unwrap_err();
        assert!(err.to_string().contains("'nope' does not exist"));
    }

    #[test]
    fn test_reference_resolves_through_shared() {
        let dev = device();
        dev.create(&Location::shared(), "address", "a", &json!({"ip_netmask": "10.0.0.1/32"})).unwrap();
        dev.create(&Location::device_group("dg"), "address_group", "g", &json!({"static": ["a"]}))
            .unwrap();
    }

    #[test]
    fn test_move_reorders_entries() {
        let dev = device();
        let dg = Location::device_group("dg");
        for name in ["r1", "r2", "r3"] {
            dev.create(&dg, "security_rule", name, &json!({"action": "allow"})).unwrap();
        }
        dev.move_entry(&dg, "security_rule", "r2", &Position::Before("r1".into())).unwrap();
        assert_eq!(dev.names(&dg, "security_rule"), vec!["r2", "r1", "r3"]);

        let err = dev
            .move_entry(&dg, "security_rule", "r3", &Position::Before("zz".into()))
            .unwrap_err();
        assert!(matches!(err, ClientError::Rejected(_)));
    }

    #[test]
    fn test_fault_injection_is_consumed() {
        let dev = device();
        let shared = Location::shared();
        dev.fail_next(CallKind::Create, "a", 1, ClientError::transport(Some(503), "busy"));

        let body = json!({"ip_netmask": "10.0.0.1/32"});
        assert!(dev.create(&shared, "address", "a", &body).unwrap_err().is_retryable());
        dev.create(&shared, "address", "a", &body).unwrap();
        assert_eq!(dev.calls().len(), 2);
    }

    #[test]
    fn test_ephemeral_kind_is_not_stored() {
        let dev = device();
        let panorama = Location::panorama();
        let body = json!({"username": "admin", "password": "secret"});
        let first = dev.create(&panorama, "api_key", "automation", &body).unwrap();
        let second = dev.create(&panorama, "api_key", "automation", &body).unwrap();
        assert!(first.body["key"].is_string());
        assert_ne!(first.body["key"], second.body["key"]);
        assert!(dev.names(&panorama, "api_key").is_empty());
    }

    #[test]
    fn test_snapshot_roundtrip_and_commit() {
        let dev = device().with_commit();
        dev.create(&Location::shared(), "tag", "prod", &json!({"color": "color1"})).unwrap();
        assert!(dev.commit_required());
        dev.commit().unwrap();
        dev.commit().unwrap();
        assert_eq!(dev.commits(), 1);

        let snapshot = dev.snapshot();
        let text = serde_json::to_string(&snapshot).unwrap();
        let restored = MemoryDevice::from_snapshot(kinds::builtin_registry(), serde_json::from_str(&text).unwrap());
        assert_eq!(restored.snapshot(), snapshot);
        assert_eq!(restored.names(&Location::shared(), "tag"), vec!["prod"]);
    }
}
