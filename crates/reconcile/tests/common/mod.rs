//! Shared fixtures for the end-to-end tests

#![allow(dead_code)]

use reconcile::memory::CallKind;
use reconcile::{
    ApplyReport, CancellationToken, ClientResult, ConfigClient, Entry, ExecuteOptions, Location, MemoryDevice,
    NoProgress, Plan, Position, Reconciler, Resource, ResourceKey, RetryConfig, Value, kinds,
};
use serde_json::Value as Raw;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A body sent to the device by a create or update
#[derive(Debug, Clone)]
pub struct Payload {
    pub call: CallKind,
    pub kind: String,
    pub name: String,
    pub body: Raw,
}

/// Forwards to a [`MemoryDevice`] and keeps every write payload
pub struct Recording {
    pub device: Arc<MemoryDevice>,
    payloads: Mutex<Vec<Payload>>,
}

impl Recording {
    pub fn new(device: Arc<MemoryDevice>) -> Self {
        Self {
            device,
            payloads: Mutex::new(Vec::new()),
        }
    }

    pub fn payloads(&self) -> Vec<Payload> {
        self.payloads.lock().unwrap().clone()
    }

    fn record(&self, call: CallKind, kind: &str, name: &str, body: &Raw) {
        self.payloads.lock().unwrap().push(Payload {
            call,
            kind: kind.to_string(),
            name: name.to_string(),
            body: body.clone(),
        });
    }
}

impl ConfigClient for Recording {
    fn read(&self, location: &Location, kind: &str, name: &str) -> ClientResult<Entry> {
        self.device.read(location, kind, name)
    }

    fn list(&self, location: &Location, kind: &str) -> ClientResult<Vec<Entry>> {
        self.device.list(location, kind)
    }

    fn create(&self, location: &Location, kind: &str, name: &str, body: &Raw) -> ClientResult<Entry> {
        self.record(CallKind::Create, kind, name, body);
        self.device.create(location, kind, name, body)
    }

    fn update(&self, location: &Location, kind: &str, name: &str, body: &Raw) -> ClientResult<()> {
        self.record(CallKind::Update, kind, name, body);
        self.device.update(location, kind, name, body)
    }

    fn delete(&self, location: &Location, kind: &str, names: &[String]) -> ClientResult<()> {
        self.device.delete(location, kind, names)
    }

    fn move_entry(&self, location: &Location, kind: &str, name: &str, position: &Position) -> ClientResult<()> {
        self.device.move_entry(location, kind, name, position)
    }
}

pub fn device() -> Arc<MemoryDevice> {
    Arc::new(MemoryDevice::new(kinds::builtin_registry()))
}

pub fn fast_options() -> ExecuteOptions {
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

pub fn engine(client: Arc<dyn ConfigClient>) -> Reconciler {
    Reconciler::new(kinds::builtin_registry(), client).with_options(fast_options())
}

/// Plan and apply, returning what a caller would record as managed
pub fn converge(engine: &Reconciler, declared: &[Resource], managed: &[ResourceKey]) -> (Plan, ApplyReport, Vec<ResourceKey>) {
    let (plan, report) = engine
        .reconcile(declared, managed, &CancellationToken::new(), &mut NoProgress)
        .unwrap();
    let state = engine.applied_state(&plan, &report).unwrap();
    let managed = state.into_iter().map(|r| r.key).collect();
    (plan, report, managed)
}

pub fn address(name: &str, netmask: &str) -> Resource {
    Resource::new(
        ResourceKey::new("address", Location::shared(), name),
        Value::object([("value", Value::variant("ip_netmask", Value::from(netmask)))]),
    )
}

pub fn group(name: &str, members: &[&str]) -> Resource {
    Resource::new(
        ResourceKey::new("address_group", Location::shared(), name),
        Value::object([(
            "members",
            Value::variant("static", Value::string_set(members.iter().copied())),
        )]),
    )
}

pub fn rule(name: &str, action: &str) -> Value {
    Value::object([("name", Value::from(name)), ("action", Value::from(action))])
}

pub fn policy(location: Location, rules: &[&str]) -> Resource {
    Resource::new(
        ResourceKey::new("security_policy", location, "rulebase"),
        Value::object([(
            "rules",
            Value::List(rules.iter().map(|name| rule(name, "allow")).collect()),
        )]),
    )
}

pub fn names(values: &[&str]) -> Vec<String> {
    values.iter().map(ToString::to_string).collect()
}
