//! Reconciliation facade
//!
//! [`Reconciler`] ties the pieces together: it reads the managed part of
//! the device, plans against the declaration, and applies the plan.

use crate::client::{ClientError, ConfigClient};
use crate::codec;
use crate::context::{CancellationToken, OpStatus, ProgressCallback};
use crate::error::{Error, Result};
use crate::executor::{self, ApplyReport};
use crate::graph;
use crate::planner::{self, Plan, PlanInput};
use crate::retry::{LogCallback, RetryBounds, with_retry};
use crate::schema::{Schema, SchemaRegistry};
use crate::types::{ExecuteOptions, Resource, ResourceKey};
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Plans and applies declarations against one device
pub struct Reconciler {
    registry: SchemaRegistry,
    client: Arc<dyn ConfigClient>,
    options: ExecuteOptions,
}

impl Reconciler {
    pub fn new(registry: SchemaRegistry, client: Arc<dyn ConfigClient>) -> Self {
        Self {
            registry,
            client,
            options: ExecuteOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ExecuteOptions) -> Self {
        self.options = options;
        self
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn options(&self) -> &ExecuteOptions {
        &self.options
    }

    fn client_error(key: &ResourceKey, source: ClientError) -> Error {
        Error::Client {
            key: key.clone(),
            source,
        }
    }

    /// Current device state of one resource, or `None` if absent
    ///
    /// Ordered collections are read as the full list of their entries.
    /// Ephemeral kinds are never read back.
    pub fn read(&self, key: &ResourceKey) -> Result<Option<Resource>> {
        let schema = self.registry.lookup(&key.kind)?;
        if schema.ephemeral {
            return Ok(None);
        }
        let label = key.to_string();
        let callback = LogCallback(&label);

        if let Some(ordered) = &schema.ordered {
            let element = self.registry.lookup(&ordered.element_kind)?;
            let (listed, _) = with_retry(&self.options.retry, RetryBounds::default(), Some(&callback), || {
                self.client.list(&key.location, &ordered.element_kind)
            });
            let entries = listed.map_err(|e| Self::client_error(key, e))?;
            if entries.is_empty() {
                return Ok(None);
            }
            let mut rules = Vec::with_capacity(entries.len());
            for entry in entries {
                let mut value = codec::parse(&entry.body, &element.body)?;
                if let Some(fields) = value.as_object_mut() {
                    fields.insert("name".to_string(), Value::String(entry.name));
                }
                rules.push(value);
            }
            let body = Value::object([(ordered.attribute.clone(), Value::List(rules))]);
            return Ok(Some(Resource::new(key.clone(), body)));
        }

        let (read, _) = with_retry(&self.options.retry, RetryBounds::default(), Some(&callback), || {
            self.client.read(&key.location, &key.kind, &key.name)
        });
        match read {
            Ok(entry) => {
                let body = codec::parse(&entry.body, &schema.body)?;
                let mut resource = Resource::new(key.clone(), body);
                resource.id = entry.id;
                Ok(Some(resource))
            }
            Err(ClientError::NotFound) => Ok(None),
            Err(e) => Err(Self::client_error(key, e)),
        }
    }

    /// Read every managed resource that still exists
    pub fn refresh<'k>(&self, managed: impl IntoIterator<Item = &'k ResourceKey>) -> Result<Vec<Resource>> {
        let keys: BTreeSet<&ResourceKey> = managed.into_iter().collect();
        let mut observed = Vec::new();
        for key in keys {
            if let Some(resource) = self.read(key)? {
                observed.push(resource);
            }
        }
        log::debug!("Refreshed {} managed resources", observed.len());
        Ok(observed)
    }

    fn exists(&self, key: &ResourceKey) -> Result<bool> {
        let (read, _) = with_retry(&self.options.retry, RetryBounds::default(), None, || {
            self.client.read(&key.location, &key.kind, &key.name)
        });
        match read {
            Ok(_) => Ok(true),
            Err(ClientError::NotFound) => Ok(false),
            Err(e) => Err(Self::client_error(key, e)),
        }
    }

    /// Find unmanaged referents on the device
    ///
    /// For every declared reference, candidates are tried in resolution
    /// order. A candidate that is declared or observed ends the search
    /// without a read; otherwise the first one the device has is external.
    pub fn probe_external(&self, declared: &[Resource], observed: &[Resource]) -> Result<BTreeSet<ResourceKey>> {
        let mut known = BTreeSet::new();
        for resource in declared.iter().chain(observed) {
            known.insert(resource.key.clone());
            if let Ok(schema) = self.registry.lookup(resource.kind()) {
                known.extend(entry_keys(schema, resource));
            }
        }

        let mut probed: BTreeMap<ResourceKey, bool> = BTreeMap::new();
        let mut external = BTreeSet::new();
        for resource in declared {
            let Ok(schema) = self.registry.lookup(resource.kind()) else {
                continue;
            };
            for site in graph::references(schema, &resource.body) {
                'resolve: for location in resource.location().lookup_chain() {
                    for kind in &site.kinds {
                        let candidate = ResourceKey::new(kind.clone(), location.clone(), site.target.clone());
                        if known.contains(&candidate) {
                            break 'resolve;
                        }
                        let found = match probed.get(&candidate) {
                            Some(found) => *found,
                            None => {
                                let found = self.exists(&candidate)?;
                                probed.insert(candidate.clone(), found);
                                found
                            }
                        };
                        if found {
                            log::debug!("{candidate} is unmanaged but present on the device");
                            external.insert(candidate);
                            break 'resolve;
                        }
                    }
                }
            }
        }
        Ok(external)
    }

    /// Plan `declared` against the device
    ///
    /// `managed` names resources applied earlier; together with the
    /// declared keys they make up the observed set. Resources outside it
    /// are never touched.
    pub fn plan(&self, declared: &[Resource], managed: &[ResourceKey]) -> Result<Plan> {
        let keys = declared.iter().map(|r| &r.key).chain(managed);
        let observed = self.refresh(keys)?;
        let external = self.probe_external(declared, &observed)?;
        planner::plan(
            &self.registry,
            &PlanInput {
                declared: declared.to_vec(),
                observed,
                external,
            },
        )
    }

    pub fn apply(
        &self,
        plan: &Plan,
        cancel: &CancellationToken,
        progress: &mut dyn ProgressCallback,
    ) -> Result<ApplyReport> {
        executor::execute(&self.client, &self.registry, plan, &self.options, cancel, progress)
    }

    /// Plan and apply in one step
    pub fn reconcile(
        &self,
        declared: &[Resource],
        managed: &[ResourceKey],
        cancel: &CancellationToken,
        progress: &mut dyn ProgressCallback,
    ) -> Result<(Plan, ApplyReport)> {
        let plan = self.plan(declared, managed)?;
        let report = self.apply(&plan, cancel, progress)?;
        Ok((plan, report))
    }

    /// Declared resources as they stand after apply
    ///
    /// Planned values with device-computed attributes filled in. Resources
    /// with a failed or skipped op are left out, as are ephemeral kinds.
    pub fn applied_state(&self, plan: &Plan, report: &ApplyReport) -> Result<Vec<Resource>> {
        let incomplete: BTreeSet<&ResourceKey> = plan
            .ops()
            .filter(|op| report.result(op.id).is_none_or(|r| r.status != OpStatus::Done))
            .flat_map(|op| std::iter::once(&op.key).chain(op.collection.as_ref()))
            .collect();

        let mut resources = Vec::new();
        for (key, planned) in &plan.planned {
            let schema = self.registry.lookup(&key.kind)?;
            if schema.ephemeral || incomplete.contains(key) {
                continue;
            }
            let mut resource = match &schema.ordered {
                Some(ordered) => {
                    let element = self.registry.lookup(&ordered.element_kind)?;
                    let entries = planned
                        .get(&ordered.attribute)
                        .items()
                        .unwrap_or_default()
                        .iter()
                        .map(|entry| {
                            let name = entry.get("name").as_str().unwrap_or_default();
                            let entry_key = ResourceKey::new(ordered.element_kind.clone(), key.location.clone(), name);
                            match report.applied.get(&entry_key) {
                                Some(applied) => {
                                    let mut value = codec::carry_computed(entry, &applied.value, &element.body);
                                    if let Some(fields) = value.as_object_mut() {
                                        fields.insert("name".to_string(), Value::from(name));
                                    }
                                    value
                                }
                                None => entry.clone(),
                            }
                        })
                        .collect();
                    Resource::new(key.clone(), Value::object([(ordered.attribute.clone(), Value::List(entries))]))
                }
                None => match report.applied.get(key) {
                    Some(applied) => {
                        let value = codec::carry_computed(planned, &applied.value, &schema.body);
                        let mut resource = Resource::new(key.clone(), value);
                        resource.id = applied.id.clone();
                        resource
                    }
                    None => Resource::new(key.clone(), planned.clone()),
                },
            };
            if !resource.body.is_wholly_known() {
                log::warn!("{key}: some computed attributes are still unknown after apply");
                continue;
            }
            resource.ephemeral = false;
            resources.push(resource);
        }
        Ok(resources)
    }
}

/// Device keys of an ordered collection's entries
fn entry_keys(schema: &Schema, resource: &Resource) -> Vec<ResourceKey> {
    let Some(ordered) = &schema.ordered else {
        return Vec::new();
    };
    resource
        .body
        .get(&ordered.attribute)
        .items()
        .unwrap_or_default()
        .iter()
        .filter_map(|entry| entry.get("name").as_str())
        .map(|name| ResourceKey::new(ordered.element_kind.clone(), resource.location().clone(), name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NoProgress;
    use crate::kinds;
    use crate::location::Location;
    use crate::memory::MemoryDevice;
    use serde_json::json;

    fn reconciler(device: &Arc<MemoryDevice>) -> Reconciler {
        let client: Arc<dyn ConfigClient> = device.clone();
        Reconciler::new(kinds::builtin_registry(), client)
    }

    fn group(members: &[&str]) -> Resource {
        Resource::new(
            ResourceKey::new("address_group", Location::device_group("dg"), "g"),
            Value::object([(
                "members",
                Value::variant("static", Value::string_set(members.iter().copied())),
            )]),
        )
    }

    #[test]
    fn test_unmanaged_shared_referent_is_external() {
        let device = Arc::new(MemoryDevice::new(kinds::builtin_registry()));
        device.insert(&Location::shared(), "address", "dns", json!({"ip_netmask": "8.8.8.8/32"}));
        let engine = reconciler(&device);

        let external = engine.probe_external(&[group(&["dns"])], &[]).unwrap();
        assert_eq!(
            external.into_iter().collect::<Vec<_>>(),
            vec![ResourceKey::new("address", Location::shared(), "dns")]
        );

        let plan = engine.plan(&[group(&["dns"])], &[]).unwrap();
        assert_eq!(plan.summary().creates, 1);
    }

    #[test]
    fn test_unmanaged_resources_are_left_alone() {
        let device = Arc::new(MemoryDevice::new(kinds::builtin_registry()));
        device.insert(&Location::shared(), "address", "other", json!({"fqdn": "other.example.com"}));
        let plan = reconciler(&device).plan(&[], &[]).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_collection_is_read_as_entry_list() {
        let device = Arc::new(MemoryDevice::new(kinds::builtin_registry()));
        let dg = Location::device_group("dg");
        device.insert(&dg, "security_rule", "r1", json!({"action": "allow"}));
        device.insert(&dg, "security_rule", "r2", json!({"action": "deny"}));

        let key = ResourceKey::new("security_policy", dg, "pre");
        let resource = reconciler(&device).read(&key).unwrap().unwrap();
        let rules = resource.body.get("rules").items().unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[1].get("name").as_str(), Some("r2"));
        assert_eq!(rules[1].get("action").as_str(), Some("deny"));
    }

    #[test]
    fn test_applied_state_fills_computed_attributes() {
        let device = Arc::new(MemoryDevice::new(kinds::builtin_registry()));
        let engine = reconciler(&device);
        let policy = Resource::new(
            ResourceKey::new("security_policy", Location::device_group("dg"), "pre"),
            Value::object([(
                "rules",
                Value::List(vec![Value::object([
                    ("name", Value::from("r1")),
                    ("action", Value::from("allow")),
                ])]),
            )]),
        );

        let (plan, report) = engine
            .reconcile(&[policy], &[], &CancellationToken::new(), &mut NoProgress)
            .unwrap();
        assert!(report.is_success());
        let state = engine.applied_state(&plan, &report).unwrap();
        assert_eq!(state.len(), 1);
        let rule = &state[0].body.get("rules").items().unwrap()[0];
        assert!(rule.get("uuid").as_str().is_some());
    }
}
