//! Orchestrator-facing provider surface
//!
//! An orchestrator hands over one resource at a time: prior state from its
//! store and the proposed or planned value. [`Provider`] answers with
//! planned state, new state and diagnostics. Ordering between resources is
//! the orchestrator's concern here; inside one call the engine plans and
//! applies the usual way.
//!
//! Ephemeral values come back out of band in [`AppliedState::ephemeral`]
//! and never in the state the orchestrator persists.

use crate::client::{ClientError, ConfigClient};
use crate::context::{CancellationToken, LogProgress};
use crate::engine::Reconciler;
use crate::error::{Diagnostic, Error, Result, diagnostics_from};
use crate::executor::{AppliedResource, ApplyReport};
use crate::graph;
use crate::location::Location;
use crate::planner::{self, Plan, PlanInput};
use crate::schema::SchemaRegistry;
use crate::state::StoredState;
use crate::types::{ExecuteOptions, Resource, ResourceKey, RetryConfig, Timeouts};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Configuration
// ============================================================================

/// Provider configuration, usually read from `config.toml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Management endpoint of the device
    pub endpoint: String,
    pub credentials: Option<Credentials>,
    pub timeouts: TimeoutConfig,
    /// Worker pool size for ops within a stage
    pub parallelism: usize,
    pub continue_on_failure: bool,
    /// Re-read applied resources and report drift
    pub verify: bool,
    pub retry: RetryFileConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            credentials: None,
            timeouts: TimeoutConfig::default(),
            parallelism: 8,
            continue_on_failure: false,
            verify: true,
            retry: RetryFileConfig::default(),
        }
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &crate::codec::REDACTED)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub op_secs: u64,
    pub stage_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            op_secs: 60,
            stage_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryFileConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryFileConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 1000,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl ProviderConfig {
    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.parallelism == 0 {
            problems.push("parallelism must be at least 1");
        }
        if self.timeouts.op_secs == 0 || self.timeouts.stage_secs == 0 {
            problems.push("timeouts must be positive");
        }
        if self.timeouts.op_secs > self.timeouts.stage_secs {
            problems.push("op timeout cannot exceed the stage timeout");
        }
        if self.retry.max_attempts == 0 {
            problems.push("retry.max_attempts must be at least 1");
        }
        if self.retry.backoff_factor < 1.0 {
            problems.push("retry.backoff_factor must be at least 1.0");
        }
        if let Some(credentials) = &self.credentials
            && credentials.username.is_empty()
        {
            problems.push("credentials.username is empty");
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(problems.join("; ")))
        }
    }

    pub fn execute_options(&self) -> ExecuteOptions {
        ExecuteOptions {
            parallelism: self.parallelism,
            continue_on_failure: self.continue_on_failure,
            timeouts: Timeouts {
                op: Duration::from_secs(self.timeouts.op_secs),
                stage: Duration::from_secs(self.timeouts.stage_secs),
            },
            retry: RetryConfig {
                max_attempts: self.retry.max_attempts,
                base_delay: Duration::from_millis(self.retry.base_delay_ms),
                backoff_factor: self.retry.backoff_factor,
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
            },
            verify: self.verify,
        }
    }
}

// ============================================================================
// Driver contract
// ============================================================================

/// A value plus the diagnostics produced while computing it
#[derive(Debug, Clone)]
pub struct Response<T> {
    pub value: T,
    pub diagnostics: Vec<Diagnostic>,
}

impl<T> Response<T> {
    fn new(value: T, diagnostics: Vec<Diagnostic>) -> Self {
        Self { value, diagnostics }
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }
}

#[derive(Debug, Clone)]
pub struct PlannedResource {
    /// `None` when the resource is being destroyed
    pub planned: Option<Value>,
    pub plan: Plan,
}

#[derive(Debug, Clone)]
pub struct AppliedState {
    /// What the orchestrator should persist; `None` once destroyed
    pub state: Option<StoredState>,
    /// Issued value of an ephemeral resource, never persisted
    pub ephemeral: Option<AppliedResource>,
    pub report: ApplyReport,
}

/// Operations an orchestrator drives, one resource at a time
pub trait PlanDriver {
    /// One-shot setup; must precede every other call
    fn configure(&mut self, config: ProviderConfig) -> Result<()>;

    /// Compute the planned state of `proposed` against `prior`
    ///
    /// Reads the device but never writes to it.
    fn plan_resource(
        &self,
        kind: &str,
        prior: Option<&StoredState>,
        proposed: Option<&Resource>,
    ) -> Result<Response<PlannedResource>>;

    /// Converge the device to `planned`; `None` destroys the resource
    fn apply_resource(
        &self,
        kind: &str,
        prior: Option<&StoredState>,
        planned: Option<&Resource>,
    ) -> Result<Response<AppliedState>>;

    /// Refresh stored state; `None` if the resource is gone
    fn read_resource(&self, kind: &str, state: &StoredState) -> Result<Response<Option<StoredState>>>;

    /// Adopt an existing device resource
    fn import_resource(&self, kind: &str, location: &Location, name: &str) -> Result<Response<StoredState>>;
}

// ============================================================================
// Provider
// ============================================================================

/// [`PlanDriver`] backed by a [`ConfigClient`]
pub struct Provider {
    registry: SchemaRegistry,
    client: Arc<dyn ConfigClient>,
    engine: Option<Reconciler>,
    cancel: CancellationToken,
}

impl Provider {
    pub fn new(registry: SchemaRegistry, client: Arc<dyn ConfigClient>) -> Self {
        Self {
            registry,
            client,
            engine: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop an apply in progress; started calls run to completion
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn engine(&self) -> Result<&Reconciler> {
        self.engine
            .as_ref()
            .ok_or_else(|| Error::Config("provider is not configured".to_string()))
    }

    /// Key of the call, checked against the kind the orchestrator named
    fn call_key(&self, kind: &str, prior: Option<&StoredState>, value: Option<&Resource>) -> Result<ResourceKey> {
        self.registry.lookup(kind)?;
        let key = value
            .map(|r| r.key.clone())
            .or_else(|| prior.map(StoredState::key))
            .ok_or_else(|| Error::Internal(format!("{kind}: neither prior nor proposed state given")))?;
        if key.kind != kind {
            return Err(Error::Schema {
                kind: kind.to_string(),
                message: format!("resource {key} does not belong to this kind"),
            });
        }
        if let Some(prior) = prior
            && prior.key() != key
        {
            return Err(Error::Validation {
                path: crate::path::AttrPath::root(),
                message: format!("identity changed from {} to {key}; replace the resource instead", prior.key()),
            });
        }
        Ok(key)
    }

    /// Plan one resource
    ///
    /// References the device cannot satisfy are assumed to be created by
    /// the orchestrator before this resource.
    fn plan_one(&self, prior: Option<&StoredState>, declared: Option<&Resource>) -> Result<Plan> {
        let engine = self.engine()?;
        let declared: Vec<Resource> = declared.cloned().into_iter().collect();
        let managed: Vec<ResourceKey> = prior.map(StoredState::key).into_iter().collect();

        let observed = engine.refresh(declared.iter().map(|r| &r.key).chain(&managed))?;
        let mut external = engine.probe_external(&declared, &observed)?;
        for resource in &declared {
            let schema = self.registry.lookup(resource.kind())?;
            for site in graph::references(schema, &resource.body) {
                let declared_keys = declared.iter().map(|r| &r.key);
                let resolved = resource.location().lookup_chain().iter().any(|location| {
                    site.kinds.iter().any(|kind| {
                        let candidate = ResourceKey::new(kind.clone(), location.clone(), site.target.clone());
                        external.contains(&candidate)
                            || observed.iter().any(|r| r.key == candidate)
                            || declared_keys.clone().any(|k| *k == candidate)
                    })
                });
                if !resolved && let Some(kind) = site.kinds.first() {
                    log::debug!("{}: assuming {kind} '{}' is created first", resource.key, site.target);
                    external.insert(ResourceKey::new(kind.clone(), resource.location().clone(), site.target.clone()));
                }
            }
        }

        planner::plan(
            &self.registry,
            &PlanInput {
                declared,
                observed,
                external,
            },
        )
    }
}

impl PlanDriver for Provider {
    fn configure(&mut self, config: ProviderConfig) -> Result<()> {
        if self.engine.is_some() {
            return Err(Error::Config("provider is already configured".to_string()));
        }
        config.validate()?;
        log::debug!("Configuring provider for {}", config.endpoint);
        let engine =
            Reconciler::new(self.registry.clone(), Arc::clone(&self.client)).with_options(config.execute_options());
        self.engine = Some(engine);
        Ok(())
    }

    fn plan_resource(
        &self,
        kind: &str,
        prior: Option<&StoredState>,
        proposed: Option<&Resource>,
    ) -> Result<Response<PlannedResource>> {
        let key = self.call_key(kind, prior, proposed)?;
        match self.plan_one(prior, proposed) {
            Ok(plan) => {
                let planned = plan.planned.get(&key).cloned();
                Ok(Response::new(PlannedResource { planned, plan }, Vec::new()))
            }
            Err(e) if e.kind().aborts_planning() => {
                let diagnostics = diagnostics_from(&e);
                let planned = proposed.map(|r| r.body.clone());
                Ok(Response::new(
                    PlannedResource {
                        planned,
                        plan: Plan::default(),
                    },
                    diagnostics,
                ))
            }
            Err(e) => Err(e),
        }
    }

    fn apply_resource(
        &self,
        kind: &str,
        prior: Option<&StoredState>,
        planned: Option<&Resource>,
    ) -> Result<Response<AppliedState>> {
        let key = self.call_key(kind, prior, planned)?;
        let engine = self.engine()?;
        let plan = self.plan_one(prior, planned)?;
        let report = engine.apply(&plan, &self.cancel, &mut LogProgress)?;

        let mut diagnostics = report.diagnostics.clone();
        if let Some(error) = report.error() {
            diagnostics.extend(diagnostics_from(&error));
        }

        let state = match planned {
            None if report.is_success() => None,
            None => prior.cloned(),
            Some(_) => {
                let applied = engine.applied_state(&plan, &report)?;
                match applied.iter().find(|r| r.key == key) {
                    Some(resource) => Some(StoredState::from_resource(&self.registry, resource)?),
                    None if self.registry.lookup(kind)?.ephemeral => None,
                    None => prior.cloned(),
                }
            }
        };
        let ephemeral = report.ephemeral().find(|a| a.key == key).cloned();

        Ok(Response::new(
            AppliedState {
                state,
                ephemeral,
                report,
            },
            diagnostics,
        ))
    }

    fn read_resource(&self, kind: &str, state: &StoredState) -> Result<Response<Option<StoredState>>> {
        let key = self.call_key(kind, Some(state), None)?;
        let Some(mut resource) = self.engine()?.read(&key)? else {
            return Ok(Response::new(None, Vec::new()));
        };
        if resource.id.is_none() {
            resource.id.clone_from(&state.id);
        }
        let refreshed = StoredState::from_resource(&self.registry, &resource)?;
        Ok(Response::new(Some(refreshed), Vec::new()))
    }

    fn import_resource(&self, kind: &str, location: &Location, name: &str) -> Result<Response<StoredState>> {
        let schema = self.registry.lookup(kind)?;
        let key = ResourceKey::new(kind, location.clone(), name);
        if schema.ephemeral {
            return Err(Error::EphemeralState { key });
        }
        let resource = self.engine()?.read(&key)?.ok_or_else(|| Error::Client {
            key: key.clone(),
            source: ClientError::NotFound,
        })?;
        log::info!("Imported {key}");
        Ok(Response::new(StoredState::from_resource(&self.registry, &resource)?, Vec::new()))
    }
}

/// Keys of every resource recorded in `states`
pub fn managed_keys<'a>(states: impl IntoIterator<Item = &'a StoredState>) -> BTreeSet<ResourceKey> {
    states.into_iter().map(StoredState::key).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::kinds;
    use crate::memory::MemoryDevice;
    use serde_json::json;

    fn provider(device: &Arc<MemoryDevice>) -> Provider {
        let client: Arc<dyn ConfigClient> = device.clone();
        let mut provider = Provider::new(kinds::builtin_registry(), client);
        provider.configure(ProviderConfig::default()).unwrap();
        provider
    }

    fn address(name: &str, fqdn: &str) -> Resource {
        Resource::new(
            ResourceKey::new("address", Location::shared(), name),
            Value::object([("value", Value::variant("fqdn", Value::from(fqdn)))]),
        )
    }

    #[test]
    fn test_config_defaults_and_overrides() {
        let config = ProviderConfig::from_toml(
            r#"
            endpoint = "panorama.example.com"
            parallelism = 4

            [retry]
            max_attempts = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.parallelism, 4);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.timeouts.op_secs, 60);

        let options = config.execute_options();
        assert_eq!(options.timeouts.stage, Duration::from_secs(600));
        assert_eq!(options.retry.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let err = ProviderConfig::from_toml("parallelism = 0").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(ProviderConfig::from_toml("parallelism = \"many\"").is_err());
    }

    #[test]
    fn test_password_is_not_debug_printed() {
        let credentials = Credentials {
            username: "admin".into(),
            password: "hunter2".into(),
        };
        assert!(!format!("{credentials:?}").contains("hunter2"));
    }

    #[test]
    fn test_unconfigured_provider_refuses_calls() {
        let device = Arc::new(MemoryDevice::new(kinds::builtin_registry()));
        let client: Arc<dyn ConfigClient> = device;
        let provider = Provider::new(kinds::builtin_registry(), client);
        let web = address("web", "web.example.com");
        assert!(provider.plan_resource("address", None, Some(&web)).is_err());
    }

    #[test]
    fn test_plan_apply_read_cycle() {
        let device = Arc::new(MemoryDevice::new(kinds::builtin_registry()));
        let provider = provider(&device);
        let web = address("web", "web.example.com");

        let planned = provider.plan_resource("address", None, Some(&web)).unwrap();
        assert_eq!(planned.value.plan.summary().creates, 1);
        assert!(device.writes().is_empty());

        let applied = provider.apply_resource("address", None, Some(&web)).unwrap();
        assert!(!applied.has_errors());
        let state = applied.value.state.unwrap();
        assert_eq!(state.attributes, json!({"fqdn": "web.example.com"}));
        assert!(state.id.is_some());

        let again = provider.plan_resource("address", Some(&state), Some(&web)).unwrap();
        assert!(again.value.plan.is_empty());

        let read = provider.read_resource("address", &state).unwrap();
        assert_eq!(read.value, Some(state.clone()));

        let destroyed = provider.apply_resource("address", Some(&state), None).unwrap();
        assert!(destroyed.value.state.is_none());
        assert!(device.get(&Location::shared(), "address", "web").is_none());
    }

    #[test]
    fn test_reference_to_pending_resource_is_assumed() {
        let device = Arc::new(MemoryDevice::new(kinds::builtin_registry()));
        let provider = provider(&device);
        let group = Resource::new(
            ResourceKey::new("address_group", Location::shared(), "g"),
            Value::object([("members", Value::variant("static", Value::string_set(["web"])))]),
        );
        let planned = provider.plan_resource("address_group", None, Some(&group)).unwrap();
        assert!(!planned.has_errors());
        assert_eq!(planned.value.plan.len(), 1);
    }

    #[test]
    fn test_validation_errors_become_diagnostics() {
        let device = Arc::new(MemoryDevice::new(kinds::builtin_registry()));
        let provider = provider(&device);
        let bad = Resource::new(
            ResourceKey::new("address", Location::shared(), "web"),
            Value::object([("description", Value::from("no value"))]),
        );
        let planned = provider.plan_resource("address", None, Some(&bad)).unwrap();
        assert!(planned.has_errors());
        assert!(planned.value.plan.is_empty());
    }

    #[test]
    fn test_ephemeral_value_is_returned_out_of_band() {
        let device = Arc::new(MemoryDevice::new(kinds::builtin_registry()));
        let provider = provider(&device);
        let key = Resource::new(
            ResourceKey::new("api_key", Location::panorama(), "automation"),
            Value::object([("username", Value::from("admin")), ("password", Value::from("pw"))]),
        );

        let applied = provider.apply_resource("api_key", None, Some(&key)).unwrap();
        assert!(applied.value.state.is_none());
        let issued = applied.value.ephemeral.unwrap();
        assert!(issued.ephemeral);
        assert!(issued.value.get("key").as_str().is_some());
    }

    #[test]
    fn test_import_existing_and_missing() {
        let device = Arc::new(MemoryDevice::new(kinds::builtin_registry()));
        device.insert(&Location::shared(), "tag", "prod", json!({"color": "color1"}));
        let provider = provider(&device);

        let imported = provider.import_resource("tag", &Location::shared(), "prod").unwrap();
        assert_eq!(imported.value.attributes, json!({"color": "color1"}));

        let err = provider.import_resource("tag", &Location::shared(), "nope").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_kind_mismatch_is_refused() {
        let device = Arc::new(MemoryDevice::new(kinds::builtin_registry()));
        let provider = provider(&device);
        let web = address("web", "web.example.com");
        assert!(provider.plan_resource("tag", None, Some(&web)).is_err());
    }
}
