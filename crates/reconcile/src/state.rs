//! Persisted resource state
//!
//! [`StoredState`] is what the orchestrator keeps between runs. Attributes
//! are held in the device serialization so state files stay readable and
//! independent of the in-memory value model. Ephemeral resources never
//! reach this form.

use crate::codec;
use crate::error::{Error, Result};
use crate::location::Location;
use crate::schema::SchemaRegistry;
use crate::types::{Resource, ResourceKey};
use serde::{Deserialize, Serialize};
use serde_json::Value as Raw;

/// One resource as recorded in long-term state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredState {
    pub kind: String,
    pub location: Location,
    pub name: String,
    /// Surrogate id issued by the device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub attributes: Raw,
}

impl StoredState {
    /// Record a resource; refuses ephemeral resources and unknown values
    pub fn from_resource(registry: &SchemaRegistry, resource: &Resource) -> Result<Self> {
        let schema = registry.lookup(resource.kind())?;
        if resource.ephemeral || schema.ephemeral {
            return Err(Error::EphemeralState {
                key: resource.key.clone(),
            });
        }
        Ok(Self {
            kind: resource.key.kind.clone(),
            location: resource.key.location.clone(),
            name: resource.key.name.clone(),
            id: resource.id.clone(),
            attributes: codec::marshal(&resource.body, &schema.body)?,
        })
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.kind.clone(), self.location.clone(), self.name.clone())
    }

    pub fn to_resource(&self, registry: &SchemaRegistry) -> Result<Resource> {
        let schema = registry.lookup(&self.kind)?;
        let body = codec::parse(&self.attributes, &schema.body)?;
        Ok(Resource {
            key: self.key(),
            body,
            id: self.id.clone(),
            ephemeral: false,
        })
    }
}

/// All resources recorded for one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateFile {
    pub version: u32,
    #[serde(default)]
    pub resources: Vec<StoredState>,
}

impl Default for StateFile {
    fn default() -> Self {
        Self {
            version: Self::VERSION,
            resources: Vec::new(),
        }
    }
}

impl StateFile {
    pub const VERSION: u32 = 1;

    pub fn keys(&self) -> Vec<ResourceKey> {
        self.resources.iter().map(StoredState::key).collect()
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&StoredState> {
        self.resources.iter().find(|s| s.key() == *key)
    }

    /// Insert or replace, keeping resources sorted by key
    pub fn upsert(&mut self, state: StoredState) {
        let key = state.key();
        self.resources.retain(|s| s.key() != key);
        self.resources.push(state);
        self.resources.sort_by_key(StoredState::key);
    }

    pub fn remove(&mut self, key: &ResourceKey) -> Option<StoredState> {
        let index = self.resources.iter().position(|s| s.key() == *key)?;
        Some(self.resources.remove(index))
    }

    /// Check the version and that every entry parses
    pub fn check(&self, registry: &SchemaRegistry) -> Result<()> {
        if self.version != Self::VERSION {
            return Err(Error::Schema {
                kind: "state".to_string(),
                message: format!("unsupported state version {}", self.version),
            });
        }
        let errors: Vec<Error> = self
            .resources
            .iter()
            .filter_map(|s| s.to_resource(registry).err())
            .collect();
        match Error::from_many(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds;
    use crate::value::Value;
    use serde_json::json;

    fn address() -> Resource {
        Resource::new(
            ResourceKey::new("address", Location::shared(), "web"),
            Value::object([("value", Value::variant("fqdn", Value::from("web.example.com")))]),
        )
        .with_id("17")
    }

    #[test]
    fn test_roundtrip_through_state() {
        let registry = kinds::builtin_registry();
        let stored = StoredState::from_resource(&registry, &address()).unwrap();
        assert_eq!(stored.attributes, json!({"fqdn": "web.example.com"}));
        assert_eq!(stored.id.as_deref(), Some("17"));

        let back = stored.to_resource(&registry).unwrap();
        assert!(back.body.equal(&address().body));
    }

    #[test]
    fn test_ephemeral_resource_is_refused() {
        let registry = kinds::builtin_registry();
        let key = Resource::new(
            ResourceKey::new("api_key", Location::panorama(), "automation"),
            Value::object([("username", Value::from("admin")), ("password", Value::from("pw"))]),
        );
        let err = StoredState::from_resource(&registry, &key).unwrap_err();
        assert!(matches!(err, Error::EphemeralState { .. }));

        let mut flagged = address();
        flagged.ephemeral = true;
        assert!(StoredState::from_resource(&registry, &flagged).is_err());
    }

    #[test]
    fn test_unknown_values_are_not_persisted() {
        let registry = kinds::builtin_registry();
        let rule = Resource::new(
            ResourceKey::new("security_rule", Location::device_group("dg"), "r1"),
            Value::object([("action", Value::from("allow")), ("uuid", Value::Unknown)]),
        );
        assert!(StoredState::from_resource(&registry, &rule).is_err());
    }

    #[test]
    fn test_state_file_upsert_and_version_check() {
        let registry = kinds::builtin_registry();
        let mut file = StateFile::default();
        let stored = StoredState::from_resource(&registry, &address()).unwrap();
        file.upsert(stored.clone());
        file.upsert(stored.clone());
        assert_eq!(file.resources.len(), 1);
        assert!(file.check(&registry).is_ok());

        let text = serde_json::to_string(&file).unwrap();
        let mut back: StateFile = serde_json::from_str(&text).unwrap();
        assert_eq!(back, file);
        back.version = 99;
        assert!(back.check(&registry).is_err());
        assert_eq!(file.remove(&stored.key()), Some(stored));
    }
}
