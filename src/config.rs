//! Loading and saving the files the CLI works with
//!
//! - `config.toml` in the config dir: provider settings
//! - a declaration file (TOML or JSON) given on the command line
//! - `state.json` in the state dir: resources applied so far
//! - `device.json` in the state dir: the in-memory device's configuration

use anyhow::{Context, Result, bail};
use reconcile::{DeviceSnapshot, Location, ProviderConfig, Resource, ResourceKey, SchemaRegistry, StateFile, codec};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as Raw;
use std::fs;
use std::path::{Path, PathBuf};

use crate::paths;

const CONFIG_FILE: &str = "config.toml";
const STATE_FILE: &str = "state.json";
const DEVICE_FILE: &str = "device.json";

// ============================================================================
// Provider Config
// ============================================================================

/// Load provider settings; a missing file yields defaults
pub fn load_provider_config(explicit: Option<&Path>) -> Result<ProviderConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => paths::config_dir()?.join(CONFIG_FILE),
    };

    if !path.exists() {
        if explicit.is_some() {
            bail!("Config file not found: {}", path.display());
        }
        log::debug!("No config at {}, using defaults", path.display());
        return Ok(ProviderConfig::default());
    }

    let content =
        fs::read_to_string(&path).with_context(|| format!("Could not read config file: {}", path.display()))?;
    let config = ProviderConfig::from_toml(&content)
        .with_context(|| format!("Invalid provider config: {}", path.display()))?;
    log::debug!("Loaded config from {}", path.display());
    Ok(config)
}

// ============================================================================
// Declarations
// ============================================================================

/// One declared resource, attributes in device form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclaredResource {
    pub kind: String,
    pub location: Location,
    pub name: String,
    #[serde(default = "empty_object")]
    pub attributes: Raw,
}

fn empty_object() -> Raw {
    Raw::Object(serde_json::Map::new())
}

/// A declaration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Declarations {
    #[serde(default, rename = "resource")]
    pub resources: Vec<DeclaredResource>,
}

impl Declarations {
    /// Load from a `.toml` or `.json` file
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("Could not read declarations: {}", path.display()))?;
        parse_by_extension(path, &content).with_context(|| format!("Invalid declarations: {}", path.display()))
    }

    /// Convert to engine resources, reporting every malformed entry
    pub fn resources(&self, registry: &SchemaRegistry) -> Result<Vec<Resource>> {
        let mut resources = Vec::with_capacity(self.resources.len());
        let mut problems = Vec::new();
        for declared in &self.resources {
            let key = ResourceKey::new(declared.kind.clone(), declared.location.clone(), declared.name.clone());
            let parsed = registry
                .lookup(&declared.kind)
                .and_then(|schema| codec::parse(&declared.attributes, &schema.body));
            match parsed {
                Ok(body) => resources.push(Resource::new(key, body)),
                Err(e) => problems.push(format!("{key}: {e}")),
            }
        }
        if !problems.is_empty() {
            bail!("{}", problems.join("\n"));
        }
        Ok(resources)
    }
}

fn parse_by_extension<T: DeserializeOwned>(path: &Path, content: &str) -> Result<T> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(content).context("Invalid JSON"),
        Some("toml") | None => toml::from_str(content).context("Invalid TOML"),
        Some(other) => bail!("Unsupported declaration format: .{other}"),
    }
}

// ============================================================================
// State and Device Snapshot
// ============================================================================

/// Where the state file and device snapshot live
#[derive(Debug, Clone)]
pub struct Store {
    dir: PathBuf,
}

impl Store {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// The default store in the state dir
    pub fn open() -> Result<Self> {
        Ok(Self::new(paths::state_dir()?))
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub fn device_path(&self) -> PathBuf {
        self.dir.join(DEVICE_FILE)
    }

    /// Load state, or an empty state if none was saved yet
    pub fn load_state(&self, registry: &SchemaRegistry) -> Result<StateFile> {
        let state: StateFile = load_json(&self.state_path())?.unwrap_or_default();
        state.check(registry).context("State file does not match the known schemas")?;
        Ok(state)
    }

    pub fn save_state(&self, state: &StateFile) -> Result<()> {
        save_json(&self.dir, &self.state_path(), state)
    }

    pub fn load_device(&self) -> Result<DeviceSnapshot> {
        Ok(load_json(&self.device_path())?.unwrap_or_default())
    }

    pub fn save_device(&self, snapshot: &DeviceSnapshot) -> Result<()> {
        save_json(&self.dir, &self.device_path(), snapshot)
    }
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        log::debug!("{} does not exist", path.display());
        return Ok(None);
    }
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let value = serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?;
    log::debug!("Loaded {}", path.display());
    Ok(Some(value))
}

fn save_json<T: Serialize>(dir: &Path, path: &Path, value: &T) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    let content = serde_json::to_string_pretty(value).context("Failed to serialize")?;
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    log::debug!("Saved {}", path.display());
    Ok(())
}
