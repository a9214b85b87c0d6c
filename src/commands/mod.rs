pub mod apply;
pub mod import;
pub mod plan;
pub mod schema;
pub mod state;
pub mod validate;

use anyhow::{Context as _, Result, anyhow};
use reconcile::error::diagnostics_from;
use reconcile::{MemoryDevice, ProviderConfig, Reconciler, Resource, SchemaRegistry, StateFile, kinds};
use std::path::Path;
use std::sync::Arc;

use crate::Context;
use crate::config::{self, Declarations, Store};
use crate::display;

/// Everything a command needs: config, state and the device
pub struct Session {
    pub registry: SchemaRegistry,
    pub config: ProviderConfig,
    pub store: Store,
    pub device: Arc<MemoryDevice>,
    pub state: StateFile,
}

impl Session {
    pub fn open(ctx: &Context) -> Result<Self> {
        let registry = kinds::builtin_registry();
        let config = config::load_provider_config(ctx.config.as_deref())?;
        let store = match &ctx.state_dir {
            Some(dir) => Store::new(dir.clone()),
            None => Store::open()?,
        };
        let state = store.load_state(&registry)?;
        let snapshot = store.load_device()?;
        let device = Arc::new(MemoryDevice::from_snapshot(registry.clone(), snapshot));

        if config.endpoint.is_empty() {
            log::debug!("Using device snapshot {}", store.device_path().display());
        } else {
            log::debug!(
                "Endpoint {} is served from snapshot {}",
                config.endpoint,
                store.device_path().display()
            );
        }

        Ok(Self {
            registry,
            config,
            store,
            device,
            state,
        })
    }

    /// An engine over the session's device with the current config
    pub fn engine(&self) -> Reconciler {
        Reconciler::new(self.registry.clone(), self.device.clone()).with_options(self.config.execute_options())
    }

    pub fn declared(&self, file: &Path) -> Result<Vec<Resource>> {
        Declarations::load(file)?.resources(&self.registry)
    }

    pub fn save_state(&self) -> Result<()> {
        self.store.save_state(&self.state).context("Failed to save state")
    }

    pub fn save_device(&self) -> Result<()> {
        self.store
            .save_device(&self.device.snapshot())
            .context("Failed to save device snapshot")
    }
}

/// Print an engine error as diagnostics and turn it into a short failure
pub fn planning_failed(error: reconcile::Error) -> anyhow::Error {
    let diagnostics = diagnostics_from(&error);
    display::display_diagnostics(&diagnostics);
    anyhow!("Planning failed with {} error(s)", diagnostics.len())
}
