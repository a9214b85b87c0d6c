//! # Reconcile
//!
//! Desired-state reconciliation for firewall configuration APIs.
//!
//! Given the resources a user declared and the resources observed on the
//! device, this crate computes an ordered, minimal plan of create, update,
//! delete and move operations and applies it through a [`ConfigClient`].
//!
//! ## Core Concepts
//!
//! - **Schema**: Per-kind description of attributes, variant groups,
//!   references and ordered collections ([`SchemaRegistry`])
//! - **Value**: Tri-state attribute tree with first-class variant groups ([`Value`])
//! - **Plan**: Staged operations derived from the reference graph ([`Plan`])
//! - **Executor**: Applies stages with bounded parallelism, retries and
//!   timeouts ([`execute`])
//! - **Driver**: Per-resource surface for an orchestrator ([`PlanDriver`])
//!
//! ## Example
//!
//! ```ignore
//! use reconcile::{kinds, CancellationToken, LogProgress, MemoryDevice, Reconciler};
//! use std::sync::Arc;
//!
//! let registry = kinds::builtin_registry();
//! let device = Arc::new(MemoryDevice::new(registry.clone()));
//! let engine = Reconciler::new(registry, device);
//!
//! let (plan, report) = engine.reconcile(&declared, &managed, &CancellationToken::new(), &mut LogProgress)?;
//! println!("{} ops, {} changes", plan.len(), report.summary.total_changes());
//! ```
//!
//! ## Provider Traits
//!
//! - [`ConfigClient`]: Device API the engine talks to
//! - [`ProgressCallback`]: Receives stage and op progress
//! - [`ConfirmCallback`]: Handles user confirmations
//! - [`RetryCallback`]: Observes retries of transient failures
//!
//! [`MemoryDevice`] implements [`ConfigClient`] in memory and is what the
//! tests and the CLI run against.

pub mod client;
pub mod codec;
pub mod context;
pub mod diff;
pub mod driver;
pub mod engine;
pub mod error;
pub mod executor;
pub mod graph;
pub mod kinds;
pub mod location;
pub mod memory;
pub mod ordered;
pub mod path;
pub mod planner;
pub mod retry;
pub mod schema;
pub mod state;
pub mod types;
pub mod validate;
pub mod value;

// Re-export main types at crate root
pub use client::{ClientError, ClientResult, ConfigClient, Entry, NameFailure, Position};
pub use context::{
    AutoConfirm, AutoDecline, CancellationToken, ConfirmCallback, LogProgress, NoProgress, OpStatus,
    ProgressCallback,
};
pub use diff::{DiffSummary, FieldChange, ResourceDiff, compute_diffs};
pub use driver::{PlanDriver, Provider, ProviderConfig};
pub use engine::Reconciler;
pub use error::{Diagnostic, DiagnosticKind, Error, ErrorKind, Remediation, Result, Severity};
pub use executor::{AppliedResource, ApplyReport, OpResult, execute};
pub use location::{Location, LocationKind};
pub use memory::{DeviceSnapshot, MemoryDevice};
pub use path::{AttrPath, PathSegment};
pub use planner::{Action, OpKind, Operation, Plan, PlanInput, PlanSummary, Stage, plan};
pub use retry::{RetryCallback, with_retry};
pub use schema::{Schema, SchemaRegistry};
pub use state::{StateFile, StoredState};
pub use types::{ExecuteOptions, ExecuteSummary, Resource, ResourceKey, RetryConfig, Timeouts};
pub use value::Value;
