//! Error types and diagnostics for reconciliation.
//!
//! Errors are categorized by [`ErrorKind`] so the executor can decide what to
//! retry, and so the plan driver can tell a user whether to edit their
//! configuration, wait, or look at the device. Every error that concerns a
//! specific attribute carries an [`AttrPath`] into the declared value.

use crate::client::ClientError;
use crate::path::AttrPath;
use crate::types::ResourceKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for reconciliation operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared by planning and apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Declared value breaks a schema rule
    Validation,
    /// Unknown kind, bad schema, or a value the schema cannot represent
    Schema,
    /// A reference names a resource that neither exists nor is being created
    UnresolvedReference,
    /// Declared references form a cycle
    CyclicDependency,
    /// More than one variant sibling is set
    VariantConflict,
    /// The same name appears twice in an ordered collection
    DuplicateOrderedName,
    /// Connection, TLS or 5xx failure talking to the device
    Transport,
    /// A device call or stage exceeded its deadline
    Timeout,
    /// Create collided with an existing name
    Conflict,
    /// The device has no such entry
    NotFound,
    /// The device refused the change
    DeviceRejection,
    /// Observed state differs from what was applied
    Drift,
    /// Reconciliation was cancelled
    Cancelled,
    /// Engine invariant broken
    Internal,
}

impl ErrorKind {
    /// Whether errors of this kind are transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport | Self::Timeout)
    }

    /// Whether this kind stops planning before any op runs.
    pub fn aborts_planning(&self) -> bool {
        matches!(
            self,
            Self::Validation
                | Self::Schema
                | Self::UnresolvedReference
                | Self::CyclicDependency
                | Self::VariantConflict
                | Self::DuplicateOrderedName
        )
    }

    /// What the user can do about it.
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Validation
            | Self::Schema
            | Self::UnresolvedReference
            | Self::CyclicDependency
            | Self::VariantConflict
            | Self::DuplicateOrderedName => Remediation::EditConfiguration,
            Self::Transport | Self::Timeout | Self::Cancelled => Remediation::RetryLater,
            Self::Conflict | Self::NotFound | Self::DeviceRejection | Self::Drift => {
                Remediation::InspectDevice
            }
            Self::Internal => Remediation::ReportBug,
        }
    }

    /// Get a user-friendly description of this error kind.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Validation => "Invalid configuration",
            Self::Schema => "Schema mismatch",
            Self::UnresolvedReference => "Unresolved reference",
            Self::CyclicDependency => "Cyclic dependency",
            Self::VariantConflict => "Conflicting variant",
            Self::DuplicateOrderedName => "Duplicate name in ordered collection",
            Self::Transport => "Device unreachable",
            Self::Timeout => "Timed out",
            Self::Conflict => "Name already exists",
            Self::NotFound => "Not found on device",
            Self::DeviceRejection => "Rejected by device",
            Self::Drift => "Configuration drift",
            Self::Cancelled => "Cancelled",
            Self::Internal => "Internal error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Class of action that resolves an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Remediation {
    EditConfiguration,
    RetryLater,
    InspectDevice,
    ReportBug,
}

impl Remediation {
    /// Get actionable advice for this remediation class.
    pub fn advice(&self) -> &'static str {
        match self {
            Self::EditConfiguration => "Fix the declaration and plan again",
            Self::RetryLater => "Check connectivity to the device and apply again",
            Self::InspectDevice => {
                "Inspect the device configuration; another actor may have changed it"
            }
            Self::ReportBug => "This is a bug in the reconciliation engine",
        }
    }
}

/// One failed operation inside a partial apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpFailure {
    pub key: ResourceKey,
    pub kind: ErrorKind,
    pub message: String,
}

/// Errors that can occur while planning or applying.
#[derive(Debug, Error)]
pub enum Error {
    /// No schema registered for the kind
    #[error("unknown resource kind: {kind}")]
    UnknownKind { kind: String },

    /// Schema registration or schema-version mismatch
    #[error("schema error for {kind}: {message}")]
    Schema { kind: String, message: String },

    /// Declared value breaks a schema rule
    #[error("{path}: {message}")]
    Validation { path: AttrPath, message: String },

    /// More than one sibling of a variant group is set
    #[error("{path}: only one of [{}] may be set", .tags.join(", "))]
    VariantConflict { path: AttrPath, tags: Vec<String> },

    /// Name repeated inside an ordered collection
    #[error("{collection}: duplicate name '{name}' at {path}")]
    DuplicateOrderedName {
        collection: ResourceKey,
        name: String,
        path: AttrPath,
    },

    /// Reference to a resource that neither exists nor is being created
    #[error("{from}: {path} references {} '{target}' which does not exist and is not declared", .kinds.join(" or "))]
    UnresolvedReference {
        from: ResourceKey,
        path: AttrPath,
        target: String,
        kinds: Vec<String>,
    },

    /// References form a cycle
    #[error("cyclic dependency: {}", .cycle.iter().map(ToString::to_string).collect::<Vec<_>>().join(" -> "))]
    CyclicDependency { cycle: Vec<ResourceKey> },

    /// A device call failed
    #[error("{key}: {source}")]
    Client {
        key: ResourceKey,
        #[source]
        source: ClientError,
    },

    /// Post-apply read differs from the applied value
    #[error("{key}: drift at {path}: {message}")]
    Drift {
        key: ResourceKey,
        path: AttrPath,
        message: String,
    },

    /// The device refused to activate the applied changes
    #[error("commit failed: {0}")]
    Commit(#[source] ClientError),

    /// Ephemeral values may not be written to long-term state
    #[error("{key}: ephemeral resource cannot be persisted")]
    EphemeralState { key: ResourceKey },

    /// Some ops succeeded, some failed
    #[error("partial apply: {succeeded} succeeded, {} failed, {skipped} skipped", .failures.len())]
    PartialApply {
        succeeded: usize,
        skipped: usize,
        failures: Vec<OpFailure>,
    },

    /// Reconciliation stopped by the caller
    #[error("reconciliation cancelled")]
    Cancelled,

    /// Several independent errors
    #[error("{} errors: {}", .0.len(), .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Multiple(Vec<Error>),

    /// Provider configuration is missing or invalid
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Engine invariant broken
    #[error("internal error: {0}")]
    Internal(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn validation(path: AttrPath, message: impl Into<String>) -> Self {
        Self::Validation {
            path,
            message: message.into(),
        }
    }

    /// Get the error kind for retry and remediation logic.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownKind { .. } | Self::Schema { .. } => ErrorKind::Schema,
            Self::Validation { .. } | Self::EphemeralState { .. } | Self::Config(_) => {
                ErrorKind::Validation
            }
            Self::VariantConflict { .. } => ErrorKind::VariantConflict,
            Self::DuplicateOrderedName { .. } => ErrorKind::DuplicateOrderedName,
            Self::UnresolvedReference { .. } => ErrorKind::UnresolvedReference,
            Self::CyclicDependency { .. } => ErrorKind::CyclicDependency,
            Self::Client { source, .. } | Self::Commit(source) => source.kind(),
            Self::Drift { .. } => ErrorKind::Drift,
            Self::PartialApply { failures, .. } => failures
                .first()
                .map(|f| f.kind)
                .unwrap_or(ErrorKind::Internal),
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Multiple(errors) => errors
                .first()
                .map(Error::kind)
                .unwrap_or(ErrorKind::Internal),
            Self::Internal(_) | Self::Json(_) => ErrorKind::Internal,
        }
    }

    /// Whether this error is typically transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Attribute path the error points at, if any.
    pub fn path(&self) -> Option<&AttrPath> {
        match self {
            Self::Validation { path, .. }
            | Self::VariantConflict { path, .. }
            | Self::DuplicateOrderedName { path, .. }
            | Self::UnresolvedReference { path, .. }
            | Self::Drift { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Resource the error belongs to, if any.
    pub fn resource(&self) -> Option<&ResourceKey> {
        match self {
            Self::DuplicateOrderedName { collection, .. } => Some(collection),
            Self::UnresolvedReference { from, .. } => Some(from),
            Self::Client { key, .. } | Self::Drift { key, .. } | Self::EphemeralState { key } => {
                Some(key)
            }
            Self::CyclicDependency { cycle } => cycle.first(),
            _ => None,
        }
    }

    /// Collapse a list of errors into one, or `None` if empty.
    pub fn from_many(mut errors: Vec<Error>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Multiple(errors)),
        }
    }

    /// Flatten into individual errors.
    pub fn into_errors(self) -> Vec<Error> {
        match self {
            Self::Multiple(errors) => errors.into_iter().flat_map(Error::into_errors).collect(),
            other => vec![other],
        }
    }
}

/// Diagnostic severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
}

/// Diagnostic kinds surfaced to the plan driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticKind {
    /// Pre-apply, recoverable by user edit
    ValidationError,
    /// Retryable
    TransportError,
    /// Non-retryable
    DeviceRejection,
    /// Informational
    DriftWarning,
    /// Some ops succeeded, some failed
    PartialApply,
    /// Engine bug
    Internal,
}

impl From<ErrorKind> for DiagnosticKind {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Validation
            | ErrorKind::Schema
            | ErrorKind::UnresolvedReference
            | ErrorKind::CyclicDependency
            | ErrorKind::VariantConflict
            | ErrorKind::DuplicateOrderedName => Self::ValidationError,
            ErrorKind::Transport | ErrorKind::Timeout => Self::TransportError,
            ErrorKind::Conflict | ErrorKind::NotFound | ErrorKind::DeviceRejection => {
                Self::DeviceRejection
            }
            ErrorKind::Drift => Self::DriftWarning,
            ErrorKind::Cancelled => Self::PartialApply,
            ErrorKind::Internal => Self::Internal,
        }
    }
}

/// A user-facing message about one resource or attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub kind: DiagnosticKind,
    pub error_kind: ErrorKind,
    pub summary: String,
    pub resource: Option<ResourceKey>,
    pub path: Option<AttrPath>,
    pub remediation: Remediation,
}

impl Diagnostic {
    /// Build an error diagnostic.
    pub fn error(kind: ErrorKind, summary: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            kind: kind.into(),
            error_kind: kind,
            summary: summary.into(),
            resource: None,
            path: None,
            remediation: kind.remediation(),
        }
    }

    /// Build a drift warning.
    pub fn drift(key: ResourceKey, path: AttrPath, summary: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            kind: DiagnosticKind::DriftWarning,
            error_kind: ErrorKind::Drift,
            summary: summary.into(),
            resource: Some(key),
            path: Some(path),
            remediation: Remediation::InspectDevice,
        }
    }

    pub fn with_resource(mut self, key: ResourceKey) -> Self {
        self.resource = Some(key);
        self
    }

    pub fn with_path(mut self, path: AttrPath) -> Self {
        self.path = Some(path);
        self
    }

    /// Mark as part of a partially applied reconciliation.
    pub fn partial(mut self) -> Self {
        self.kind = DiagnosticKind::PartialApply;
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl From<&Error> for Diagnostic {
    fn from(error: &Error) -> Self {
        let mut diag = Diagnostic::error(error.kind(), error.to_string());
        if matches!(error, Error::PartialApply { .. }) {
            diag.kind = DiagnosticKind::PartialApply;
        }
        diag.resource = error.resource().cloned();
        diag.path = error.path().cloned();
        diag
    }
}

/// Expand an error into one diagnostic per underlying failure.
pub fn diagnostics_from(error: &Error) -> Vec<Diagnostic> {
    match error {
        Error::Multiple(errors) => errors.iter().flat_map(diagnostics_from).collect(),
        other => vec![Diagnostic::from(other)],
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{level}: {}", self.summary)?;
        if let Some(resource) = &self.resource {
            write!(f, " [{resource}]")?;
        }
        Ok(())
    }
}
