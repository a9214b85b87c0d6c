//! Device-facing capability
//!
//! [`ConfigClient`] is the only way the engine touches the device. Bodies
//! cross this boundary in the device serialization (see [`crate::codec`]),
//! so a client implementation never needs to know about schemas.
//!
//! Implementations are shared by every worker of a stage and must be safe
//! for concurrent use.

use crate::error::ErrorKind;
use crate::location::Location;
use serde::{Deserialize, Serialize};
use serde_json::Value as Raw;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for device calls.
pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// One named entry as stored on the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub name: String,
    /// Surrogate id issued on create
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub body: Raw,
}

impl Entry {
    pub fn new(name: impl Into<String>, body: Raw) -> Self {
        Self {
            name: name.into(),
            id: None,
            body,
        }
    }
}

/// Target position of a move within an ordered collection
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    /// Head of the collection
    Top,
    /// Tail of the collection
    Bottom,
    /// Immediately before the named entry
    Before(String),
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Top => write!(f, "top"),
            Self::Bottom => write!(f, "bottom"),
            Self::Before(pivot) => write!(f, "before '{pivot}'"),
        }
    }
}

/// A name that failed inside a batched call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameFailure {
    pub name: String,
    pub error: ClientError,
}

/// Errors returned by the device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// No entry with that name at that location
    #[error("not found on device")]
    NotFound,

    /// Create collided with an existing name
    #[error("an entry with this name already exists")]
    Conflict,

    /// Connection failure or non-success response
    #[error("transport error{}: {message}", .status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    Transport {
        status: Option<u16>,
        message: String,
    },

    /// The call did not complete in time
    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// The device refused the change
    #[error("rejected by device: {0}")]
    Rejected(String),

    /// A batched call failed for some names
    #[error("failed for {}", .failed.iter().map(|f| format!("'{}' ({})", f.name, f.error)).collect::<Vec<_>>().join(", "))]
    PartialFailure { failed: Vec<NameFailure> },
}

impl ClientError {
    pub fn transport(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Transport {
            status,
            message: message.into(),
        }
    }

    /// Error kind in the reconciliation taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound => ErrorKind::NotFound,
            Self::Conflict => ErrorKind::Conflict,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Rejected(_) => ErrorKind::DeviceRejection,
            Self::PartialFailure { failed } => failed
                .first()
                .map_or(ErrorKind::DeviceRejection, |f| f.error.kind()),
        }
    }

    /// Whether retrying the same call may succeed
    ///
    /// Server errors and timeouts are transient; a 4xx response will not
    /// change on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { status, .. } => status.is_none_or(|s| s >= 500),
            Self::Timeout(_) => true,
            _ => false,
        }
    }
}

/// Capability wrapping the device configuration API.
///
/// All calls are idempotent on the device's eventual state except
/// `create` (fails with `Conflict` on a name collision) and `move_entry`.
pub trait ConfigClient: Send + Sync {
    /// Read one entry
    fn read(&self, location: &Location, kind: &str, name: &str) -> ClientResult<Entry>;

    /// List entries of a kind at a location, in device order
    fn list(&self, location: &Location, kind: &str) -> ClientResult<Vec<Entry>>;

    /// Create an entry; returns it as stored, with its surrogate id and
    /// any attributes the device computed
    fn create(&self, location: &Location, kind: &str, name: &str, body: &Raw) -> ClientResult<Entry>;

    /// Replace an existing entry's body
    fn update(&self, location: &Location, kind: &str, name: &str, body: &Raw) -> ClientResult<()>;

    /// Delete several entries; failures come back as `PartialFailure`
    fn delete(&self, location: &Location, kind: &str, names: &[String]) -> ClientResult<()>;

    /// Reposition an entry within an ordered collection
    fn move_entry(&self, location: &Location, kind: &str, name: &str, position: &Position) -> ClientResult<()>;

    /// Whether writes only take effect after `commit`
    fn commit_required(&self) -> bool {
        false
    }

    /// Activate the candidate configuration
    fn commit(&self) -> ClientResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ClientError::transport(Some(503), "unavailable").is_retryable());
        assert!(ClientError::transport(None, "connection reset").is_retryable());
        assert!(!ClientError::transport(Some(403), "forbidden").is_retryable());
        assert!(ClientError::Timeout(Duration::from_secs(60)).is_retryable());
        assert!(!ClientError::Conflict.is_retryable());
        assert!(!ClientError::NotFound.is_retryable());
        assert!(!ClientError::Rejected("bad".into()).is_retryable());
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(ClientError::NotFound.kind(), ErrorKind::NotFound);
        assert_eq!(ClientError::Rejected("x".into()).kind(), ErrorKind::DeviceRejection);
        let partial = ClientError::PartialFailure {
            failed: vec![NameFailure {
                name: "a".into(),
                error: ClientError::Rejected("in use".into()),
            }],
        };
        assert_eq!(partial.kind(), ErrorKind::DeviceRejection);
        assert_eq!(partial.to_string(), "failed for 'a' (rejected by device: in use)");
    }

    #[test]
    fn test_transport_display() {
        let err = ClientError::transport(Some(502), "bad gateway");
        assert_eq!(err.to_string(), "transport error (status 502): bad gateway");
    }
}
