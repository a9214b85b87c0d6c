//! Core types for reconciliation

use crate::location::Location;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identity of a resource on the device: `(kind, location, name)`
///
/// Ordering is lexicographic over the triple and is used as the
/// deterministic tie-break everywhere the planner has a free choice.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: String,
    pub location: Location,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: impl Into<String>, location: Location, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            location,
            name: name.into(),
        }
    }

    /// Same location and kind, different name
    pub fn sibling(&self, name: impl Into<String>) -> Self {
        Self::new(self.kind.clone(), self.location.clone(), name)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]/{}", self.kind, self.location, self.name)
    }
}

/// A declared or observed resource
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub key: ResourceKey,
    /// Body as an `Object` value
    pub body: Value,
    /// Surrogate id issued by the device on create
    pub id: Option<String>,
    /// Issued during apply and never persisted
    pub ephemeral: bool,
}

impl Resource {
    pub fn new(key: ResourceKey, body: Value) -> Self {
        Self {
            key,
            body,
            id: None,
            ephemeral: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn kind(&self) -> &str {
        &self.key.kind
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }

    pub fn location(&self) -> &Location {
        &self.key.location
    }
}

/// Configuration for retry logic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let capped = delay.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Create a config that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Deadlines enforced by the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    /// Per device call
    pub op: Duration,
    /// Per stage, across all of its ops and retries
    pub stage: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            op: Duration::from_secs(60),
            stage: Duration::from_secs(600),
        }
    }
}

/// Options for execution
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Worker pool size for ops within a stage
    pub parallelism: usize,
    /// Keep starting later stages after a failure
    pub continue_on_failure: bool,
    pub timeouts: Timeouts,
    pub retry: RetryConfig,
    /// Re-read affected resources after apply and report drift
    pub verify: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            parallelism: 8,
            continue_on_failure: false,
            timeouts: Timeouts::default(),
            retry: RetryConfig::default(),
            verify: true,
        }
    }
}

/// Summary of execution results
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub moved: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl ExecuteSummary {
    /// Total number of actual changes made
    pub fn total_changes(&self) -> usize {
        self.created + self.updated + self.deleted + self.moved
    }

    /// Check if execution was fully successful (no failures)
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }

    /// Total number of ops processed
    pub fn total(&self) -> usize {
        self.total_changes() + self.failed + self.skipped
    }

    /// Merge another summary into this one
    pub fn merge(&mut self, other: &ExecuteSummary) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.moved += other.moved;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ordering_is_kind_location_name() {
        let a = ResourceKey::new("address", Location::shared(), "z");
        let b = ResourceKey::new("address", Location::device_group("dg"), "a");
        let c = ResourceKey::new("address_group", Location::shared(), "a");
        let mut keys = vec![c.clone(), b.clone(), a.clone()];
        keys.sort();
        assert_eq!(keys, vec![a, b, c]);
    }

    #[test]
    fn test_key_display() {
        let key = ResourceKey::new("address", Location::device_group("dg1"), "web");
        assert_eq!(key.to_string(), "address[device_group:dg1]/web");
    }

    #[test]
    fn test_retry_delays_follow_backoff_with_cap() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn test_summary_merge() {
        let mut a = ExecuteSummary {
            created: 1,
            ..Default::default()
        };
        a.merge(&ExecuteSummary {
            moved: 2,
            failed: 1,
            ..Default::default()
        });
        assert_eq!(a.total_changes(), 3);
        assert_eq!(a.total(), 4);
        assert!(!a.is_success());
    }
}
