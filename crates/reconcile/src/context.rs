//! Apply context and callback traits
//!
//! These traits let the executor report progress and ask for confirmation
//! without depending on a particular terminal UI.

use crate::planner::{Operation, Stage};
use crate::types::ExecuteSummary;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Cooperative cancellation signal
///
/// Clones share one flag. The executor polls it before every device call.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep up to `timeout`; returns true if cancelled meanwhile
    pub fn wait(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Lifecycle of one operation during apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    Pending,
    Running,
    /// A transient failure is being retried
    Retrying,
    Done,
    Failed,
    /// Not started because a dependency failed or apply stopped early
    Skipped,
}

impl OpStatus {
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for OpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// Progress callback for execution
///
/// Op transitions may be reported from worker threads; the executor
/// serializes the calls.
pub trait ProgressCallback: Send {
    /// Called before the first op of a stage starts
    fn on_stage_start(&mut self, stage: &Stage);

    /// Called whenever an op changes status
    fn on_op_status(&mut self, op: &Operation, status: OpStatus);

    /// Called once every op of the stage is final
    fn on_stage_complete(&mut self, stage: &Stage, summary: &ExecuteSummary);
}

/// Confirmation callback for user interaction
pub trait ConfirmCallback: Send {
    /// Ask the user to confirm an action
    fn confirm(&mut self, prompt: &str) -> std::io::Result<bool>;
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_stage_start(&mut self, _stage: &Stage) {}
    fn on_op_status(&mut self, _op: &Operation, _status: OpStatus) {}
    fn on_stage_complete(&mut self, _stage: &Stage, _summary: &ExecuteSummary) {}
}

/// Progress callback that writes to the `log` facade
pub struct LogProgress;

impl ProgressCallback for LogProgress {
    fn on_stage_start(&mut self, stage: &Stage) {
        log::debug!("Stage {}: {} ops", stage.index, stage.ops.len());
    }

    fn on_op_status(&mut self, op: &Operation, status: OpStatus) {
        match status {
            OpStatus::Done => log::info!("{op}: done"),
            OpStatus::Failed => log::warn!("{op}: failed"),
            OpStatus::Retrying => log::warn!("{op}: retrying"),
            other => log::debug!("{op}: {other}"),
        }
    }

    fn on_stage_complete(&mut self, stage: &Stage, summary: &ExecuteSummary) {
        log::debug!(
            "Stage {} complete: {} changes, {} failed",
            stage.index,
            summary.total_changes(),
            summary.failed
        );
    }
}

/// Auto-confirm callback (always returns true)
pub struct AutoConfirm;

impl ConfirmCallback for AutoConfirm {
    fn confirm(&mut self, _prompt: &str) -> std::io::Result<bool> {
        Ok(true)
    }
}

/// Auto-decline callback (always returns false)
pub struct AutoDecline;

impl ConfirmCallback for AutoDecline {
    fn confirm(&mut self, _prompt: &str) -> std::io::Result<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_cancel_is_shared_by_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_wait_returns_early_on_cancel() {
        let token = CancellationToken::new();
        let clone = token.clone();
        let start = Instant::now();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            clone.cancel();
        });
        assert!(token.wait(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_times_out_when_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.wait(Duration::from_millis(5)));
    }

    #[test]
    fn test_final_statuses() {
        assert!(OpStatus::Done.is_final());
        assert!(OpStatus::Skipped.is_final());
        assert!(!OpStatus::Retrying.is_final());
    }
}
