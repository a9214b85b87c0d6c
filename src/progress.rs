//! Progress bar for `apply`, driven by the engine's progress callback

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use reconcile::{ExecuteSummary, OpStatus, Operation, ProgressCallback, Stage};

use crate::ui;

const TEMPLATE: &str = "{spinner:.green} stage {prefix} [{bar:40.cyan/blue}] {pos}/{len} {msg}";
const MESSAGE_WIDTH: usize = 50;

/// Reports op transitions on an indicatif bar
pub struct ApplyProgress {
    bar: ProgressBar,
    stages: usize,
}

impl ApplyProgress {
    pub fn new(ops: usize, stages: usize, quiet: bool) -> Self {
        let bar = if quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(ops as u64)
        };
        bar.set_style(
            ProgressStyle::default_bar()
                .template(TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        Self { bar, stages }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }

    fn message(&self, symbol: &str, op: &Operation) {
        self.bar
            .set_message(format!("{symbol} {}", ui::truncate(&op.to_string(), MESSAGE_WIDTH)));
    }
}

impl ProgressCallback for ApplyProgress {
    fn on_stage_start(&mut self, stage: &Stage) {
        self.bar.set_prefix(format!("{}/{}", stage.index + 1, self.stages));
        log::debug!("Stage {} of {}: {} ops", stage.index + 1, self.stages, stage.ops.len());
    }

    fn on_op_status(&mut self, op: &Operation, status: OpStatus) {
        match status {
            OpStatus::Running => self.message("→", op),
            OpStatus::Retrying => self.message("↻", op),
            OpStatus::Done => {
                self.message("✓", op);
                self.bar.inc(1);
            }
            OpStatus::Failed => {
                self.bar.suspend(|| println!("  {} {op}", "✗".red()));
                self.bar.inc(1);
            }
            OpStatus::Skipped => {
                self.bar.suspend(|| println!("  {} {op}", "⊘".dimmed()));
                self.bar.inc(1);
            }
            OpStatus::Pending => {}
        }
    }

    fn on_stage_complete(&mut self, stage: &Stage, summary: &ExecuteSummary) {
        log::debug!(
            "Stage {} done: {} changes, {} failed, {} skipped",
            stage.index + 1,
            summary.total_changes(),
            summary.failed,
            summary.skipped
        );
    }
}
