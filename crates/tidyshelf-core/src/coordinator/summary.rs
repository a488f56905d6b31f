//! Run summary and progress types.

use crate::config::RunMode;
use crate::conflict::{groups_from_records, ConflictGroup};
use crate::error::FailureClass;
use crate::models::{Confidence, ItemRecord, Phase};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Stage of the batch currently being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Evaluating,
    ResolvingConflicts,
    Executing,
    Complete,
}

/// Progress update sent on the optional progress channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    /// 1-based batch number
    pub batch: usize,
    pub total_batches: usize,
    pub stage: RunStage,
    pub items_in_batch: usize,
    /// Items finished so far in this run
    pub items_done: usize,
    pub items_total: usize,
}

/// Outcome of one coordinator run.
///
/// Phase and confidence counts cover the whole ledger after the run; copy and
/// conflict figures cover only the work done by this run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_items: usize,
    pub by_phase: BTreeMap<String, usize>,
    pub by_confidence: BTreeMap<String, usize>,
    /// FAILED items keyed by the class of their last error
    pub failures_by_class: BTreeMap<String, usize>,
    pub items_processed: usize,
    pub batches_processed: usize,
    pub copies_performed: usize,
    pub bytes_copied: u64,
    pub conflicts: Vec<ConflictGroup>,
    /// The run stopped early on cancellation
    pub interrupted: bool,
}

impl RunSummary {
    pub(crate) fn start(mode: RunMode) -> Self {
        let now = Utc::now();
        Self {
            mode,
            started_at: now,
            finished_at: now,
            total_items: 0,
            by_phase: BTreeMap::new(),
            by_confidence: BTreeMap::new(),
            failures_by_class: BTreeMap::new(),
            items_processed: 0,
            batches_processed: 0,
            copies_performed: 0,
            bytes_copied: 0,
            conflicts: Vec::new(),
            interrupted: false,
        }
    }

    /// Summary of a ledger outside of any run; conflict groups are rebuilt
    /// from the notes on the records.
    pub fn snapshot(mode: RunMode, records: &[ItemRecord]) -> Self {
        let mut summary = Self::start(mode);
        summary.tally(records);
        summary.conflicts = groups_from_records(records);
        summary
    }

    /// Recount phase, confidence and failure tallies from `records`.
    pub(crate) fn tally(&mut self, records: &[ItemRecord]) {
        self.total_items = records.len();
        self.by_phase.clear();
        self.by_confidence.clear();
        self.failures_by_class.clear();

        for record in records {
            *self
                .by_phase
                .entry(record.phase_state.as_str().to_string())
                .or_default() += 1;
            *self
                .by_confidence
                .entry(record.confidence.as_str().to_string())
                .or_default() += 1;
            if record.phase_state == Phase::Failed {
                if let Some(error) = record.last_error() {
                    *self
                        .failures_by_class
                        .entry(error.class.as_str().to_string())
                        .or_default() += 1;
                }
            }
        }
        self.finished_at = Utc::now();
    }

    pub fn phase_count(&self, phase: Phase) -> usize {
        self.by_phase.get(phase.as_str()).copied().unwrap_or(0)
    }

    pub fn confidence_count(&self, confidence: Confidence) -> usize {
        self.by_confidence.get(confidence.as_str()).copied().unwrap_or(0)
    }

    pub fn failure_count(&self, class: FailureClass) -> usize {
        self.failures_by_class.get(class.as_str()).copied().unwrap_or(0)
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} run: {} items, {} copies ({} bytes){}",
            self.mode.as_str(),
            self.total_items,
            self.copies_performed,
            self.bytes_copied,
            if self.interrupted { ", interrupted" } else { "" }
        )?;
        for (phase, count) in &self.by_phase {
            writeln!(f, "  {:<17} {}", phase, count)?;
        }
        for (confidence, count) in &self.by_confidence {
            writeln!(f, "  {:<17} {}", confidence, count)?;
        }
        for (class, count) in &self.failures_by_class {
            writeln!(f, "  failed/{:<10} {}", class, count)?;
        }
        write!(f, "  conflict groups   {}", self.conflicts.len())
    }
}
