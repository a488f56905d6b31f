//! JSON migration report: run summary, conflict groups and a ledger snapshot.

use crate::atomic::atomic_write_json;
use crate::config::RunMode;
use crate::conflict::{groups_from_records, ConflictGroup};
use crate::coordinator::RunSummary;
use crate::error::Result;
use crate::ledger::Ledger;
use crate::models::{Confidence, ItemRecord, Phase};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Current report format version.
pub const REPORT_VERSION: u32 = 1;

/// Everything an operator needs to review a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationReport {
    pub version: u32,
    pub generated_at: DateTime<Utc>,
    pub mode: RunMode,
    pub summary: RunSummary,
    /// Every conflict group recorded in the ledger, across runs
    pub conflicts: Vec<ConflictGroup>,
    /// LOW items (quarantined or headed there), for manual review
    pub quarantined: Vec<ItemRecord>,
    /// Items whose last attempt failed
    pub failed: Vec<ItemRecord>,
    pub records: Vec<ItemRecord>,
}

impl MigrationReport {
    /// Snapshot `ledger` alongside the summary of the run that produced it.
    pub fn build(ledger: &Ledger, summary: RunSummary) -> Result<Self> {
        let records = ledger.load()?;
        let quarantined = records
            .iter()
            .filter(|r| r.confidence == Confidence::Low || r.phase_state == Phase::Quarantined)
            .cloned()
            .collect();
        let failed = ledger.items_in_phase(Phase::Failed)?;
        let conflicts = groups_from_records(&records);

        Ok(Self {
            version: REPORT_VERSION,
            generated_at: Utc::now(),
            mode: summary.mode,
            summary,
            conflicts,
            quarantined,
            failed,
            records,
        })
    }

    /// Write the report atomically as pretty-printed JSON.
    pub fn write(&self, path: &Path) -> Result<()> {
        atomic_write_json(path, self)?;
        info!(
            "Wrote report for {} items to {}",
            self.records.len(),
            path.display()
        );
        Ok(())
    }
}
