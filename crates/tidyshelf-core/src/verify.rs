//! Post-migration verification of a target library against its ledger.
//!
//! Every record with a verified copy is re-hashed at its final path. Files
//! under the library roots that no record accounts for are listed as extra.

use crate::config::{Defaults, LibraryLayout};
use crate::error::Result;
use crate::hashing::sha256_file;
use crate::ledger::short_id;
use crate::models::ItemRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// A ledger item whose copy is missing or no longer matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedItem {
    pub identity: String,
    pub path: PathBuf,
    /// Hash found on disk; `None` when the file is gone
    pub actual_hash: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub checked: usize,
    pub matched: usize,
    pub missing: Vec<VerifiedItem>,
    pub corrupted: Vec<VerifiedItem>,
    /// Comic files under the library roots with no ledger record
    pub extra: Vec<PathBuf>,
}

impl VerificationReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.corrupted.is_empty()
    }
}

impl std::fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} checked: {} ok, {} missing, {} corrupted, {} extra",
            self.checked,
            self.matched,
            self.missing.len(),
            self.corrupted.len(),
            self.extra.len()
        )
    }
}

fn is_comic(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            Defaults::COMIC_EXTENSIONS
                .iter()
                .any(|e| ext.eq_ignore_ascii_case(e))
        })
        .unwrap_or(false)
}

/// Re-hash every copied item and look for files the ledger does not know.
///
/// Dry-run records are ignored; they never produced a copy.
pub fn verify_library(records: &[ItemRecord], layout: &LibraryLayout) -> Result<VerificationReport> {
    let mut report = VerificationReport::default();
    let mut known: HashSet<PathBuf> = HashSet::new();

    for record in records.iter().filter(|r| !r.simulated) {
        let Some(path) = &record.final_target_path else {
            continue;
        };
        known.insert(path.clone());
        report.checked += 1;

        if !path.exists() {
            warn!("{} missing at {}", short_id(&record.identity), path.display());
            report.missing.push(VerifiedItem {
                identity: record.identity.clone(),
                path: path.clone(),
                actual_hash: None,
            });
            continue;
        }

        let actual = sha256_file(path)?;
        if actual == record.identity {
            report.matched += 1;
        } else {
            warn!(
                "{} corrupted at {}: got {}",
                short_id(&record.identity),
                path.display(),
                short_id(&actual)
            );
            report.corrupted.push(VerifiedItem {
                identity: record.identity.clone(),
                path: path.clone(),
                actual_hash: Some(actual),
            });
        }
    }

    for root in layout.roots() {
        if !root.is_dir() {
            continue;
        }
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if entry.file_type().is_file() && is_comic(entry.path()) && !known.contains(entry.path())
            {
                report.extra.push(entry.into_path());
            }
        }
    }

    info!("Verification: {}", report);
    Ok(report)
}
