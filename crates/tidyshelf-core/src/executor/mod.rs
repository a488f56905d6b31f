//! Migration executor: moves one mapped item to its routed destination.
//!
//! Per item:
//!
//! 1. Route by confidence (see [`Router`])
//! 2. Re-hash the source; it must still match the item identity
//! 3. If the destination exists, skip when identical, fail when different
//! 4. Dry run stops here and records what would have happened
//! 5. Check for cancellation (last chance before bytes move)
//! 6. Copy to a hidden partial sibling, verify its hash, rename into place
//!
//! A partial file never sits at the destination path. On a hash mismatch the
//! partial is deleted and the item fails with an integrity error.

mod routing;
mod transfer;

pub use routing::Router;
pub use transfer::{FileTransfer, LocalTransfer};

use crate::cancel::CancellationToken;
use crate::config::{Defaults, LibraryLayout, MigrationConfig, RunMode};
use crate::error::{DefaultClassifier, FailureClass, FailureClassifier, Result, ShelfError};
use crate::hashing::sha256_file;
use crate::ledger::short_id;
use crate::models::{ItemError, ItemRecord, Phase};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What happened to one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Migrated,
    Quarantined,
    Skipped,
    Failed(FailureClass),
    /// Cancelled before the copy started; the item is unchanged
    Interrupted,
}

/// Updated record plus the outcome that produced it.
#[derive(Debug, Clone)]
pub struct Execution {
    pub record: ItemRecord,
    pub outcome: ExecutionOutcome,
    /// Bytes written when a real copy happened; `None` for skips, dry runs
    /// and failures
    pub bytes_copied: Option<u64>,
}

impl Execution {
    pub fn copied(&self) -> bool {
        self.bytes_copied.is_some()
    }
}

enum TargetState {
    Absent,
    Identical(String),
    Different,
}

/// Executes migrations for one run.
#[derive(Debug, Clone)]
pub struct MigrationExecutor {
    router: Router,
    mode: RunMode,
    transfer: Arc<dyn FileTransfer>,
    classifier: Arc<dyn FailureClassifier>,
}

impl MigrationExecutor {
    pub fn new(layout: LibraryLayout, mode: RunMode, best_guess_separate_folder: bool) -> Self {
        Self {
            router: Router::new(layout, best_guess_separate_folder),
            mode,
            transfer: Arc::new(LocalTransfer),
            classifier: Arc::new(DefaultClassifier::default()),
        }
    }

    pub fn from_config(config: &MigrationConfig) -> Self {
        Self::new(
            config.layout.clone(),
            config.mode,
            config.best_guess_separate_folder,
        )
    }

    /// Replace the byte transfer implementation.
    pub fn with_transfer(mut self, transfer: Arc<dyn FileTransfer>) -> Self {
        self.transfer = transfer;
        self
    }

    /// Replace the failure classifier.
    pub fn with_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn classifier(&self) -> &Arc<dyn FailureClassifier> {
        &self.classifier
    }

    /// Execute one MAPPED item.
    ///
    /// Per-item failures are recorded on the returned record; this never
    /// fails as a whole.
    pub async fn execute(&self, record: ItemRecord, cancel: &CancellationToken) -> Execution {
        let original = record.clone();
        let mut record = record;

        match self.run(&mut record, cancel).await {
            Ok((ExecutionOutcome::Interrupted, _)) => Execution {
                record: original,
                outcome: ExecutionOutcome::Interrupted,
                bytes_copied: None,
            },
            Ok((outcome, bytes_copied)) => Execution {
                record,
                outcome,
                bytes_copied,
            },
            Err(err) => {
                let class = self.classifier.classify(&err);
                warn!(
                    "Migration of {} failed ({}): {}",
                    record.source_path.display(),
                    class,
                    err
                );
                record.simulated = !self.mode.is_apply();
                if let Err(e) = record.record_failure(ItemError::new(class, err.to_string())) {
                    warn!("Could not mark {} failed: {}", short_id(&record.identity), e);
                }
                Execution {
                    record,
                    outcome: ExecutionOutcome::Failed(class),
                    bytes_copied: None,
                }
            }
        }
    }

    async fn run(
        &self,
        record: &mut ItemRecord,
        cancel: &CancellationToken,
    ) -> Result<(ExecutionOutcome, Option<u64>)> {
        if cancel.is_cancelled() {
            return Ok((ExecutionOutcome::Interrupted, None));
        }

        let destination = self.router.destination(record)?;
        let quarantined = Router::is_quarantined(record.confidence);
        record.planned_target_path = Some(destination.clone());

        let source = record.source_path.clone();
        let expected = record.source_hash.clone();
        let target = destination.clone();
        let state = tokio::task::spawn_blocking(move || check_preconditions(&source, &expected, &target))
            .await
            .map_err(|e| ShelfError::Other(format!("Precondition task failed: {}", e)))??;

        match state {
            TargetState::Identical(hash) => {
                debug!("{} already present at {}", short_id(&record.identity), destination.display());
                if self.mode.is_apply() {
                    record.final_target_path = Some(destination);
                    record.target_hash = Some(hash);
                } else {
                    record.simulated = true;
                }
                record.transition(Phase::Skipped)?;
                return Ok((ExecutionOutcome::Skipped, None));
            }
            TargetState::Different => return Err(ShelfError::TargetConflict(destination)),
            TargetState::Absent => {}
        }

        let (phase, outcome) = if quarantined {
            (Phase::Quarantined, ExecutionOutcome::Quarantined)
        } else {
            (Phase::Migrated, ExecutionOutcome::Migrated)
        };

        if !self.mode.is_apply() {
            record.simulated = true;
            record.transition(phase)?;
            debug!(
                "[dry run] {} -> {}",
                record.source_path.display(),
                destination.display()
            );
            return Ok((outcome, None));
        }

        // Past this point the copy runs to completion.
        if cancel.is_cancelled() {
            return Ok((ExecutionOutcome::Interrupted, None));
        }

        let transfer = Arc::clone(&self.transfer);
        let source = record.source_path.clone();
        let expected = record.source_hash.clone();
        let target = destination.clone();
        let (hash, bytes) = tokio::task::spawn_blocking(move || {
            copy_verified(transfer.as_ref(), &source, &target, &expected)
        })
        .await
        .map_err(|e| ShelfError::Other(format!("Copy task failed: {}", e)))??;

        record.final_target_path = Some(destination.clone());
        record.target_hash = Some(hash);
        record.simulated = false;
        record.transition(phase)?;

        info!(
            "{} {} -> {}",
            if quarantined { "Quarantined" } else { "Migrated" },
            record.source_path.display(),
            destination.display()
        );
        Ok((outcome, Some(bytes)))
    }
}

fn check_preconditions(source: &Path, expected: &str, destination: &Path) -> Result<TargetState> {
    let meta = fs::metadata(source).map_err(|e| ShelfError::io_with_path(e, source))?;
    if !meta.is_file() {
        return Err(ShelfError::FileNotFound(source.to_path_buf()));
    }

    let actual = sha256_file(source)?;
    if actual != expected {
        return Err(ShelfError::SourceChanged {
            path: source.to_path_buf(),
            expected: expected.to_string(),
            actual,
        });
    }

    if !destination.exists() {
        return Ok(TargetState::Absent);
    }
    let existing = sha256_file(destination)?;
    if existing == actual {
        Ok(TargetState::Identical(existing))
    } else {
        Ok(TargetState::Different)
    }
}

/// Hidden staging path next to `destination`.
pub fn partial_path(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    destination.with_file_name(format!(
        ".{}.{}-{}",
        name,
        Defaults::PARTIAL_SUFFIX,
        uuid::Uuid::new_v4().simple()
    ))
}

fn copy_verified(
    transfer: &dyn FileTransfer,
    source: &Path,
    destination: &Path,
    expected: &str,
) -> Result<(String, u64)> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).map_err(|e| ShelfError::io_with_path(e, parent))?;
    }

    let partial = partial_path(destination);
    let discard = |err: ShelfError| {
        if partial.exists() {
            if let Err(e) = fs::remove_file(&partial) {
                warn!("Failed to remove partial {}: {}", partial.display(), e);
            }
        }
        err
    };

    let bytes = transfer.copy(source, &partial).map_err(discard)?;
    let actual = sha256_file(&partial).map_err(discard)?;
    if actual != expected {
        return Err(discard(ShelfError::HashMismatch {
            path: destination.to_path_buf(),
            expected: expected.to_string(),
            actual,
        }));
    }
    if destination.exists() {
        return Err(discard(ShelfError::TargetConflict(destination.to_path_buf())));
    }
    fs::rename(&partial, destination).map_err(|e| discard(ShelfError::io_with_path(e, destination)))?;

    Ok((actual, bytes))
}
