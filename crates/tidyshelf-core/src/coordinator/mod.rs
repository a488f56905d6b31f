//! Batch coordinator: drives pending ledger items through the pipeline.
//!
//! Per batch (in discovery order):
//!
//! 1. Evaluate: enrich, score and resolve every item, bounded by the
//!    evaluation concurrency
//! 2. Barrier, then conflict detection over the whole batch
//! 3. Execute, bounded by the execution concurrency, retrying transient
//!    failures inline
//! 4. Flush the ledger
//!
//! Per-item failures are recorded on the item and never abort the run. Ledger
//! and environment errors do.

mod summary;

pub use summary::{BatchProgress, RunStage, RunSummary};

use crate::cancel::CancellationToken;
use crate::confidence::evaluate;
use crate::config::MigrationConfig;
use crate::conflict::{alt_path, collision_key, detect, ConflictCandidate, ConflictGroup};
use crate::enrich::{EnrichmentSource, RetryConfig};
use crate::error::{FailureClass, Result, ShelfError};
use crate::executor::{Execution, ExecutionOutcome, MigrationExecutor, Router};
use crate::ledger::{short_id, Ledger};
use crate::models::{Confidence, ConflictNote, ContentClass, ItemError, ItemRecord, Phase};
use crate::resolver::resolve;
use crate::safety::Preflight;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

fn append_reason(reasoning: &mut String, text: &str) {
    if !reasoning.is_empty() {
        reasoning.push_str("; ");
    }
    reasoning.push_str(text);
}

/// Runs migrations over the pending items of a ledger.
pub struct BatchCoordinator {
    config: MigrationConfig,
    ledger: Arc<Ledger>,
    enrichment: Arc<dyn EnrichmentSource>,
    executor: MigrationExecutor,
    cancel: CancellationToken,
    backoff: RetryConfig,
    progress_tx: Option<mpsc::Sender<BatchProgress>>,
    available_space_override: Option<u64>,
}

struct BatchContext {
    number: usize,
    total_batches: usize,
    items_total: usize,
}

impl BatchCoordinator {
    pub fn new(
        config: MigrationConfig,
        ledger: Arc<Ledger>,
        enrichment: Arc<dyn EnrichmentSource>,
    ) -> Self {
        let executor = MigrationExecutor::from_config(&config);
        Self {
            config,
            ledger,
            enrichment,
            executor,
            cancel: CancellationToken::new(),
            backoff: RetryConfig::default(),
            progress_tx: None,
            available_space_override: None,
        }
    }

    /// Replace the executor (custom transfer or classifier).
    pub fn with_executor(mut self, executor: MigrationExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Backoff between inline retries of transient execution failures.
    pub fn with_backoff(mut self, backoff: RetryConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_progress(mut self, progress_tx: mpsc::Sender<BatchProgress>) -> Self {
        self.progress_tx = Some(progress_tx);
        self
    }

    /// Report `bytes` of free space to the preflight check instead of asking
    /// the filesystem.
    pub fn with_available_space(mut self, bytes: u64) -> Self {
        self.available_space_override = Some(bytes);
        self
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Process every pending item.
    pub async fn run(&self) -> Result<RunSummary> {
        self.config.validate()?;
        let mode = self.config.mode;
        let mut summary = RunSummary::start(mode);
        info!(
            "Starting {} run: {} -> {}",
            mode.as_str(),
            self.config.source_root.display(),
            self.config.layout.western_root.display()
        );

        if mode.is_apply() && self.ledger.has_simulated()? {
            let err = ShelfError::Config {
                message: format!(
                    "ledger {} holds dry-run results; apply runs need their own ledger",
                    self.ledger.path().display()
                ),
            };
            error!("{}", err);
            return Err(err);
        }

        let pending = self.ledger.pending(self.config.max_retries)?;
        let required_bytes: u64 = pending.iter().map(|r| r.size_bytes).sum();
        let mut preflight = Preflight::new(&self.config, required_bytes);
        if let Some(bytes) = self.available_space_override {
            preflight = preflight.with_available_space(bytes);
        }
        if let Err(e) = preflight.run().ensure_passed() {
            error!("Preflight failed: {}", e);
            return Err(e);
        }

        let pending = self.revert_retryable(pending)?;
        let mut claimed = self.claimed_destinations()?;
        let batch_size = self.config.batch_size;
        let total_batches = pending.len().div_ceil(batch_size);
        info!(
            "{} pending items in {} batches of up to {}",
            pending.len(),
            total_batches,
            batch_size
        );

        for (index, batch) in pending.chunks(batch_size).enumerate() {
            if self.cancel.is_cancelled() {
                summary.interrupted = true;
                break;
            }
            let ctx = BatchContext {
                number: index + 1,
                total_batches,
                items_total: pending.len(),
            };
            info!("Batch {}/{}: {} items", ctx.number, total_batches, batch.len());

            let interrupted = self
                .process_batch(batch.to_vec(), &ctx, &mut claimed, &mut summary)
                .await?;
            self.ledger.flush()?;
            summary.batches_processed += 1;
            if interrupted {
                summary.interrupted = true;
                break;
            }
        }

        self.ledger.flush()?;
        summary.tally(&self.ledger.load()?);
        if summary.interrupted {
            warn!(
                "Run interrupted after {} items; rerun to resume",
                summary.items_processed
            );
        }
        info!(
            "Run finished: {} items processed, {} copies, {} conflict groups",
            summary.items_processed,
            summary.copies_performed,
            summary.conflicts.len()
        );
        self.send_progress(BatchProgress {
            batch: summary.batches_processed,
            total_batches,
            stage: RunStage::Complete,
            items_in_batch: 0,
            items_done: summary.items_processed,
            items_total: pending.len(),
        })
        .await;
        Ok(summary)
    }

    /// Returns true when the batch stopped early on cancellation.
    async fn process_batch(
        &self,
        batch: Vec<ItemRecord>,
        ctx: &BatchContext,
        claimed: &mut HashSet<String>,
        summary: &mut RunSummary,
    ) -> Result<bool> {
        let size = batch.len();
        self.report_stage(ctx, RunStage::Evaluating, size, summary).await;

        let prepared: Vec<Result<ItemRecord>> = stream::iter(batch.into_iter().map(|r| self.prepare(r)))
            .buffer_unordered(self.config.concurrency.evaluation)
            .collect()
            .await;
        let mut records = Vec::with_capacity(prepared.len());
        for record in prepared {
            records.push(record?);
        }
        records.sort_by_key(|r| r.discovery_seq);

        // conflict detection needs every item of the batch mapped
        if self.cancel.is_cancelled() {
            return Ok(true);
        }

        self.report_stage(ctx, RunStage::ResolvingConflicts, size, summary).await;
        let groups = self.resolve_conflicts(&mut records, claimed)?;
        summary.conflicts.extend(groups);

        self.report_stage(ctx, RunStage::Executing, size, summary).await;
        let mapped: Vec<ItemRecord> = records
            .into_iter()
            .filter(|r| r.phase_state == Phase::Mapped)
            .collect();
        let executions: Vec<Result<Execution>> =
            stream::iter(mapped.into_iter().map(|r| self.execute_with_retry(r)))
                .buffer_unordered(self.config.concurrency.execution)
                .collect()
                .await;

        let mut interrupted = false;
        for execution in executions {
            let execution = execution?;
            if execution.outcome == ExecutionOutcome::Interrupted {
                interrupted = true;
                continue;
            }
            summary.items_processed += 1;
            if let Some(bytes) = execution.bytes_copied {
                summary.copies_performed += 1;
                summary.bytes_copied += bytes;
            }
        }
        Ok(interrupted)
    }

    /// Enrich, score and resolve one item up to MAPPED.
    async fn prepare(&self, mut record: ItemRecord) -> Result<ItemRecord> {
        if self.cancel.is_cancelled() {
            return Ok(record);
        }

        match record.phase_state {
            Phase::ConflictPending => {
                // interrupted between the two conflict writes; the suffix is
                // already on the record
                record.transition(Phase::Mapped)?;
                self.ledger.upsert(&record)?;
                return Ok(record);
            }
            Phase::Discovered => {
                let enrichment = self.enrichment.enrich(&record).await;
                record.content_class = enrichment
                    .content_class
                    .unwrap_or_else(|| ContentClass::infer_from_path(&record.relative_path));
                record.metadata = Some(enrichment.metadata);
                record.signals = Some(enrichment.signals);
                record.transition(Phase::Enriched)?;
                self.ledger.upsert(&record)?;
            }
            _ => {}
        }

        if record.phase_state == Phase::Enriched {
            self.map(&mut record);
            record.transition(Phase::Mapped)?;
            self.ledger.upsert(&record)?;
            debug!(
                "{} mapped as {} ({}): {}",
                short_id(&record.identity),
                record.confidence,
                record.content_class,
                record.reasoning
            );
        }
        Ok(record)
    }

    fn map(&self, record: &mut ItemRecord) {
        if record.confidence == Confidence::Unscored {
            let signals = record.signals.clone().unwrap_or_default();
            let assessment = evaluate(&signals, &self.config.thresholds);
            record.confidence = assessment.confidence;
            record.reasoning = assessment.reasoning;
        }

        let metadata = record.metadata.clone().unwrap_or_default();
        match resolve(record.content_class, &metadata, &record.source_extension()) {
            Ok(path) => record.proposed_target_path = Some(path),
            Err(e) => {
                record.proposed_target_path = None;
                record.push_error(ItemError::new(
                    FailureClass::PersistentData,
                    format!("path resolution failed: {}", e),
                ));
                if record.confidence != Confidence::Low {
                    warn!(
                        "{} cannot be resolved ({}); routing to quarantine",
                        record.source_path.display(),
                        e
                    );
                    record.confidence = Confidence::Low;
                    append_reason(&mut record.reasoning, &format!("downgraded to LOW: {}", e));
                }
            }
        }
    }

    /// Detect conflicts among the batch's mapped items and rewrite the losers.
    ///
    /// Every group member gets a [`ConflictNote`] so the group survives in the
    /// ledger. Quarantined items compete on their bare quarantine path; their
    /// suffix is applied by the router.
    fn resolve_conflicts(
        &self,
        records: &mut [ItemRecord],
        claimed: &mut HashSet<String>,
    ) -> Result<Vec<ConflictGroup>> {
        let router = self.executor.router();
        for record in records.iter_mut() {
            if record.phase_state == Phase::Mapped && Router::is_quarantined(record.confidence) {
                // re-detected below from the bare path
                record.conflict = None;
            }
        }
        let candidates: Vec<ConflictCandidate> = records
            .iter()
            .filter(|r| r.phase_state == Phase::Mapped)
            .filter_map(|r| {
                let destination = if Router::is_quarantined(r.confidence) {
                    Ok(router.quarantine_path(r))
                } else {
                    router.destination(r)
                };
                match destination {
                    Ok(destination) => Some(ConflictCandidate {
                        identity: r.identity.clone(),
                        destination,
                        confidence: r.confidence,
                        discovery_seq: r.discovery_seq,
                    }),
                    Err(e) => {
                        debug!("{} has no destination: {}", short_id(&r.identity), e);
                        None
                    }
                }
            })
            .collect();

        let outcome = detect(&candidates, claimed);
        for group in &outcome.groups {
            for member in &group.members {
                let Some(record) = records.iter_mut().find(|r| r.identity == member.identity)
                else {
                    continue;
                };
                let resolution = outcome
                    .resolutions
                    .iter()
                    .find(|r| r.identity == member.identity);
                record.conflict = Some(ConflictNote {
                    key: group.key.clone(),
                    claimed_earlier: group.claimed_earlier,
                    suffix: resolution.map(|r| r.suffix),
                    confidence_before: member.confidence_before,
                    confidence_after: member.confidence_after,
                    destination: member.destination.clone(),
                });

                let Some(resolution) = resolution else {
                    // kept the bare path
                    self.ledger.upsert(record)?;
                    continue;
                };
                if !Router::is_quarantined(record.confidence) {
                    record.proposed_target_path = record
                        .proposed_target_path
                        .as_deref()
                        .map(|p| alt_path(p, resolution.suffix));
                }
                record.confidence = resolution.confidence;
                append_reason(
                    &mut record.reasoning,
                    &format!("target conflict, renamed with -alt{}", resolution.suffix),
                );
                if resolution.downgraded {
                    append_reason(&mut record.reasoning, "downgraded from HIGH");
                }
                record.transition(Phase::ConflictPending)?;
                self.ledger.upsert(record)?;
                record.transition(Phase::Mapped)?;
                self.ledger.upsert(record)?;
            }
        }

        for record in records.iter() {
            if record.phase_state == Phase::Mapped {
                if let Ok(destination) = router.destination(record) {
                    claimed.insert(collision_key(&destination));
                }
            }
        }

        if !outcome.is_clean() {
            info!(
                "{} conflict groups, {} items renamed",
                outcome.groups.len(),
                outcome.resolutions.len()
            );
        }
        Ok(outcome.groups)
    }

    /// Execute one item, retrying transient failures while budget remains.
    async fn execute_with_retry(&self, mut record: ItemRecord) -> Result<Execution> {
        loop {
            let execution = self.executor.execute(record, &self.cancel).await;
            match execution.outcome {
                ExecutionOutcome::Interrupted => return Ok(execution),
                ExecutionOutcome::Failed(FailureClass::Transient)
                    if execution.record.can_retry(self.config.max_retries)
                        && !self.cancel.is_cancelled() =>
                {
                    self.ledger.upsert(&execution.record)?;
                    let mut next = execution.record;
                    let delay = self
                        .backoff
                        .calculate_delay(next.retry_count.saturating_sub(1));
                    debug!(
                        "Retrying {} in {:?} (attempt {})",
                        short_id(&next.identity),
                        delay,
                        next.retry_count + 1
                    );
                    tokio::time::sleep(delay).await;
                    next.revert_for_retry(self.config.max_retries)?;
                    self.ledger.upsert(&next)?;
                    record = next;
                }
                _ => {
                    self.ledger.upsert(&execution.record)?;
                    return Ok(execution);
                }
            }
        }
    }

    /// Collision keys of destinations owned by earlier runs and batches.
    fn claimed_destinations(&self) -> Result<HashSet<String>> {
        Ok(self
            .ledger
            .load()?
            .iter()
            .filter(|r| {
                matches!(
                    r.phase_state,
                    Phase::Migrated | Phase::Quarantined | Phase::Skipped
                )
            })
            .filter_map(|r| r.final_target_path.as_ref().or(r.planned_target_path.as_ref()))
            .map(|p| collision_key(p))
            .collect())
    }

    /// FAILED items with transient retry budget go back to MAPPED.
    fn revert_retryable(&self, pending: Vec<ItemRecord>) -> Result<Vec<ItemRecord>> {
        let mut out = Vec::with_capacity(pending.len());
        for mut record in pending {
            if record.phase_state == Phase::Failed {
                record.revert_for_retry(self.config.max_retries)?;
                self.ledger.upsert(&record)?;
                info!(
                    "Retrying {} (attempt {})",
                    record.source_path.display(),
                    record.retry_count + 1
                );
            }
            out.push(record);
        }
        Ok(out)
    }

    async fn report_stage(
        &self,
        ctx: &BatchContext,
        stage: RunStage,
        items_in_batch: usize,
        summary: &RunSummary,
    ) {
        self.send_progress(BatchProgress {
            batch: ctx.number,
            total_batches: ctx.total_batches,
            stage,
            items_in_batch,
            items_done: summary.items_processed,
            items_total: ctx.items_total,
        })
        .await;
    }

    async fn send_progress(&self, progress: BatchProgress) {
        if let Some(ref tx) = self.progress_tx {
            let _ = tx.send(progress).await;
        }
    }
}
