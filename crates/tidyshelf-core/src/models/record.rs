//! The per-item ledger record and its phase state machine.

use crate::error::{FailureClass, Result, ShelfError};
use crate::models::{ComicMetadata, ContentClass, MatchSignals};
use crate::scan::ScanEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Confidence tier of an automated rename decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Confidence {
    High,
    Medium,
    Low,
    #[default]
    Unscored,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::High => "HIGH",
            Confidence::Medium => "MEDIUM",
            Confidence::Low => "LOW",
            Confidence::Unscored => "UNSCORED",
        }
    }

    /// Ordering weight, higher is more trustworthy.
    pub fn rank(&self) -> u8 {
        match self {
            Confidence::High => 3,
            Confidence::Medium => 2,
            Confidence::Low => 1,
            Confidence::Unscored => 0,
        }
    }

    /// One tier down. LOW and UNSCORED stay where they are.
    pub fn downgraded(&self) -> Self {
        match self {
            Confidence::High => Confidence::Medium,
            Confidence::Medium => Confidence::Low,
            other => *other,
        }
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Processing stage of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    #[default]
    Discovered,
    Enriched,
    Mapped,
    ConflictPending,
    Migrated,
    Quarantined,
    Failed,
    Skipped,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::Discovered,
        Phase::Enriched,
        Phase::Mapped,
        Phase::ConflictPending,
        Phase::Migrated,
        Phase::Quarantined,
        Phase::Failed,
        Phase::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Discovered => "DISCOVERED",
            Phase::Enriched => "ENRICHED",
            Phase::Mapped => "MAPPED",
            Phase::ConflictPending => "CONFLICT_PENDING",
            Phase::Migrated => "MIGRATED",
            Phase::Quarantined => "QUARANTINED",
            Phase::Failed => "FAILED",
            Phase::Skipped => "SKIPPED",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Phase::Discovered => 0,
            Phase::Enriched => 1,
            Phase::Mapped => 2,
            Phase::ConflictPending => 3,
            Phase::Migrated | Phase::Quarantined | Phase::Failed | Phase::Skipped => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 4
    }

    /// Whether `self -> next` is a legal ledger transition.
    ///
    /// Forward moves are always legal. The only backward moves are
    /// CONFLICT_PENDING -> MAPPED and the retry reversion FAILED -> MAPPED
    /// (the retry budget itself is checked by [`ItemRecord::revert_for_retry`]).
    /// Rewriting a record in its current phase is allowed.
    pub fn can_transition_to(&self, next: Phase) -> bool {
        if *self == next {
            return true;
        }
        match (self, next) {
            (Phase::ConflictPending, Phase::Mapped) | (Phase::Failed, Phase::Mapped) => true,
            (from, to) => !from.is_terminal() && to.rank() > from.rank(),
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One failure attached to an item. The list on a record is append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemError {
    pub class: FailureClass,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ItemError {
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Full processing state of one source file, keyed by content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    /// SHA-256 of the source content; ledger primary key
    pub identity: String,
    pub source_path: PathBuf,
    /// Source path relative to the scan root
    pub relative_path: PathBuf,
    pub size_bytes: u64,
    pub modified_time: Option<DateTime<Utc>>,
    pub discovery_seq: u64,
    pub content_class: ContentClass,
    #[serde(default)]
    pub metadata: Option<ComicMetadata>,
    #[serde(default)]
    pub signals: Option<MatchSignals>,
    pub confidence: Confidence,
    #[serde(default)]
    pub reasoning: String,
    /// Resolver output, relative to the class root
    #[serde(default)]
    pub proposed_target_path: Option<PathBuf>,
    /// Routed absolute destination chosen by the executor
    #[serde(default)]
    pub planned_target_path: Option<PathBuf>,
    /// Set only once a verified copy exists at this path
    #[serde(default)]
    pub final_target_path: Option<PathBuf>,
    pub phase_state: Phase,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub errors: Vec<ItemError>,
    pub source_hash: String,
    #[serde(default)]
    pub target_hash: Option<String>,
    /// Terminal phase was produced by a dry run
    #[serde(default)]
    pub simulated: bool,
    /// Destination collision this item took part in
    #[serde(default)]
    pub conflict: Option<ConflictNote>,
    pub updated_at: DateTime<Utc>,
}

/// An item's part in a destination collision, kept on the record so the
/// group can be rebuilt from the ledger alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictNote {
    /// Collision key shared by every member of the group
    pub key: String,
    pub claimed_earlier: bool,
    /// `n` in `-alt{n}`; `None` for the member that kept the bare path
    pub suffix: Option<u32>,
    pub confidence_before: Confidence,
    pub confidence_after: Confidence,
    pub destination: PathBuf,
}

impl ItemRecord {
    /// Seed a DISCOVERED record from a scan entry.
    pub fn discovered(entry: &ScanEntry, relative_path: PathBuf, discovery_seq: u64) -> Self {
        Self {
            identity: entry.content_hash.clone(),
            source_path: entry.source_path.clone(),
            relative_path,
            size_bytes: entry.size,
            modified_time: entry.modified_time,
            discovery_seq,
            content_class: ContentClass::Unknown,
            metadata: None,
            signals: None,
            confidence: Confidence::Unscored,
            reasoning: String::new(),
            proposed_target_path: None,
            planned_target_path: None,
            final_target_path: None,
            phase_state: Phase::Discovered,
            retry_count: 0,
            errors: Vec::new(),
            source_hash: entry.content_hash.clone(),
            target_hash: None,
            simulated: false,
            conflict: None,
            updated_at: Utc::now(),
        }
    }

    /// Move to `next`, refusing illegal transitions.
    pub fn transition(&mut self, next: Phase) -> Result<()> {
        if !self.phase_state.can_transition_to(next) {
            return Err(ShelfError::InvalidTransition {
                identity: self.identity.clone(),
                from: self.phase_state.to_string(),
                to: next.to_string(),
            });
        }
        self.phase_state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Append an error without changing phase.
    pub fn push_error(&mut self, error: ItemError) {
        self.errors.push(error);
        self.updated_at = Utc::now();
    }

    /// Record a failed attempt: append the error, bump the retry counter for
    /// transient failures, and move to FAILED.
    pub fn record_failure(&mut self, error: ItemError) -> Result<()> {
        if error.class == FailureClass::Transient {
            self.retry_count += 1;
        }
        self.errors.push(error);
        self.transition(Phase::Failed)
    }

    pub fn last_error(&self) -> Option<&ItemError> {
        self.errors.last()
    }

    /// A FAILED item whose last failure was transient and that still has
    /// retry budget left.
    pub fn can_retry(&self, max_retries: u32) -> bool {
        self.phase_state == Phase::Failed
            && self.retry_count < max_retries
            && self
                .last_error()
                .map(|e| e.class == FailureClass::Transient)
                .unwrap_or(false)
    }

    /// FAILED -> MAPPED for another attempt.
    pub fn revert_for_retry(&mut self, max_retries: u32) -> Result<()> {
        if !self.can_retry(max_retries) {
            return Err(ShelfError::InvalidTransition {
                identity: self.identity.clone(),
                from: self.phase_state.to_string(),
                to: Phase::Mapped.to_string(),
            });
        }
        self.transition(Phase::Mapped)
    }

    pub fn is_terminal(&self) -> bool {
        self.phase_state.is_terminal()
    }

    /// Lowercased file extension of the source, with a leading dot.
    pub fn source_extension(&self) -> String {
        self.source_path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ItemRecord {
        let entry = ScanEntry {
            source_path: PathBuf::from("/src/batman_001.cbz"),
            content_hash: "abc123".into(),
            size: 42,
            modified_time: None,
        };
        ItemRecord::discovered(&entry, PathBuf::from("batman_001.cbz"), 1)
    }

    #[test]
    fn test_forward_transitions() {
        let mut rec = record();
        rec.transition(Phase::Enriched).unwrap();
        rec.transition(Phase::Mapped).unwrap();
        rec.transition(Phase::ConflictPending).unwrap();
        rec.transition(Phase::Mapped).unwrap();
        rec.transition(Phase::Migrated).unwrap();
        assert!(rec.is_terminal());
    }

    #[test]
    fn test_backward_transition_rejected() {
        let mut rec = record();
        rec.transition(Phase::Mapped).unwrap();
        let err = rec.transition(Phase::Enriched).unwrap_err();
        assert!(matches!(err, ShelfError::InvalidTransition { .. }));

        rec.transition(Phase::Migrated).unwrap();
        assert!(rec.transition(Phase::Mapped).is_err());
        assert!(rec.transition(Phase::Failed).is_err());
    }

    #[test]
    fn test_retry_reversion_requires_transient_and_budget() {
        let mut rec = record();
        rec.transition(Phase::Mapped).unwrap();

        rec.record_failure(ItemError::new(FailureClass::Transient, "timeout"))
            .unwrap();
        assert_eq!(rec.retry_count, 1);
        assert!(rec.can_retry(2));
        rec.revert_for_retry(2).unwrap();
        assert_eq!(rec.phase_state, Phase::Mapped);

        rec.record_failure(ItemError::new(FailureClass::Transient, "timeout"))
            .unwrap();
        assert_eq!(rec.retry_count, 2);
        assert!(!rec.can_retry(2));
        assert!(rec.revert_for_retry(2).is_err());
    }

    #[test]
    fn test_integrity_failure_not_retryable() {
        let mut rec = record();
        rec.transition(Phase::Mapped).unwrap();
        rec.record_failure(ItemError::new(FailureClass::Integrity, "hash mismatch"))
            .unwrap();
        assert_eq!(rec.retry_count, 0);
        assert!(!rec.can_retry(5));
    }

    #[test]
    fn test_confidence_downgrade() {
        assert_eq!(Confidence::High.downgraded(), Confidence::Medium);
        assert_eq!(Confidence::Low.downgraded(), Confidence::Low);
        assert!(Confidence::High.rank() > Confidence::Medium.rank());
    }

    #[test]
    fn test_phase_serializes_upper_snake() {
        let json = serde_json::to_string(&Phase::ConflictPending).unwrap();
        assert_eq!(json, "\"CONFLICT_PENDING\"");
    }

    #[test]
    fn test_source_extension_lowercased() {
        let mut rec = record();
        rec.source_path = PathBuf::from("/src/X.CBZ");
        assert_eq!(rec.source_extension(), ".cbz");
    }
}
