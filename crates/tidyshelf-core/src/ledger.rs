//! Durable, append-only ledger of item records.
//!
//! The on-disk form is JSON Lines, one full record snapshot per line:
//!
//! ```text
//! {"version":1,"written_at":"2026-01-01T00:00:00Z","record":{...}}
//! ```
//!
//! On open the log is replayed into an in-memory index and the last line per
//! identity wins. Writes go through a single writer lock and hit the file
//! before the in-memory view changes, so a crash can lose at most the line
//! being written. A torn trailing line is discarded and truncated away.

use crate::atomic::atomic_write_bytes;
use crate::error::{Result, ShelfError};
use crate::models::{Confidence, ItemError, ItemRecord, Phase};
use crate::scan::ScanEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Current persistence line version.
pub const LEDGER_VERSION: u32 = 1;

#[derive(Serialize)]
struct LineOut<'a> {
    version: u32,
    written_at: DateTime<Utc>,
    record: &'a ItemRecord,
}

#[derive(Deserialize)]
struct LineIn {
    version: u32,
    #[allow(dead_code)]
    written_at: DateTime<Utc>,
    record: ItemRecord,
}

fn encode_line(record: &ItemRecord) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(&LineOut {
        version: LEDGER_VERSION,
        written_at: Utc::now(),
        record,
    })?;
    line.push(b'\n');
    Ok(line)
}

#[derive(Debug, Default)]
struct LedgerView {
    records: HashMap<String, ItemRecord>,
    /// Identities in discovery order
    order: Vec<String>,
    next_seq: u64,
}

impl LedgerView {
    fn apply(&mut self, record: ItemRecord) {
        self.next_seq = self.next_seq.max(record.discovery_seq + 1);
        if !self.records.contains_key(&record.identity) {
            self.order.push(record.identity.clone());
        }
        self.records.insert(record.identity.clone(), record);
    }

    fn ordered(&self) -> impl Iterator<Item = &ItemRecord> {
        self.order.iter().filter_map(|id| self.records.get(id))
    }

    fn sort_order(&mut self) {
        let records = &self.records;
        self.order.sort_by_key(|id| {
            records
                .get(id)
                .map(|r| r.discovery_seq)
                .unwrap_or(u64::MAX)
        });
    }
}

/// A second path whose content matches an already-known item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateEntry {
    pub path: PathBuf,
    pub identity: String,
    pub original_path: PathBuf,
}

/// Outcome of seeding the ledger from a scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryReport {
    /// Identities that got a fresh DISCOVERED record
    pub new: Vec<String>,
    /// Entries already present at the same path
    pub unchanged: usize,
    pub duplicates: Vec<DuplicateEntry>,
}

/// Result of a compaction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub lines_before: usize,
    pub records_kept: usize,
    pub records_dropped: usize,
}

/// Ledger store backed by a JSON Lines file.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    writer: Mutex<File>,
    view: RwLock<LedgerView>,
    lines: Mutex<usize>,
    skipped_lines: usize,
}

impl Ledger {
    /// Open (or create) the ledger at `path` and replay it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| ledger_io(&path, "create directory", e))?;
            }
        }

        let mut view = LedgerView::default();
        let mut line_count = 0usize;
        let mut skipped_lines = 0usize;

        if path.exists() {
            let bytes = fs::read(&path).map_err(|e| ledger_io(&path, "read", e))?;
            let complete_len = bytes
                .iter()
                .rposition(|b| *b == b'\n')
                .map(|i| i + 1)
                .unwrap_or(0);

            if complete_len < bytes.len() {
                warn!(
                    "Discarding {} bytes of incomplete trailing record in {}",
                    bytes.len() - complete_len,
                    path.display()
                );
                let file = OpenOptions::new()
                    .write(true)
                    .open(&path)
                    .map_err(|e| ledger_io(&path, "open for repair", e))?;
                file.set_len(complete_len as u64)
                    .map_err(|e| ledger_io(&path, "truncate", e))?;
                file.sync_all().map_err(|e| ledger_io(&path, "sync", e))?;
            }

            for (index, raw) in bytes[..complete_len].split(|b| *b == b'\n').enumerate() {
                if raw.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                match serde_json::from_slice::<LineIn>(raw) {
                    Ok(line) if line.version == LEDGER_VERSION => {
                        line_count += 1;
                        view.apply(line.record);
                    }
                    Ok(line) => {
                        warn!(
                            "Skipping ledger line {} with unsupported version {}",
                            index + 1,
                            line.version
                        );
                        skipped_lines += 1;
                    }
                    Err(e) => {
                        warn!("Skipping malformed ledger line {}: {}", index + 1, e);
                        skipped_lines += 1;
                    }
                }
            }
            view.sort_order();
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| ledger_io(&path, "open", e))?;

        info!(
            "Opened ledger {} ({} items, {} lines)",
            path.display(),
            view.records.len(),
            line_count
        );

        Ok(Self {
            path,
            writer: Mutex::new(file),
            view: RwLock::new(view),
            lines: Mutex::new(line_count),
            skipped_lines,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of malformed lines skipped during replay.
    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }

    /// Number of distinct items.
    pub fn len(&self) -> usize {
        self.read_view().map(|v| v.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All records in discovery order.
    pub fn load(&self) -> Result<Vec<ItemRecord>> {
        Ok(self.read_view()?.ordered().cloned().collect())
    }

    pub fn get(&self, identity: &str) -> Result<Option<ItemRecord>> {
        Ok(self.read_view()?.records.get(identity).cloned())
    }

    /// Records in one phase, discovery order.
    pub fn items_in_phase(&self, phase: Phase) -> Result<Vec<ItemRecord>> {
        self.filter(Some(phase), None)
    }

    /// Records matching an optional phase and an optional confidence.
    pub fn filter(
        &self,
        phase: Option<Phase>,
        confidence: Option<Confidence>,
    ) -> Result<Vec<ItemRecord>> {
        Ok(self
            .read_view()?
            .ordered()
            .filter(|r| phase.map_or(true, |p| r.phase_state == p))
            .filter(|r| confidence.map_or(true, |c| r.confidence == c))
            .cloned()
            .collect())
    }

    /// Non-terminal records plus FAILED records still eligible for a
    /// transient retry.
    pub fn pending(&self, max_retries: u32) -> Result<Vec<ItemRecord>> {
        Ok(self
            .read_view()?
            .ordered()
            .filter(|r| !r.is_terminal() || r.can_retry(max_retries))
            .cloned()
            .collect())
    }

    /// Any record whose terminal phase came from a dry run.
    pub fn has_simulated(&self) -> Result<bool> {
        Ok(self.read_view()?.records.values().any(|r| r.simulated))
    }

    /// Persist a full record snapshot.
    ///
    /// Rejects phase transitions the state machine does not allow relative to
    /// the currently stored record.
    pub fn upsert(&self, record: &ItemRecord) -> Result<()> {
        let line = encode_line(record)?;
        {
            let mut writer = self.lock_writer()?;
            if let Some(existing) = self.read_view()?.records.get(&record.identity) {
                if !existing.phase_state.can_transition_to(record.phase_state) {
                    return Err(ShelfError::InvalidTransition {
                        identity: record.identity.clone(),
                        from: existing.phase_state.to_string(),
                        to: record.phase_state.to_string(),
                    });
                }
            }
            writer
                .write_all(&line)
                .map_err(|e| ledger_io(&self.path, "append", e))?;
            self.write_view()?.apply(record.clone());
            if let Ok(mut lines) = self.lines.lock() {
                *lines += 1;
            }
        }

        debug!(
            "Ledger upsert {} -> {}",
            short_id(&record.identity),
            record.phase_state
        );
        Ok(())
    }

    /// Append an error to a stored record without changing its phase.
    pub fn append_error(&self, identity: &str, error: ItemError) -> Result<ItemRecord> {
        let mut record = self
            .get(identity)?
            .ok_or_else(|| ShelfError::UnknownItem {
                identity: identity.to_string(),
            })?;
        record.push_error(error);
        self.upsert(&record)?;
        Ok(record)
    }

    /// Seed DISCOVERED records for scan entries. Idempotent.
    ///
    /// An entry whose identity is already known at the same path is left
    /// alone. The same content at a second path is reported as a duplicate and
    /// gets no record.
    pub fn discover(&self, source_root: &Path, entries: &[ScanEntry]) -> Result<DiscoveryReport> {
        let mut report = DiscoveryReport::default();
        let mut seen_this_scan: HashMap<String, PathBuf> = HashMap::new();

        for entry in entries {
            let known = self
                .get(&entry.content_hash)?
                .map(|r| r.source_path)
                .or_else(|| seen_this_scan.get(&entry.content_hash).cloned());

            match known {
                Some(original) if original == entry.source_path => report.unchanged += 1,
                Some(original) => {
                    debug!(
                        "Duplicate content {} also at {}",
                        entry.source_path.display(),
                        original.display()
                    );
                    report.duplicates.push(DuplicateEntry {
                        path: entry.source_path.clone(),
                        identity: entry.content_hash.clone(),
                        original_path: original,
                    });
                }
                None => {
                    let relative = entry
                        .source_path
                        .strip_prefix(source_root)
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|_| {
                            entry
                                .source_path
                                .file_name()
                                .map(PathBuf::from)
                                .unwrap_or_default()
                        });
                    let seq = self.read_view()?.next_seq;
                    let record = ItemRecord::discovered(entry, relative, seq);
                    self.upsert(&record)?;
                    seen_this_scan.insert(entry.content_hash.clone(), entry.source_path.clone());
                    report.new.push(record.identity);
                }
            }
        }

        info!(
            "Discovery: {} new, {} unchanged, {} duplicates",
            report.new.len(),
            report.unchanged,
            report.duplicates.len()
        );
        Ok(report)
    }

    /// fsync the log.
    pub fn flush(&self) -> Result<()> {
        let writer = self.lock_writer()?;
        writer
            .sync_data()
            .map_err(|e| ledger_io(&self.path, "sync", e))
    }

    /// Rewrite the log with one line per retained record.
    ///
    /// Records for which `retain` returns false are removed from the ledger.
    pub fn compact(&self, retain: impl Fn(&ItemRecord) -> bool) -> Result<CompactionStats> {
        let mut writer = self.lock_writer()?;
        let mut view = self.write_view()?;
        let lines_before = self.lines.lock().map(|l| *l).unwrap_or(0);

        let mut buffer = Vec::new();
        let mut kept: HashSet<String> = HashSet::new();
        for record in view.ordered() {
            if retain(record) {
                buffer.extend_from_slice(&encode_line(record)?);
                kept.insert(record.identity.clone());
            }
        }

        atomic_write_bytes(&self.path, &buffer)?;
        *writer = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| ledger_io(&self.path, "reopen", e))?;

        let dropped = view.records.len() - kept.len();
        view.records.retain(|id, _| kept.contains(id));
        view.order.retain(|id| kept.contains(id));
        if let Ok(mut lines) = self.lines.lock() {
            *lines = kept.len();
        }

        info!(
            "Compacted {}: {} lines -> {} records ({} dropped)",
            self.path.display(),
            lines_before,
            kept.len(),
            dropped
        );
        Ok(CompactionStats {
            lines_before,
            records_kept: kept.len(),
            records_dropped: dropped,
        })
    }

    fn read_view(&self) -> Result<std::sync::RwLockReadGuard<'_, LedgerView>> {
        self.view.read().map_err(|_| ShelfError::Ledger {
            path: self.path.clone(),
            message: "Failed to acquire read lock".to_string(),
        })
    }

    fn write_view(&self) -> Result<std::sync::RwLockWriteGuard<'_, LedgerView>> {
        self.view.write().map_err(|_| ShelfError::Ledger {
            path: self.path.clone(),
            message: "Failed to acquire write lock".to_string(),
        })
    }

    fn lock_writer(&self) -> Result<std::sync::MutexGuard<'_, File>> {
        self.writer.lock().map_err(|_| ShelfError::Ledger {
            path: self.path.clone(),
            message: "Failed to acquire writer lock".to_string(),
        })
    }
}

fn ledger_io(path: &Path, action: &str, err: std::io::Error) -> ShelfError {
    ShelfError::Ledger {
        path: path.to_path_buf(),
        message: format!("Failed to {}: {}", action, err),
    }
}

/// First 12 hex chars of an identity, for logs.
pub fn short_id(identity: &str) -> &str {
    &identity[..identity.len().min(12)]
}
