//! Run configuration for the migration engine.
//!
//! Constants live on [`Defaults`]; a run is described by a [`MigrationConfig`]
//! value passed explicitly to the coordinator. Nothing here reads environment
//! variables or global state.

use crate::error::{Result, ShelfError};
use crate::models::ContentClass;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Engine-wide defaults.
pub struct Defaults;

impl Defaults {
    pub const BATCH_SIZE: usize = 100;
    pub const EVALUATION_CONCURRENCY: usize = 5;
    pub const EXECUTION_CONCURRENCY: usize = 2;
    pub const MAX_RETRIES: u32 = 3;

    pub const HIGH_THRESHOLD: f64 = 0.9;
    pub const MEDIUM_THRESHOLD: f64 = 0.7;

    pub const WESTERN_DIR_NAME: &'static str = "Comics";
    pub const MANGA_DIR_NAME: &'static str = "Manga";
    pub const HENTAI_DIR_NAME: &'static str = "Hentai";
    pub const QUARANTINE_DIR_NAME: &'static str = "_unsorted";
    pub const BEST_GUESS_DIR_NAME: &'static str = "_best_guess";

    pub const LEDGER_FILE_NAME: &'static str = "ledger.jsonl";
    pub const DRY_RUN_LEDGER_FILE_NAME: &'static str = "ledger.dry-run.jsonl";
    pub const PARTIAL_SUFFIX: &'static str = "tidyshelf-partial";

    /// File extensions picked up by the default scanner.
    pub const COMIC_EXTENSIONS: [&'static str; 5] = ["cbz", "cbr", "cb7", "pdf", "epub"];
}

/// Whether the run writes files or only records what it would do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    DryRun,
    Apply,
}

impl RunMode {
    pub fn is_apply(&self) -> bool {
        matches!(self, RunMode::Apply)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::DryRun => "dry_run",
            RunMode::Apply => "apply",
        }
    }
}

/// Target roots for each content class and the two holding areas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryLayout {
    pub western_root: PathBuf,
    pub manga_root: PathBuf,
    pub hentai_root: PathBuf,
    pub quarantine_root: PathBuf,
    pub best_guess_root: PathBuf,
}

impl LibraryLayout {
    /// Standard layout with every root directly under `target`.
    pub fn under(target: impl AsRef<Path>) -> Self {
        let target = target.as_ref();
        Self {
            western_root: target.join(Defaults::WESTERN_DIR_NAME),
            manga_root: target.join(Defaults::MANGA_DIR_NAME),
            hentai_root: target.join(Defaults::HENTAI_DIR_NAME),
            quarantine_root: target.join(Defaults::QUARANTINE_DIR_NAME),
            best_guess_root: target.join(Defaults::BEST_GUESS_DIR_NAME),
        }
    }

    /// Root for a resolvable content class. UNKNOWN has none.
    pub fn class_root(&self, class: ContentClass) -> Option<&Path> {
        match class {
            ContentClass::Western => Some(&self.western_root),
            ContentClass::Manga => Some(&self.manga_root),
            ContentClass::Hentai => Some(&self.hentai_root),
            ContentClass::Unknown => None,
        }
    }

    pub fn roots(&self) -> [&Path; 5] {
        [
            &self.western_root,
            &self.manga_root,
            &self.hentai_root,
            &self.quarantine_root,
            &self.best_guess_root,
        ]
    }
}

/// Confidence thresholds for fuzzy scores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub high: f64,
    pub medium: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            high: Defaults::HIGH_THRESHOLD,
            medium: Defaults::MEDIUM_THRESHOLD,
        }
    }
}

/// Worker ceilings for the two pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concurrency {
    /// Enrichment, evaluation and resolution (network bound)
    pub evaluation: usize,
    /// File copies (disk bound)
    pub execution: usize,
}

impl Default for Concurrency {
    fn default() -> Self {
        Self {
            evaluation: Defaults::EVALUATION_CONCURRENCY,
            execution: Defaults::EXECUTION_CONCURRENCY,
        }
    }
}

/// Everything a migration run needs to know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationConfig {
    #[serde(default)]
    pub mode: RunMode,
    pub source_root: PathBuf,
    pub layout: LibraryLayout,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub concurrency: Concurrency,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Send MEDIUM items to the best-guess subtree instead of the class root
    #[serde(default)]
    pub best_guess_separate_folder: bool,
    #[serde(default)]
    pub thresholds: Thresholds,
    /// Extra free space required on the target beyond the pending bytes
    #[serde(default)]
    pub min_free_space_bytes: u64,
}

fn default_max_retries() -> u32 {
    Defaults::MAX_RETRIES
}

fn default_batch_size() -> usize {
    Defaults::BATCH_SIZE
}

impl MigrationConfig {
    /// Dry-run config with default settings and the standard layout.
    pub fn new(source_root: impl Into<PathBuf>, target_root: impl AsRef<Path>) -> Self {
        Self {
            mode: RunMode::DryRun,
            source_root: source_root.into(),
            layout: LibraryLayout::under(target_root),
            max_retries: Defaults::MAX_RETRIES,
            concurrency: Concurrency::default(),
            batch_size: Defaults::BATCH_SIZE,
            best_guess_separate_folder: false,
            thresholds: Thresholds::default(),
            min_free_space_bytes: 0,
        }
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_concurrency(mut self, evaluation: usize, execution: usize) -> Self {
        self.concurrency = Concurrency {
            evaluation,
            execution,
        };
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_best_guess_folder(mut self, enabled: bool) -> Self {
        self.best_guess_separate_folder = enabled;
        self
    }

    pub fn with_thresholds(mut self, high: f64, medium: f64) -> Self {
        self.thresholds = Thresholds { high, medium };
        self
    }

    pub fn with_layout(mut self, layout: LibraryLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_min_free_space(mut self, bytes: u64) -> Self {
        self.min_free_space_bytes = bytes;
        self
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be at least 1"));
        }
        if self.concurrency.evaluation == 0 {
            return Err(invalid("concurrency.evaluation", "must be at least 1"));
        }
        if self.concurrency.execution == 0 {
            return Err(invalid("concurrency.execution", "must be at least 1"));
        }
        let Thresholds { high, medium } = self.thresholds;
        if !(0.0..=1.0).contains(&high) || !(0.0..=1.0).contains(&medium) {
            return Err(invalid("thresholds", "must lie within 0.0..=1.0"));
        }
        if medium > high {
            return Err(invalid("thresholds", "medium must not exceed high"));
        }
        Ok(())
    }
}

fn invalid(field: &str, message: &str) -> ShelfError {
    ShelfError::Validation {
        field: field.to_string(),
        message: message.to_string(),
    }
}
