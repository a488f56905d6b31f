//! Destination routing by confidence tier.

use crate::config::LibraryLayout;
use crate::conflict::alt_path;
use crate::error::{Result, ShelfError};
use crate::models::{Confidence, ItemRecord};
use std::path::PathBuf;

/// Picks the absolute destination of an item.
///
/// * HIGH, and MEDIUM without the separate-folder option: class root + resolved path
/// * MEDIUM with the option: best-guess root + resolved path
/// * LOW (and anything unscored): quarantine root + original relative path
#[derive(Debug, Clone)]
pub struct Router {
    layout: LibraryLayout,
    best_guess_separate_folder: bool,
}

impl Router {
    pub fn new(layout: LibraryLayout, best_guess_separate_folder: bool) -> Self {
        Self {
            layout,
            best_guess_separate_folder,
        }
    }

    pub fn layout(&self) -> &LibraryLayout {
        &self.layout
    }

    /// Items at this tier go to quarantine regardless of their resolved path.
    pub fn is_quarantined(confidence: Confidence) -> bool {
        matches!(confidence, Confidence::Low | Confidence::Unscored)
    }

    /// Quarantine location before any conflict suffix: the source layout
    /// mirrored under the quarantine root.
    pub fn quarantine_path(&self, record: &ItemRecord) -> PathBuf {
        self.layout.quarantine_root.join(&record.relative_path)
    }

    pub fn destination(&self, record: &ItemRecord) -> Result<PathBuf> {
        if Self::is_quarantined(record.confidence) {
            let path = self.quarantine_path(record);
            return Ok(match record.conflict.as_ref().and_then(|note| note.suffix) {
                Some(n) => alt_path(&path, n),
                None => path,
            });
        }

        let relative = record
            .proposed_target_path
            .as_ref()
            .ok_or_else(|| ShelfError::Unmapped {
                identity: record.identity.clone(),
            })?;

        if record.confidence == Confidence::Medium && self.best_guess_separate_folder {
            return Ok(self.layout.best_guess_root.join(relative));
        }

        let root = self
            .layout
            .class_root(record.content_class)
            .ok_or_else(|| ShelfError::UnsupportedClass(record.content_class.to_string()))?;
        Ok(root.join(relative))
    }
}
