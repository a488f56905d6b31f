//! Default scan collaborator: walk a source tree and hash every comic file.

use crate::error::{Result, ShelfError};
use crate::hashing::sha256_file;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// One discovered source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanEntry {
    pub source_path: PathBuf,
    /// SHA-256 hex of the content
    pub content_hash: String,
    pub size: u64,
    pub modified_time: Option<DateTime<Utc>>,
}

impl ScanEntry {
    /// Hash and stat a single file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path).map_err(|e| ShelfError::io_with_path(e, path))?;
        let content_hash = sha256_file(path)?;
        Ok(Self {
            source_path: path.to_path_buf(),
            content_hash,
            size: metadata.len(),
            modified_time: metadata.modified().ok().map(DateTime::<Utc>::from),
        })
    }
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy();
            extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext))
        })
        .unwrap_or(false)
}

/// Recursively scan `root` for files with one of `extensions` (no dot,
/// case-insensitive).
///
/// Entries come back in sorted path order so discovery order is stable
/// between runs. Unreadable entries are logged and skipped; an unreadable root
/// is an environment error.
pub fn scan_source(root: impl AsRef<Path>, extensions: &[&str]) -> Result<Vec<ScanEntry>> {
    let root = root.as_ref();
    if !root.is_dir() {
        return Err(ShelfError::Environment {
            check: "source_root".into(),
            message: format!("{} is not a readable directory", root.display()),
        });
    }

    let mut entries = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                continue;
            }
        };
        if !entry.file_type().is_file() || !has_extension(entry.path(), extensions) {
            continue;
        }
        match ScanEntry::from_path(entry.path()) {
            Ok(scanned) => {
                debug!("Scanned {}", scanned.source_path.display());
                entries.push(scanned);
            }
            Err(e) => warn!("Failed to scan {}: {}", entry.path().display(), e),
        }
    }

    info!("Scanned {} files under {}", entries.len(), root.display());
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Defaults;
    use tempfile::TempDir;

    #[test]
    fn test_scan_filters_and_sorts() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("b")).unwrap();
        std::fs::write(temp.path().join("b/two.CBZ"), b"two").unwrap();
        std::fs::write(temp.path().join("a.cbr"), b"one").unwrap();
        std::fs::write(temp.path().join("notes.txt"), b"skip").unwrap();

        let entries = scan_source(temp.path(), &Defaults::COMIC_EXTENSIONS).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].source_path.ends_with("a.cbr"));
        assert!(entries[1].source_path.ends_with("b/two.CBZ"));
        assert_eq!(entries[0].size, 3);
        assert_eq!(entries[0].content_hash.len(), 64);
    }

    #[test]
    fn test_scan_missing_root_is_environment_error() {
        let err = scan_source("/no/such/root", &["cbz"]).unwrap_err();
        assert!(matches!(err, ShelfError::Environment { .. }));
    }
}
