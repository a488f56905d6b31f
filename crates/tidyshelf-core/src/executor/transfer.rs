//! Byte transfer between a source file and its partial sibling.

use crate::error::{Result, ShelfError};
use std::fs::{self, File};
use std::path::Path;

/// Copies source bytes to a staging path next to the destination.
///
/// Implementations run on the blocking pool and must leave the staging file
/// complete (or absent) when they return. Verification and the final rename
/// are the executor's job.
pub trait FileTransfer: Send + Sync + std::fmt::Debug {
    /// Copy `source` to `partial`, returning the number of bytes written.
    fn copy(&self, source: &Path, partial: &Path) -> Result<u64>;
}

/// Local filesystem copy preserving permissions and modification time.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTransfer;

impl FileTransfer for LocalTransfer {
    fn copy(&self, source: &Path, partial: &Path) -> Result<u64> {
        // fs::copy carries permission bits over
        let bytes = fs::copy(source, partial).map_err(|e| ShelfError::io_with_path(e, source))?;

        let modified = fs::metadata(source)
            .and_then(|m| m.modified())
            .map_err(|e| ShelfError::io_with_path(e, source))?;
        let file = File::options()
            .write(true)
            .open(partial)
            .map_err(|e| ShelfError::io_with_path(e, partial))?;
        file.set_modified(modified)
            .map_err(|e| ShelfError::io_with_path(e, partial))?;
        file.sync_all()
            .map_err(|e| ShelfError::io_with_path(e, partial))?;

        Ok(bytes)
    }
}
