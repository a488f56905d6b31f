//! Streaming SHA-256 content hashing.
//!
//! Item identity is the SHA-256 of the file content, so the same routine hashes
//! sources at discovery, re-hashes them before a copy, and verifies the copy.

use crate::error::{Result, ShelfError};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Chunk size for reading files.
const CHUNK_SIZE: usize = 1024 * 1024;

/// Compute the SHA-256 of a file as lowercase hex.
pub fn sha256_file(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let mut file = std::fs::File::open(path).map_err(|e| ShelfError::io_with_path(e, path))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| ShelfError::io_with_path(e, path))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hash a file on the blocking pool.
pub async fn sha256_file_async(path: impl Into<PathBuf>) -> Result<String> {
    let path = path.into();
    tokio::task::spawn_blocking(move || sha256_file(&path))
        .await
        .map_err(|e| ShelfError::Other(format!("Hash computation task failed: {}", e)))?
}

/// Verify a file's SHA-256 matches `expected`.
pub fn verify_sha256(path: impl AsRef<Path>, expected: &str) -> Result<String> {
    let path = path.as_ref();
    let actual = sha256_file(path)?;
    let expected_lower = expected.to_lowercase();

    if actual == expected_lower {
        Ok(actual)
    } else {
        Err(ShelfError::HashMismatch {
            path: path.to_path_buf(),
            expected: expected_lower,
            actual,
        })
    }
}
