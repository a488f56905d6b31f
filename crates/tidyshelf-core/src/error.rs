//! Error types for tidyshelf.
//!
//! Every fallible operation in the engine returns [`ShelfError`]. Per-item
//! failures are additionally sorted into a [`FailureClass`] so the coordinator
//! can decide between retrying, downgrading, surfacing, or aborting.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the tidyshelf engine.
#[derive(Debug, Error)]
pub enum ShelfError {
    // Upstream collaborator errors
    #[error("Metadata provider {provider} failed: {message}")]
    Provider { provider: String, message: String },

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Rate limited by {service}, retry after {retry_after_secs:?} seconds")]
    RateLimited {
        service: String,
        retry_after_secs: Option<u64>,
    },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Archive error at {path}: {message}")]
    Archive { path: PathBuf, message: String },

    // Integrity errors
    #[error("Hash mismatch at {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Source changed since discovery: {path} (expected {expected}, got {actual})")]
    SourceChanged {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    // Conflicts
    #[error("Target already exists with different content: {0}")]
    TargetConflict(PathBuf),

    // Path resolution errors
    #[error("Cannot resolve target path: missing required field `{field}`")]
    MissingField { field: String },

    #[error("Cannot resolve target path for content class {0}")]
    UnsupportedClass(String),

    #[error("Item has no proposed target path: {identity}")]
    Unmapped { identity: String },

    // Ledger errors
    #[error("Ledger error at {path}: {message}")]
    Ledger { path: PathBuf, message: String },

    #[error("Unknown ledger item: {identity}")]
    UnknownItem { identity: String },

    #[error("Illegal phase transition for {identity}: {from} -> {to}")]
    InvalidTransition {
        identity: String,
        from: String,
        to: String,
    },

    // Environment errors
    #[error("Preflight check `{check}` failed: {message}")]
    Environment { check: String, message: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for tidyshelf operations.
pub type Result<T> = std::result::Result<T, ShelfError>;

impl From<std::io::Error> for ShelfError {
    fn from(err: std::io::Error) -> Self {
        ShelfError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ShelfError {
    fn from(err: serde_json::Error) -> Self {
        ShelfError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl ShelfError {
    /// Create an IO error with path context.
    ///
    /// `NotFound` and `PermissionDenied` are mapped onto their dedicated
    /// variants so callers can match on them without digging into the source.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match err.kind() {
            ErrorKind::NotFound => ShelfError::FileNotFound(path),
            ErrorKind::PermissionDenied => ShelfError::PermissionDenied(path),
            _ => ShelfError::Io {
                message: err.to_string(),
                path: Some(path),
                source: Some(err),
            },
        }
    }

    /// Check if this error should trigger a retry under the default policy.
    pub fn is_retryable(&self) -> bool {
        DefaultClassifier::default().classify(self) == FailureClass::Transient
    }

    /// Errors that abort a whole run rather than a single item.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ShelfError::Ledger { .. } | ShelfError::Environment { .. } | ShelfError::Config { .. }
        )
    }
}

/// Failure taxonomy used for retry and reporting decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Network timeout, rate limit, temporary lock. Retried with a bound.
    Transient,
    /// Ambiguous or missing metadata, parse failure. Resolved by downgrade.
    PersistentData,
    /// Post-copy hash mismatch or corrupted input. Never retried.
    Integrity,
    /// Two items (or an item and an existing file) want the same target.
    Conflict,
    /// Ledger unwritable, source root unreadable. Aborts the run.
    Fatal,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Transient => "transient",
            FailureClass::PersistentData => "persistent_data",
            FailureClass::Integrity => "integrity",
            FailureClass::Conflict => "conflict",
            FailureClass::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Maps errors onto the failure taxonomy.
///
/// The transient/persistent boundary is a judgment call, so it is injectable:
/// the coordinator and executor only ever ask a classifier.
pub trait FailureClassifier: Send + Sync + std::fmt::Debug {
    fn classify(&self, err: &ShelfError) -> FailureClass;
}

/// Default classification: upstream timeouts, rate limits, provider outages and
/// a configurable set of I/O error kinds are transient.
#[derive(Debug, Clone)]
pub struct DefaultClassifier {
    transient_io_kinds: HashSet<ErrorKind>,
}

impl Default for DefaultClassifier {
    fn default() -> Self {
        Self {
            transient_io_kinds: [
                ErrorKind::TimedOut,
                ErrorKind::Interrupted,
                ErrorKind::WouldBlock,
                ErrorKind::ConnectionReset,
                ErrorKind::ConnectionAborted,
            ]
            .into_iter()
            .collect(),
        }
    }
}

impl DefaultClassifier {
    /// Treat an additional I/O error kind as transient.
    pub fn with_transient_io_kind(mut self, kind: ErrorKind) -> Self {
        self.transient_io_kinds.insert(kind);
        self
    }

    /// Stop treating an I/O error kind as transient.
    pub fn without_transient_io_kind(mut self, kind: ErrorKind) -> Self {
        self.transient_io_kinds.remove(&kind);
        self
    }
}

impl FailureClassifier for DefaultClassifier {
    fn classify(&self, err: &ShelfError) -> FailureClass {
        match err {
            ShelfError::Provider { .. }
            | ShelfError::Timeout(_)
            | ShelfError::RateLimited { .. } => FailureClass::Transient,

            ShelfError::Io { source, .. } => match source {
                Some(io) if self.transient_io_kinds.contains(&io.kind()) => FailureClass::Transient,
                _ => FailureClass::PersistentData,
            },

            ShelfError::HashMismatch { .. } => FailureClass::Integrity,

            ShelfError::TargetConflict(_) => FailureClass::Conflict,

            ShelfError::Ledger { .. }
            | ShelfError::Environment { .. }
            | ShelfError::Config { .. } => FailureClass::Fatal,

            // Missing sources, permissions, changed content, unresolvable
            // metadata and everything else are settled by data, not time.
            _ => FailureClass::PersistentData,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ShelfError::MissingField {
            field: "series".into(),
        };
        assert_eq!(
            err.to_string(),
            "Cannot resolve target path: missing required field `series`"
        );
    }

    #[test]
    fn test_io_with_path_maps_kinds() {
        let err = ShelfError::io_with_path(
            std::io::Error::new(ErrorKind::NotFound, "gone"),
            "/src/a.cbz",
        );
        assert!(matches!(err, ShelfError::FileNotFound(_)));

        let err = ShelfError::io_with_path(
            std::io::Error::new(ErrorKind::PermissionDenied, "nope"),
            "/src/a.cbz",
        );
        assert!(matches!(err, ShelfError::PermissionDenied(_)));
    }

    #[test]
    fn test_default_classification() {
        let classifier = DefaultClassifier::default();
        assert_eq!(
            classifier.classify(&ShelfError::Timeout(std::time::Duration::from_secs(5))),
            FailureClass::Transient
        );
        assert_eq!(
            classifier.classify(&ShelfError::HashMismatch {
                path: "/t/a.cbz".into(),
                expected: "aa".into(),
                actual: "bb".into(),
            }),
            FailureClass::Integrity
        );
        assert_eq!(
            classifier.classify(&ShelfError::PermissionDenied("/t".into())),
            FailureClass::PersistentData
        );
        assert_eq!(
            classifier.classify(&ShelfError::TargetConflict("/t/a.cbz".into())),
            FailureClass::Conflict
        );
    }

    #[test]
    fn test_transient_io_kinds_are_configurable() {
        let err = ShelfError::from(std::io::Error::new(ErrorKind::TimedOut, "slow disk"));
        assert_eq!(
            DefaultClassifier::default().classify(&err),
            FailureClass::Transient
        );

        let strict = DefaultClassifier::default().without_transient_io_kind(ErrorKind::TimedOut);
        assert_eq!(strict.classify(&err), FailureClass::PersistentData);

        let busy = std::io::Error::new(ErrorKind::AddrInUse, "locked");
        let lenient = DefaultClassifier::default().with_transient_io_kind(ErrorKind::AddrInUse);
        assert_eq!(
            lenient.classify(&ShelfError::from(busy)),
            FailureClass::Transient
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(ShelfError::Timeout(std::time::Duration::from_secs(5)).is_retryable());
        assert!(!ShelfError::MissingField {
            field: "series".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(ShelfError::Environment {
            check: "source_root".into(),
            message: "unreadable".into()
        }
        .is_fatal());
        assert!(!ShelfError::TargetConflict("/t".into()).is_fatal());
    }
}
