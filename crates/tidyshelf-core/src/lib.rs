//! Tidyshelf Core - ledger-backed, confidence-driven migration engine for
//! comic libraries.
//!
//! Items flow through scan, enrich, map, execute and validate. Every step is
//! recorded in an append-only [`Ledger`], so an interrupted run resumes where
//! it stopped and a finished run is a no-op when repeated.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tidyshelf_core::{
//!     scan_source, BatchCoordinator, Defaults, FilenameEnricher, Ledger, MigrationConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> tidyshelf_core::Result<()> {
//!     let config = MigrationConfig::new("/comics/incoming", "/comics/library");
//!     let ledger = Arc::new(Ledger::open("/comics/ledger.dry-run.jsonl")?);
//!
//!     let entries = scan_source(&config.source_root, &Defaults::COMIC_EXTENSIONS)?;
//!     ledger.discover(&config.source_root, &entries)?;
//!
//!     let coordinator = BatchCoordinator::new(config, ledger, Arc::new(FilenameEnricher));
//!     let summary = coordinator.run().await?;
//!     println!("{}", summary);
//!     Ok(())
//! }
//! ```

pub mod atomic;
pub mod cancel;
pub mod confidence;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod enrich;
pub mod error;
pub mod executor;
pub mod hashing;
pub mod ledger;
pub mod models;
pub mod report;
pub mod resolver;
pub mod safety;
pub mod scan;
pub mod verify;

// Re-export commonly used types
pub use cancel::CancellationToken;
pub use confidence::{evaluate, Assessment};
pub use config::{Defaults, LibraryLayout, MigrationConfig, RunMode, Thresholds};
pub use conflict::{detect, ConflictGroup, ConflictOutcome};
pub use coordinator::{BatchCoordinator, BatchProgress, RunStage, RunSummary};
pub use enrich::{
    ComicInfoEnricher, EnrichmentSource, FilenameEnricher, MetadataProvider, ProviderEnricher,
    StaticEnrichment,
};
pub use error::{DefaultClassifier, FailureClass, FailureClassifier, Result, ShelfError};
pub use executor::{Execution, ExecutionOutcome, FileTransfer, LocalTransfer, MigrationExecutor};
pub use ledger::{DiscoveryReport, Ledger};
pub use models::{
    ComicMetadata, Confidence, ConflictNote, ContentClass, Enrichment, ItemError, ItemRecord,
    MatchSignals, MatchType, Phase,
};
pub use report::MigrationReport;
pub use resolver::resolve;
pub use safety::{Preflight, SafetyReport};
pub use scan::{scan_source, ScanEntry};
pub use verify::{verify_library, VerificationReport};
