//! End-to-end tests for the migration pipeline.
//!
//! Each test builds a small source tree in a temp dir, discovers it into a
//! ledger and runs the batch coordinator against a target library.

use chrono::NaiveDate;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tidyshelf_core::enrich::RetryConfig;
use tidyshelf_core::{
    scan_source, BatchCoordinator, CancellationToken, ComicMetadata, Confidence, ContentClass,
    Defaults, Enrichment, FailureClass, FileTransfer, Ledger, LocalTransfer, MatchSignals,
    MatchType, MigrationConfig, MigrationExecutor, MigrationReport, Phase, RunMode, RunSummary,
    ShelfError, StaticEnrichment,
};
use walkdir::WalkDir;

struct Library {
    temp: TempDir,
    config: MigrationConfig,
}

impl Library {
    fn new(files: &[(&str, &[u8])]) -> Self {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let source = temp.path().join("incoming");
        fs::create_dir_all(&source).unwrap();
        for (name, bytes) in files {
            let path = source.join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, bytes).unwrap();
        }
        let config = MigrationConfig::new(&source, temp.path().join("library"))
            .with_mode(RunMode::Apply);
        Self { temp, config }
    }

    fn ledger(&self, name: &str) -> Arc<Ledger> {
        let ledger = Ledger::open(self.temp.path().join(name)).unwrap();
        let entries = scan_source(&self.config.source_root, &Defaults::COMIC_EXTENSIONS).unwrap();
        ledger.discover(&self.config.source_root, &entries).unwrap();
        Arc::new(ledger)
    }

    fn coordinator(&self, ledger: &Arc<Ledger>, enrichment: StaticEnrichment) -> BatchCoordinator {
        BatchCoordinator::new(self.config.clone(), ledger.clone(), Arc::new(enrichment))
            .with_available_space(u64::MAX)
            .with_backoff(RetryConfig::new().with_base_delay(Duration::from_millis(1)).with_jitter(false))
    }

    fn target(&self, relative: &str) -> PathBuf {
        self.temp.path().join("library").join(relative)
    }

    fn files_under(&self, relative: &str) -> Vec<PathBuf> {
        let root = self.target(relative);
        if !root.exists() {
            return Vec::new();
        }
        WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect()
    }
}

fn batman(issue: &str) -> Enrichment {
    Enrichment {
        content_class: Some(ContentClass::Western),
        metadata: ComicMetadata {
            provider: Some("catalog".into()),
            catalog_id: Some(format!("batman-{}", issue)),
            series: Some("Batman".into()),
            series_year: Some(1940),
            issue: Some(issue.into()),
            cover_date: NaiveDate::from_ymd_opt(1940, 4, 25),
            publisher: Some("DC".into()),
            ..Default::default()
        },
        signals: MatchSignals {
            match_type: MatchType::ExactId,
            catalog_id: Some(format!("batman-{}", issue)),
            candidate_count: 1,
            ..Default::default()
        },
    }
}

const BATMAN_001: &str = "Comics/DC/Batman (1940)/Batman (1940) #001 (1940-04-25).cbz";

#[tokio::test]
async fn test_batman_and_unknown_scenario() {
    let lib = Library::new(&[
        ("batman_001.cbz", b"batman issue one"),
        ("sub/unknown.cbz", b"no idea"),
    ]);
    let ledger = lib.ledger(Defaults::LEDGER_FILE_NAME);
    let table = StaticEnrichment::new().with("batman_001.cbz", batman("1"));

    let summary = lib.coordinator(&ledger, table).run().await.unwrap();
    assert_eq!(summary.phase_count(Phase::Migrated), 1);
    assert_eq!(summary.phase_count(Phase::Quarantined), 1);
    assert_eq!(summary.copies_performed, 2);
    assert!(!summary.interrupted);

    assert_eq!(fs::read(lib.target(BATMAN_001)).unwrap(), b"batman issue one");
    assert_eq!(fs::read(lib.target("_unsorted/sub/unknown.cbz")).unwrap(), b"no idea");

    // sources are copied, never moved
    assert!(lib.config.source_root.join("batman_001.cbz").exists());
    assert!(lib.config.source_root.join("sub/unknown.cbz").exists());

    let records = ledger.load().unwrap();
    let batman = &records[0];
    assert_eq!(batman.confidence, Confidence::High);
    assert_eq!(batman.final_target_path.as_deref(), Some(lib.target(BATMAN_001).as_path()));
    assert_eq!(batman.target_hash.as_deref(), Some(batman.identity.as_str()));

    let unknown = &records[1];
    assert_eq!(unknown.confidence, Confidence::Low);
    assert!(unknown.reasoning.contains("filename parse"));
}

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let lib = Library::new(&[
        ("batman_001.cbz", b"batman issue one"),
        ("sub/unknown.cbz", b"no idea"),
    ]);
    let ledger = lib.ledger(Defaults::LEDGER_FILE_NAME);
    let table = StaticEnrichment::new().with("batman_001.cbz", batman("1"));
    lib.coordinator(&ledger, table.clone()).run().await.unwrap();
    let before = ledger.load().unwrap();

    // rescanning finds nothing new
    let entries = scan_source(&lib.config.source_root, &Defaults::COMIC_EXTENSIONS).unwrap();
    let report = ledger.discover(&lib.config.source_root, &entries).unwrap();
    assert!(report.new.is_empty());
    assert_eq!(report.unchanged, 2);

    let summary = lib.coordinator(&ledger, table).run().await.unwrap();
    assert_eq!(summary.copies_performed, 0);
    assert_eq!(summary.items_processed, 0);

    let after = ledger.load().unwrap();
    for (a, b) in before.iter().zip(after.iter()) {
        assert_eq!(a.phase_state, b.phase_state);
        assert_eq!(a.final_target_path, b.final_target_path);
    }
}

#[tokio::test]
async fn test_existing_identical_target_is_skipped() {
    let lib = Library::new(&[("batman_001.cbz", b"batman issue one")]);
    let target = lib.target(BATMAN_001);
    fs::create_dir_all(target.parent().unwrap()).unwrap();
    fs::write(&target, b"batman issue one").unwrap();

    let ledger = lib.ledger(Defaults::LEDGER_FILE_NAME);
    let table = StaticEnrichment::new().with("batman_001.cbz", batman("1"));
    let summary = lib.coordinator(&ledger, table).run().await.unwrap();

    assert_eq!(summary.phase_count(Phase::Skipped), 1);
    assert_eq!(summary.copies_performed, 0);
    let record = &ledger.load().unwrap()[0];
    assert_eq!(record.final_target_path.as_deref(), Some(target.as_path()));
}

/// Cancels the run as soon as the first copy has been made.
#[derive(Debug)]
struct CancelAfterFirstCopy {
    token: CancellationToken,
}

impl FileTransfer for CancelAfterFirstCopy {
    fn copy(&self, source: &Path, partial: &Path) -> tidyshelf_core::Result<u64> {
        let bytes = LocalTransfer.copy(source, partial)?;
        self.token.cancel();
        Ok(bytes)
    }
}

#[tokio::test]
async fn test_resume_after_cancellation() {
    let lib = Library::new(&[
        ("batman_001.cbz", b"one"),
        ("batman_002.cbz", b"two"),
        ("batman_003.cbz", b"three"),
    ]);
    let ledger = lib.ledger(Defaults::LEDGER_FILE_NAME);
    let table = StaticEnrichment::new()
        .with("batman_001.cbz", batman("1"))
        .with("batman_002.cbz", batman("2"))
        .with("batman_003.cbz", batman("3"));

    let token = CancellationToken::new();
    let executor = MigrationExecutor::from_config(&lib.config.clone().with_concurrency(1, 1))
        .with_transfer(Arc::new(CancelAfterFirstCopy {
            token: token.clone(),
        }));
    let first = BatchCoordinator::new(
        lib.config.clone().with_concurrency(1, 1),
        ledger.clone(),
        Arc::new(table.clone()),
    )
    .with_available_space(u64::MAX)
    .with_executor(executor)
    .with_cancellation(token);

    let summary = first.run().await.unwrap();
    assert!(summary.interrupted);
    assert_eq!(summary.copies_performed, 1);
    assert_eq!(summary.phase_count(Phase::Migrated), 1);
    assert_eq!(summary.phase_count(Phase::Mapped), 2);

    // reopen from disk, as a restarted process would
    drop(first);
    let ledger = Arc::new(Ledger::open(ledger.path()).unwrap());
    let summary = lib.coordinator(&ledger, table).run().await.unwrap();
    assert!(!summary.interrupted);
    assert_eq!(summary.copies_performed, 2);
    assert_eq!(summary.phase_count(Phase::Migrated), 3);
    assert_eq!(lib.files_under("Comics").len(), 3);
}

#[tokio::test]
async fn test_low_confidence_stays_in_quarantine() {
    let lib = Library::new(&[
        ("a/scan0001.cbz", b"a"),
        ("a/b/random.cbr", b"b"),
        ("untitled.pdf", b"c"),
    ]);
    let ledger = lib.ledger(Defaults::LEDGER_FILE_NAME);
    let summary = lib
        .coordinator(&ledger, StaticEnrichment::new())
        .run()
        .await
        .unwrap();

    assert_eq!(summary.confidence_count(Confidence::Low), 3);
    assert!(lib.files_under("Comics").is_empty());
    assert!(lib.files_under("_best_guess").is_empty());
    assert_eq!(lib.files_under("_unsorted").len(), 3);

    let quarantine = lib.target("_unsorted");
    for record in ledger.load().unwrap() {
        let final_path = record.final_target_path.unwrap();
        assert!(final_path.starts_with(&quarantine));
        assert_eq!(final_path, quarantine.join(&record.relative_path));
    }
}

/// Writes bytes that never match the source hash.
#[derive(Debug)]
struct CorruptingTransfer;

impl FileTransfer for CorruptingTransfer {
    fn copy(&self, _source: &Path, partial: &Path) -> tidyshelf_core::Result<u64> {
        fs::write(partial, b"bit rot").map_err(|e| ShelfError::io_with_path(e, partial))?;
        Ok(7)
    }
}

#[tokio::test]
async fn test_integrity_failure_leaves_no_file() {
    let lib = Library::new(&[("batman_001.cbz", b"batman issue one")]);
    let ledger = lib.ledger(Defaults::LEDGER_FILE_NAME);
    let table = StaticEnrichment::new().with("batman_001.cbz", batman("1"));
    let executor = MigrationExecutor::from_config(&lib.config).with_transfer(Arc::new(CorruptingTransfer));

    let summary = lib
        .coordinator(&ledger, table.clone())
        .with_executor(executor)
        .run()
        .await
        .unwrap();
    assert_eq!(summary.failure_count(FailureClass::Integrity), 1);
    assert!(lib.files_under("Comics").is_empty());
    assert_eq!(
        fs::read(lib.config.source_root.join("batman_001.cbz")).unwrap(),
        b"batman issue one"
    );

    let record = &ledger.load().unwrap()[0];
    assert_eq!(record.phase_state, Phase::Failed);
    assert_eq!(record.retry_count, 0);
    assert!(record.final_target_path.is_none());

    // integrity failures are not retried
    let summary = lib.coordinator(&ledger, table).run().await.unwrap();
    assert_eq!(summary.items_processed, 0);
    assert!(lib.files_under("Comics").is_empty());
}

#[tokio::test]
async fn test_high_high_conflict_gets_suffix() {
    let lib = Library::new(&[("a.cbz", b"first scan"), ("b.cbz", b"second scan")]);
    let ledger = lib.ledger(Defaults::LEDGER_FILE_NAME);
    let table = StaticEnrichment::new()
        .with("a.cbz", batman("1"))
        .with("b.cbz", batman("1"));

    let summary = lib.coordinator(&ledger, table).run().await.unwrap();
    assert_eq!(summary.conflicts.len(), 1);
    assert_eq!(summary.conflicts[0].members.len(), 2);
    assert_eq!(summary.copies_performed, 2);

    let records = ledger.load().unwrap();
    assert_eq!(records[0].confidence, Confidence::High);
    assert_eq!(records[0].final_target_path.as_deref(), Some(lib.target(BATMAN_001).as_path()));

    let loser = &records[1];
    assert_eq!(loser.confidence, Confidence::Medium);
    assert!(loser.reasoning.contains("-alt2"));
    assert_eq!(
        loser.final_target_path.as_deref(),
        Some(
            lib.target("Comics/DC/Batman (1940)/Batman (1940) #001 (1940-04-25)-alt2.cbz")
                .as_path()
        )
    );
    assert_eq!(fs::read(loser.final_target_path.as_ref().unwrap()).unwrap(), b"second scan");
}

#[tokio::test]
async fn test_conflict_groups_survive_reopening_the_ledger() {
    let lib = Library::new(&[("a.cbz", b"first scan"), ("b.cbz", b"second scan")]);
    let ledger = lib.ledger(Defaults::LEDGER_FILE_NAME);
    let table = StaticEnrichment::new()
        .with("a.cbz", batman("1"))
        .with("b.cbz", batman("1"));
    let live = lib.coordinator(&ledger, table).run().await.unwrap().conflicts;
    drop(ledger);

    let reopened = Ledger::open(lib.temp.path().join(Defaults::LEDGER_FILE_NAME)).unwrap();
    let records = reopened.load().unwrap();
    let report =
        MigrationReport::build(&reopened, RunSummary::snapshot(RunMode::Apply, &records)).unwrap();

    assert_eq!(report.conflicts, live);
    assert_eq!(report.summary.conflicts, live);
    let group = &report.conflicts[0];
    assert!(!group.claimed_earlier);
    assert_eq!(group.members.len(), 2);
    assert_eq!(group.members[0].identity, records[0].identity);
    assert_eq!(group.members[1].confidence_before, Confidence::High);
    assert_eq!(group.members[1].confidence_after, Confidence::Medium);
    assert!(group.members[1]
        .destination
        .to_string_lossy()
        .ends_with("#001 (1940-04-25)-alt2.cbz"));
}

#[tokio::test]
async fn test_quarantine_names_differing_only_by_case_get_suffix() {
    let lib = Library::new(&[("sub/A.cbz", b"upper"), ("sub/a.cbz", b"lower")]);
    let ledger = lib.ledger(Defaults::LEDGER_FILE_NAME);

    let summary = lib
        .coordinator(&ledger, StaticEnrichment::new())
        .run()
        .await
        .unwrap();
    assert_eq!(summary.phase_count(Phase::Quarantined), 2);
    assert_eq!(summary.phase_count(Phase::Failed), 0);
    assert_eq!(summary.conflicts.len(), 1);

    let records = ledger.load().unwrap();
    assert_eq!(
        records[0].final_target_path.as_deref(),
        Some(lib.target("_unsorted/sub/A.cbz").as_path())
    );
    assert_eq!(
        records[1].final_target_path.as_deref(),
        Some(lib.target("_unsorted/sub/a-alt2.cbz").as_path())
    );
    assert_eq!(records[1].confidence, Confidence::Low);
    assert_eq!(fs::read(lib.target("_unsorted/sub/a-alt2.cbz")).unwrap(), b"lower");
}

#[tokio::test]
async fn test_conflict_with_earlier_batch() {
    let lib = Library::new(&[("a.cbz", b"first scan"), ("b.cbz", b"second scan")]);
    let ledger = lib.ledger(Defaults::LEDGER_FILE_NAME);
    let table = StaticEnrichment::new()
        .with("a.cbz", batman("1"))
        .with("b.cbz", batman("1"));

    let coordinator = BatchCoordinator::new(
        lib.config.clone().with_batch_size(1),
        ledger.clone(),
        Arc::new(table),
    )
    .with_available_space(u64::MAX);
    let summary = coordinator.run().await.unwrap();

    assert_eq!(summary.batches_processed, 2);
    assert_eq!(summary.conflicts.len(), 1);
    assert!(summary.conflicts[0].claimed_earlier);
    assert_eq!(lib.files_under("Comics").len(), 2);
}

/// Fails the first `failures` copies with an interrupted I/O error.
#[derive(Debug)]
struct FlakyTransfer {
    failures: u32,
    calls: AtomicU32,
}

impl FileTransfer for FlakyTransfer {
    fn copy(&self, source: &Path, partial: &Path) -> tidyshelf_core::Result<u64> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(std::io::Error::new(ErrorKind::Interrupted, "device busy").into());
        }
        LocalTransfer.copy(source, partial)
    }
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let lib = Library::new(&[("batman_001.cbz", b"batman issue one")]);
    let ledger = lib.ledger(Defaults::LEDGER_FILE_NAME);
    let table = StaticEnrichment::new().with("batman_001.cbz", batman("1"));
    let executor = MigrationExecutor::from_config(&lib.config).with_transfer(Arc::new(FlakyTransfer {
        failures: 2,
        calls: AtomicU32::new(0),
    }));

    let summary = lib
        .coordinator(&ledger, table)
        .with_executor(executor)
        .run()
        .await
        .unwrap();
    assert_eq!(summary.phase_count(Phase::Migrated), 1);

    let record = &ledger.load().unwrap()[0];
    assert_eq!(record.retry_count, 2);
    assert_eq!(record.errors.len(), 2);
    assert!(record.errors.iter().all(|e| e.class == FailureClass::Transient));
    assert!(lib.target(BATMAN_001).exists());
}

#[tokio::test]
async fn test_retry_budget_is_bounded() {
    let lib = Library::new(&[("batman_001.cbz", b"batman issue one")]);
    let ledger = lib.ledger(Defaults::LEDGER_FILE_NAME);
    let table = StaticEnrichment::new().with("batman_001.cbz", batman("1"));
    let flaky = Arc::new(FlakyTransfer {
        failures: u32::MAX,
        calls: AtomicU32::new(0),
    });
    let executor = MigrationExecutor::from_config(&lib.config).with_transfer(flaky.clone());

    let summary = lib
        .coordinator(&ledger, table)
        .with_executor(executor)
        .run()
        .await
        .unwrap();
    assert_eq!(summary.failure_count(FailureClass::Transient), 1);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), Defaults::MAX_RETRIES);

    let record = &ledger.load().unwrap()[0];
    assert_eq!(record.retry_count, Defaults::MAX_RETRIES);
    assert!(!record.can_retry(Defaults::MAX_RETRIES));
}

#[tokio::test]
async fn test_dry_run_then_apply_with_fresh_ledger() {
    let lib = Library::new(&[("batman_001.cbz", b"batman issue one")]);
    let table = StaticEnrichment::new().with("batman_001.cbz", batman("1"));

    let dry_config = lib.config.clone().with_mode(RunMode::DryRun);
    let dry_ledger = lib.ledger(Defaults::DRY_RUN_LEDGER_FILE_NAME);
    let summary = BatchCoordinator::new(dry_config, dry_ledger.clone(), Arc::new(table.clone()))
        .with_available_space(u64::MAX)
        .run()
        .await
        .unwrap();
    assert_eq!(summary.phase_count(Phase::Migrated), 1);
    assert_eq!(summary.copies_performed, 0);
    assert!(!lib.target("Comics").exists());

    let planned = dry_ledger.load().unwrap()[0].planned_target_path.clone();
    assert_eq!(planned.as_deref(), Some(lib.target(BATMAN_001).as_path()));

    // the dry-run ledger cannot drive an apply run
    let refused = lib.coordinator(&dry_ledger, table.clone()).run().await;
    assert!(matches!(refused, Err(ShelfError::Config { .. })));

    let ledger = lib.ledger(Defaults::LEDGER_FILE_NAME);
    let summary = lib.coordinator(&ledger, table).run().await.unwrap();
    assert_eq!(summary.copies_performed, 1);
    assert_eq!(ledger.load().unwrap()[0].final_target_path, planned);
}

#[tokio::test]
async fn test_best_guess_folder_for_medium() {
    let lib = Library::new(&[("batman_001.cbz", b"batman issue one")]);
    let mut enrichment = batman("1");
    enrichment.signals = MatchSignals {
        match_type: MatchType::Fuzzy,
        score: Some(0.8),
        candidate_count: 1,
        ..Default::default()
    };
    let table = StaticEnrichment::new().with("batman_001.cbz", enrichment);
    let ledger = lib.ledger(Defaults::LEDGER_FILE_NAME);

    let coordinator = BatchCoordinator::new(
        lib.config.clone().with_best_guess_folder(true),
        ledger.clone(),
        Arc::new(table),
    )
    .with_available_space(u64::MAX);
    coordinator.run().await.unwrap();

    let record = &ledger.load().unwrap()[0];
    assert_eq!(record.confidence, Confidence::Medium);
    assert!(lib
        .target("_best_guess/DC/Batman (1940)/Batman (1940) #001 (1940-04-25).cbz")
        .exists());
    assert!(lib.files_under("Comics").is_empty());
}
