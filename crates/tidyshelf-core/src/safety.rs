//! Preflight environment checks run before any file is touched.
//!
//! Every check produces a [`SafetyCheck`]; a failed critical check aborts the
//! run with [`ShelfError::Environment`].

use crate::config::MigrationConfig;
use crate::error::{Result, ShelfError};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const CHECK_SOURCE_ROOT: &str = "source_root";
pub const CHECK_TARGET_WRITABLE: &str = "target_writable";
pub const CHECK_PATH_OVERLAP: &str = "path_overlap";
pub const CHECK_FREE_SPACE: &str = "free_space";

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SafetyCheck {
    pub name: &'static str,
    pub passed: bool,
    pub message: String,
    /// A failed critical check blocks the run
    pub critical: bool,
}

impl SafetyCheck {
    fn pass(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            passed: true,
            message: message.into(),
            critical: true,
        }
    }

    fn fail(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            passed: false,
            message: message.into(),
            critical: true,
        }
    }
}

/// All check outcomes of one preflight run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SafetyReport {
    pub checks: Vec<SafetyCheck>,
}

impl SafetyReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed || !c.critical)
    }

    pub fn failures(&self) -> impl Iterator<Item = &SafetyCheck> {
        self.checks.iter().filter(|c| !c.passed)
    }

    /// Convert the first failed critical check into a fatal error.
    pub fn ensure_passed(self) -> Result<Self> {
        if let Some(failed) = self.checks.iter().find(|c| !c.passed && c.critical) {
            return Err(ShelfError::Environment {
                check: failed.name.to_string(),
                message: failed.message.clone(),
            });
        }
        Ok(self)
    }
}

/// Preflight checks for one run.
#[derive(Debug)]
pub struct Preflight<'a> {
    config: &'a MigrationConfig,
    required_bytes: u64,
    available_space_override: Option<u64>,
}

impl<'a> Preflight<'a> {
    /// `required_bytes` is the total size of the items about to be copied.
    pub fn new(config: &'a MigrationConfig, required_bytes: u64) -> Self {
        Self {
            config,
            required_bytes,
            available_space_override: None,
        }
    }

    /// Pretend the target volume has `bytes` available.
    pub fn with_available_space(mut self, bytes: u64) -> Self {
        self.available_space_override = Some(bytes);
        self
    }

    pub fn run(&self) -> SafetyReport {
        let checks = vec![
            self.check_source_root(),
            self.check_target_writable(),
            self.check_overlap(),
            self.check_free_space(),
        ];
        for check in &checks {
            if check.passed {
                info!("Preflight {}: {}", check.name, check.message);
            } else {
                warn!("Preflight {} failed: {}", check.name, check.message);
            }
        }
        SafetyReport { checks }
    }

    fn check_source_root(&self) -> SafetyCheck {
        let root = &self.config.source_root;
        match fs::metadata(root) {
            Err(e) => SafetyCheck::fail(
                CHECK_SOURCE_ROOT,
                format!("{} is not accessible: {}", root.display(), e),
            ),
            Ok(meta) if !meta.is_dir() => SafetyCheck::fail(
                CHECK_SOURCE_ROOT,
                format!("{} is not a directory", root.display()),
            ),
            Ok(_) => match fs::read_dir(root) {
                Ok(_) => SafetyCheck::pass(CHECK_SOURCE_ROOT, format!("{} is readable", root.display())),
                Err(e) => SafetyCheck::fail(
                    CHECK_SOURCE_ROOT,
                    format!("{} is not readable: {}", root.display(), e),
                ),
            },
        }
    }

    fn check_target_writable(&self) -> SafetyCheck {
        let apply = self.config.mode.is_apply();
        for root in self.config.layout.roots() {
            let result = if apply {
                write_test_file(root)
            } else {
                ancestor_writable(root)
            };
            if let Err(message) = result {
                return SafetyCheck::fail(CHECK_TARGET_WRITABLE, message);
            }
        }
        SafetyCheck::pass(CHECK_TARGET_WRITABLE, "all target roots are writable")
    }

    fn check_overlap(&self) -> SafetyCheck {
        let source = resolve_existing(&self.config.source_root);
        for root in self.config.layout.roots() {
            let root = resolve_existing(root);
            if root.starts_with(&source) || source.starts_with(&root) {
                return SafetyCheck::fail(
                    CHECK_PATH_OVERLAP,
                    format!(
                        "source {} and target {} overlap",
                        source.display(),
                        root.display()
                    ),
                );
            }
        }
        SafetyCheck::pass(CHECK_PATH_OVERLAP, "source and target trees are disjoint")
    }

    fn check_free_space(&self) -> SafetyCheck {
        let needed = self
            .required_bytes
            .saturating_add(self.config.min_free_space_bytes);
        let available = match self.available_space_override {
            Some(bytes) => bytes,
            None => {
                let anchor = nearest_existing(&self.config.layout.western_root);
                match fs2::available_space(&anchor) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        return SafetyCheck::fail(
                            CHECK_FREE_SPACE,
                            format!("cannot query free space on {}: {}", anchor.display(), e),
                        )
                    }
                }
            }
        };

        let mut check = if available >= needed {
            SafetyCheck::pass(
                CHECK_FREE_SPACE,
                format!("{} bytes available, {} needed", available, needed),
            )
        } else {
            SafetyCheck::fail(
                CHECK_FREE_SPACE,
                format!("{} bytes available, {} needed", available, needed),
            )
        };
        // a dry run writes nothing but the ledger
        check.critical = self.config.mode.is_apply();
        check
    }
}

/// Closest ancestor of `path` (itself included) that exists.
fn nearest_existing(path: &Path) -> PathBuf {
    let mut current = path;
    loop {
        if current.exists() {
            return current.to_path_buf();
        }
        match current.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => current = parent,
            _ => return PathBuf::from("."),
        }
    }
}

/// Canonical form of `path`, resolving through its nearest existing ancestor.
fn resolve_existing(path: &Path) -> PathBuf {
    let existing = nearest_existing(path);
    let rest = path.strip_prefix(&existing).unwrap_or(Path::new(""));
    match existing.canonicalize() {
        Ok(canonical) => canonical.join(rest),
        Err(_) => path.to_path_buf(),
    }
}

fn ancestor_writable(root: &Path) -> std::result::Result<(), String> {
    let existing = nearest_existing(root);
    let meta = fs::metadata(&existing)
        .map_err(|e| format!("{} is not accessible: {}", existing.display(), e))?;
    if !meta.is_dir() {
        return Err(format!("{} is not a directory", existing.display()));
    }
    if meta.permissions().readonly() {
        return Err(format!("{} is read-only", existing.display()));
    }
    Ok(())
}

fn write_test_file(root: &Path) -> std::result::Result<(), String> {
    fs::create_dir_all(root).map_err(|e| format!("cannot create {}: {}", root.display(), e))?;
    let marker = root.join(format!(".tidyshelf-write-test-{}", uuid::Uuid::new_v4().simple()));
    fs::write(&marker, b"tidyshelf").map_err(|e| format!("{} is not writable: {}", root.display(), e))?;
    let _ = fs::remove_file(&marker);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunMode;
    use tempfile::TempDir;

    fn setup() -> (TempDir, MigrationConfig) {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("incoming");
        fs::create_dir_all(&source).unwrap();
        let config = MigrationConfig::new(&source, temp.path().join("library"));
        (temp, config)
    }

    #[test]
    fn test_all_checks_pass() {
        let (_temp, config) = setup();
        let report = Preflight::new(&config, 10).with_available_space(1 << 30).run();
        assert!(report.passed(), "{:?}", report);
        assert!(report.ensure_passed().is_ok());
    }

    #[test]
    fn test_missing_source_is_fatal() {
        let (temp, _) = setup();
        let config = MigrationConfig::new(temp.path().join("missing"), temp.path().join("library"));
        let err = Preflight::new(&config, 0)
            .with_available_space(1 << 30)
            .run()
            .ensure_passed()
            .unwrap_err();
        assert!(matches!(err, ShelfError::Environment { ref check, .. } if check == CHECK_SOURCE_ROOT));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_target_inside_source_is_rejected() {
        let (_temp, config) = setup();
        let nested = MigrationConfig::new(&config.source_root, config.source_root.join("sorted"));
        let report = Preflight::new(&nested, 0).with_available_space(1 << 30).run();
        assert!(!report.passed());
        assert_eq!(report.failures().next().unwrap().name, CHECK_PATH_OVERLAP);
    }

    #[test]
    fn test_free_space_only_blocks_apply() {
        let (_temp, config) = setup();
        let config = config.with_min_free_space(100);

        let dry = Preflight::new(&config, 50).with_available_space(120).run();
        assert!(dry.passed());
        assert_eq!(dry.failures().count(), 1);

        let apply = config.with_mode(RunMode::Apply);
        let report = Preflight::new(&apply, 50).with_available_space(120).run();
        assert!(!report.passed());
        assert!(report.ensure_passed().is_err());
    }

    #[test]
    fn test_apply_creates_target_roots() {
        let (_temp, config) = setup();
        let config = config.with_mode(RunMode::Apply);
        let report = Preflight::new(&config, 0).with_available_space(1 << 30).run();
        assert!(report.passed());
        assert!(config.layout.quarantine_root.is_dir());
        assert_eq!(fs::read_dir(&config.layout.quarantine_root).unwrap().count(), 0);
    }
}
