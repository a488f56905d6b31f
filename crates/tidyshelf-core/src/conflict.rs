//! Conflict detection across one batch of mapped items.
//!
//! Destinations are compared by a collision key: the full path, NFKC
//! normalized and lowercased, so two names that a case-insensitive or
//! normalizing filesystem would fold together count as the same target.
//!
//! Within a colliding group members are ordered by confidence (highest first),
//! then discovery order. The first keeps the bare path, the rest get `-alt2`,
//! `-alt3`, ... before the extension. A suffixed HIGH member drops to MEDIUM.

use crate::models::{Confidence, ItemRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::debug;
use unicode_normalization::UnicodeNormalization;

/// One mapped item taking part in detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictCandidate {
    pub identity: String,
    /// Routed destination the item would be written to
    pub destination: PathBuf,
    pub confidence: Confidence,
    pub discovery_seq: u64,
}

/// Change to apply to a losing group member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub identity: String,
    /// `n` in `-alt{n}`
    pub suffix: u32,
    pub destination: PathBuf,
    pub confidence: Confidence,
    pub downgraded: bool,
}

/// One member of a colliding group, as reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictMember {
    pub identity: String,
    pub discovery_seq: u64,
    pub confidence_before: Confidence,
    pub confidence_after: Confidence,
    pub destination: PathBuf,
}

/// Every item that wanted the same normalized destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictGroup {
    pub key: String,
    /// The bare destination was already taken by an earlier batch
    pub claimed_earlier: bool,
    pub members: Vec<ConflictMember>,
}

/// Detector output for one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictOutcome {
    pub resolutions: Vec<Resolution>,
    pub groups: Vec<ConflictGroup>,
}

impl ConflictOutcome {
    pub fn is_clean(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Collision key for a destination path.
pub fn collision_key(path: &Path) -> String {
    path.to_string_lossy()
        .replace('\\', "/")
        .nfkc()
        .collect::<String>()
        .to_lowercase()
}

/// Insert `-alt{n}` between the file stem and the extension.
///
/// ```
/// use std::path::Path;
/// use tidyshelf_core::conflict::alt_path;
///
/// assert_eq!(
///     alt_path(Path::new("DC/Batman #001.cbz"), 2),
///     Path::new("DC/Batman #001-alt2.cbz")
/// );
/// ```
pub fn alt_path(path: &Path, n: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}-alt{}.{}", stem, n, ext.to_string_lossy()),
        None => format!("{}-alt{}", stem, n),
    };
    path.with_file_name(name)
}

/// Rebuild conflict groups from the notes persisted on ledger records.
///
/// Members keep the bare-path holder first, then ascend by suffix; groups
/// come back in the discovery order of their earliest member.
pub fn groups_from_records(records: &[ItemRecord]) -> Vec<ConflictGroup> {
    let mut by_key: BTreeMap<&str, Vec<&ItemRecord>> = BTreeMap::new();
    for record in records {
        if let Some(note) = &record.conflict {
            by_key.entry(note.key.as_str()).or_default().push(record);
        }
    }

    let mut groups: Vec<(u64, ConflictGroup)> = by_key
        .into_iter()
        .map(|(key, mut members)| {
            members.sort_by_key(|r| {
                (
                    r.conflict.as_ref().and_then(|n| n.suffix).unwrap_or(0),
                    r.discovery_seq,
                )
            });
            let first_seen = members.iter().map(|r| r.discovery_seq).min().unwrap_or(u64::MAX);
            let claimed_earlier = members
                .iter()
                .filter_map(|r| r.conflict.as_ref())
                .any(|n| n.claimed_earlier);
            let members = members
                .into_iter()
                .filter_map(|r| {
                    r.conflict.as_ref().map(|note| ConflictMember {
                        identity: r.identity.clone(),
                        discovery_seq: r.discovery_seq,
                        confidence_before: note.confidence_before,
                        confidence_after: note.confidence_after,
                        destination: note.destination.clone(),
                    })
                })
                .collect();
            (
                first_seen,
                ConflictGroup {
                    key: key.to_string(),
                    claimed_earlier,
                    members,
                },
            )
        })
        .collect();
    groups.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.key.cmp(&b.1.key)));
    groups.into_iter().map(|(_, group)| group).collect()
}

/// Find collisions among `candidates` and assign deterministic suffixes.
///
/// `claimed` holds collision keys already owned by records from earlier
/// batches; a candidate landing on one of them never gets the bare path.
pub fn detect(candidates: &[ConflictCandidate], claimed: &HashSet<String>) -> ConflictOutcome {
    let mut groups: BTreeMap<String, Vec<&ConflictCandidate>> = BTreeMap::new();
    for candidate in candidates {
        groups
            .entry(collision_key(&candidate.destination))
            .or_default()
            .push(candidate);
    }

    let mut taken: HashSet<String> = claimed.clone();
    taken.extend(groups.keys().cloned());

    for members in groups.values_mut() {
        members.sort_by(|a, b| {
            b.confidence
                .rank()
                .cmp(&a.confidence.rank())
                .then(a.discovery_seq.cmp(&b.discovery_seq))
                .then(a.identity.cmp(&b.identity))
        });
    }

    // walk groups in discovery order of their leaders so suffix picks are stable
    let mut ordered: Vec<(&String, &Vec<&ConflictCandidate>)> = groups.iter().collect();
    ordered.sort_by_key(|(key, members)| {
        (
            members.iter().map(|m| m.discovery_seq).min().unwrap_or(u64::MAX),
            (*key).clone(),
        )
    });

    let mut outcome = ConflictOutcome::default();
    for (key, members) in ordered {
        let claimed_earlier = claimed.contains(key);
        if members.len() < 2 && !claimed_earlier {
            continue;
        }

        let mut report = ConflictGroup {
            key: key.clone(),
            claimed_earlier,
            members: Vec::with_capacity(members.len()),
        };

        let mut next_suffix = 2u32;
        for (position, member) in members.iter().enumerate() {
            if position == 0 && !claimed_earlier {
                report.members.push(ConflictMember {
                    identity: member.identity.clone(),
                    discovery_seq: member.discovery_seq,
                    confidence_before: member.confidence,
                    confidence_after: member.confidence,
                    destination: member.destination.clone(),
                });
                continue;
            }

            let (suffix, destination) = loop {
                let candidate = alt_path(&member.destination, next_suffix);
                let candidate_key = collision_key(&candidate);
                let n = next_suffix;
                next_suffix += 1;
                if taken.insert(candidate_key) {
                    break (n, candidate);
                }
            };

            let downgraded = member.confidence == Confidence::High;
            let confidence = if downgraded {
                Confidence::Medium
            } else {
                member.confidence
            };

            debug!(
                "Conflict on {}: {} -> -alt{}",
                key, member.identity, suffix
            );
            report.members.push(ConflictMember {
                identity: member.identity.clone(),
                discovery_seq: member.discovery_seq,
                confidence_before: member.confidence,
                confidence_after: confidence,
                destination: destination.clone(),
            });
            outcome.resolutions.push(Resolution {
                identity: member.identity.clone(),
                suffix,
                destination,
                confidence,
                downgraded,
            });
        }
        outcome.groups.push(report);
    }

    outcome
}
