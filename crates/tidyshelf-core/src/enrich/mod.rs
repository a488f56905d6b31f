//! Enrichment collaborators: turn a discovered item into metadata plus match
//! signals.
//!
//! The engine only depends on [`EnrichmentSource`]. Catalog access is a
//! capability ([`MetadataProvider`]: `search` + `details`) so any provider can
//! be plugged into [`ProviderEnricher`] without the engine knowing about it.
//! [`ComicInfoEnricher`] sits in front of either and prefers the tags stored
//! inside the archive. Enrichment never fails; problems are expressed in the
//! signals.

mod comic_info;
mod filename;
mod retry;

pub use comic_info::{read_comic_info, ComicInfo, ComicInfoEnricher, COMIC_INFO_PROVIDER};
pub use filename::{parse_filename, ParsedName};
pub use retry::{retry_async, RetryConfig, RetryStats};

use crate::atomic::read_json;
use crate::error::{DefaultClassifier, FailureClass, FailureClassifier, Result, ShelfError};
use crate::models::{ComicMetadata, ContentClass, Enrichment, ItemRecord, MatchSignals, MatchType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};
use unicode_normalization::UnicodeNormalization;

/// Heuristic used when several candidates tie and nothing breaks the tie.
pub const POPULARITY_HEURISTIC: &str = "most-popular";
/// Tie-break signal: exactly one tied candidate matches the parsed year.
pub const YEAR_TIE_BREAK: &str = "year-match";

/// Produces enrichment for one item.
#[async_trait]
pub trait EnrichmentSource: Send + Sync {
    async fn enrich(&self, record: &ItemRecord) -> Enrichment;
}

/// Search request sent to a metadata provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub series: String,
    pub issue: Option<String>,
    pub volume: Option<u32>,
    pub year: Option<i32>,
}

/// One search hit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Candidate {
    pub id: String,
    pub series: String,
    pub year: Option<i32>,
    /// Provider-computed similarity, when it has one
    pub score: Option<f64>,
    pub popularity: Option<u64>,
    pub content_class: Option<ContentClass>,
}

/// Catalog capability: anything that can search and fetch details.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Candidate>>;

    async fn details(&self, id: &str) -> Result<ComicMetadata>;
}

fn normalize_title(s: &str) -> String {
    s.nfkc()
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Filename-only enrichment: no catalog, just the structured parse.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilenameEnricher;

impl FilenameEnricher {
    fn fallback(record: &ItemRecord, failed_stage: Option<&str>, reachable: bool) -> Enrichment {
        let parsed = parse_filename(&record.source_path);
        Enrichment {
            content_class: None,
            metadata: parsed.as_ref().map(ParsedName::to_metadata).unwrap_or_default(),
            signals: MatchSignals {
                filename_parsed: parsed.is_some(),
                provider_reachable: reachable,
                failed_stage: failed_stage
                    .map(str::to_string)
                    .or_else(|| parsed.is_none().then(|| "filename parse".to_string())),
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl EnrichmentSource for FilenameEnricher {
    async fn enrich(&self, record: &ItemRecord) -> Enrichment {
        Self::fallback(record, None, true)
    }
}

/// Precomputed enrichment keyed by identity or by source file name.
///
/// Items without an entry fall back to [`FilenameEnricher`].
#[derive(Debug, Clone, Default)]
pub struct StaticEnrichment {
    entries: HashMap<String, Enrichment>,
}

impl StaticEnrichment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry; `key` is an identity or a file name.
    pub fn insert(&mut self, key: impl Into<String>, enrichment: Enrichment) {
        self.entries.insert(key.into(), enrichment);
    }

    pub fn with(mut self, key: impl Into<String>, enrichment: Enrichment) -> Self {
        self.insert(key, enrichment);
        self
    }

    /// Load a JSON object mapping keys to enrichment records.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let entries: HashMap<String, Enrichment> =
            read_json(path)?.ok_or_else(|| ShelfError::FileNotFound(path.to_path_buf()))?;
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl EnrichmentSource for StaticEnrichment {
    async fn enrich(&self, record: &ItemRecord) -> Enrichment {
        let by_name = record
            .source_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .and_then(|n| self.entries.get(&n));
        match self.entries.get(&record.identity).or(by_name) {
            Some(enrichment) => enrichment.clone(),
            None => FilenameEnricher::fallback(record, None, true),
        }
    }
}

/// Enrichment backed by a [`MetadataProvider`], with bounded retry on
/// transient provider errors and fuzzy candidate scoring.
pub struct ProviderEnricher {
    provider: Arc<dyn MetadataProvider>,
    retry: RetryConfig,
    classifier: Arc<dyn FailureClassifier>,
}

impl std::fmt::Debug for ProviderEnricher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEnricher")
            .field("provider", &self.provider.name())
            .field("retry", &self.retry)
            .finish()
    }
}

struct Choice<'a> {
    candidate: &'a Candidate,
    match_type: MatchType,
    score: f64,
    tied: u32,
    tie_break: Option<String>,
    heuristic: Option<String>,
}

impl ProviderEnricher {
    pub fn new(provider: Arc<dyn MetadataProvider>) -> Self {
        Self {
            provider,
            retry: RetryConfig::default(),
            classifier: Arc::new(DefaultClassifier::default()),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    fn is_transient(&self, err: &ShelfError) -> bool {
        self.classifier.classify(err) == FailureClass::Transient
    }

    fn score(query: &SearchQuery, candidate: &Candidate) -> f64 {
        candidate.score.unwrap_or_else(|| {
            strsim::normalized_levenshtein(
                &normalize_title(&query.series),
                &normalize_title(&candidate.series),
            )
        })
    }

    fn choose<'a>(query: &SearchQuery, candidates: &'a [Candidate]) -> Option<Choice<'a>> {
        let wanted = normalize_title(&query.series);
        let exact: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| normalize_title(&c.series) == wanted)
            .filter(|c| match (query.year, c.year) {
                (Some(q), Some(y)) => q == y,
                _ => true,
            })
            .collect();
        if let [only] = exact.as_slice() {
            return Some(Choice {
                candidate: *only,
                match_type: MatchType::ExactId,
                score: 1.0,
                tied: 1,
                tie_break: None,
                heuristic: None,
            });
        }

        let scored: Vec<(f64, &Candidate)> =
            candidates.iter().map(|c| (Self::score(query, c), c)).collect();
        let best = scored
            .iter()
            .map(|(s, _)| *s)
            .fold(f64::NEG_INFINITY, f64::max);
        if !best.is_finite() {
            return None;
        }
        let tied: Vec<&Candidate> = scored
            .iter()
            .filter(|(s, _)| (best - s).abs() < 1e-9)
            .map(|(_, c)| *c)
            .collect();

        if tied.len() == 1 {
            return Some(Choice {
                candidate: tied[0],
                match_type: MatchType::Fuzzy,
                score: best,
                tied: 1,
                tie_break: None,
                heuristic: None,
            });
        }

        let by_year: Vec<&Candidate> = tied
            .iter()
            .copied()
            .filter(|c| query.year.is_some() && c.year == query.year)
            .collect();
        if let [only] = by_year.as_slice() {
            return Some(Choice {
                candidate: *only,
                match_type: MatchType::Fuzzy,
                score: best,
                tied: tied.len() as u32,
                tie_break: Some(YEAR_TIE_BREAK.to_string()),
                heuristic: None,
            });
        }

        let popular = tied.iter().copied().max_by(|a, b| {
            a.popularity
                .unwrap_or(0)
                .cmp(&b.popularity.unwrap_or(0))
                .then_with(|| b.id.cmp(&a.id))
        })?;
        Some(Choice {
            candidate: popular,
            match_type: MatchType::Fuzzy,
            score: best,
            tied: tied.len() as u32,
            tie_break: None,
            heuristic: Some(POPULARITY_HEURISTIC.to_string()),
        })
    }
}

#[async_trait]
impl EnrichmentSource for ProviderEnricher {
    async fn enrich(&self, record: &ItemRecord) -> Enrichment {
        let parsed = parse_filename(&record.source_path);
        let Some(parsed) = parsed else {
            return FilenameEnricher::fallback(record, None, true);
        };

        let query = SearchQuery {
            series: parsed.series.clone(),
            issue: parsed.issue.clone(),
            volume: parsed.volume,
            year: parsed.year,
        };
        let provider = self.provider.name().to_string();

        let (found, stats) = retry_async(
            &self.retry,
            || self.provider.search(&query),
            |e: &ShelfError| self.is_transient(e),
        )
        .await;
        let candidates = match found {
            Ok(candidates) => candidates,
            Err(e) => {
                let reachable = !(self.is_transient(&e) && stats.exhausted(&self.retry));
                warn!("{} search failed for {}: {}", provider, query.series, e);
                let mut enrichment = FilenameEnricher::fallback(record, Some("search"), reachable);
                enrichment.signals.provider = Some(provider);
                return enrichment;
            }
        };

        let Some(choice) = Self::choose(&query, &candidates) else {
            let mut enrichment = FilenameEnricher::fallback(record, None, true);
            enrichment.signals.provider = Some(provider);
            return enrichment;
        };
        debug!(
            "{}: picked {} ({:?}, score {:.3}) for {}",
            provider, choice.candidate.id, choice.match_type, choice.score, query.series
        );

        let (details, _) = retry_async(
            &self.retry,
            || self.provider.details(&choice.candidate.id),
            |e: &ShelfError| self.is_transient(e),
        )
        .await;

        // an unbroken tie is reported without a score so it rates as ambiguous
        let score = choice.heuristic.is_none().then_some(choice.score);
        let mut signals = MatchSignals {
            match_type: choice.match_type,
            catalog_id: Some(choice.candidate.id.clone()),
            score,
            candidate_count: choice.tied,
            tie_break: choice.tie_break,
            heuristic: choice.heuristic,
            provider_reachable: true,
            filename_parsed: true,
            failed_stage: None,
            provider: Some(provider.clone()),
        };

        let mut metadata = match details {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("{} details failed for {}: {}", provider, choice.candidate.id, e);
                // a pick without its details is not a match we can file on
                signals.match_type = MatchType::Fuzzy;
                signals.score = None;
                signals.candidate_count = signals.candidate_count.max(1);
                signals.tie_break = None;
                signals.heuristic = None;
                signals.failed_stage = Some("details".to_string());
                ComicMetadata {
                    series: Some(choice.candidate.series.clone()),
                    series_year: choice.candidate.year,
                    ..Default::default()
                }
            }
        };
        metadata.provider.get_or_insert(provider);
        metadata.catalog_id.get_or_insert_with(|| choice.candidate.id.clone());
        if metadata.issue.is_none() {
            metadata.issue = parsed.issue;
        }
        if metadata.volume.is_none() {
            metadata.volume = parsed.volume;
        }
        if metadata.year.is_none() {
            metadata.year = parsed.year;
        }

        Enrichment {
            content_class: choice.candidate.content_class,
            metadata,
            signals,
        }
    }
}
