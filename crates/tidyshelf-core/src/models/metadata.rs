//! Metadata and match-quality signals produced by the enrichment collaborator.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Content classification, which selects the naming rules and target root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContentClass {
    #[default]
    Western,
    Manga,
    Hentai,
    Unknown,
}

impl ContentClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentClass::Western => "WESTERN",
            ContentClass::Manga => "MANGA",
            ContentClass::Hentai => "HENTAI",
            ContentClass::Unknown => "UNKNOWN",
        }
    }

    /// Guess the class from the source location when enrichment gave no hint.
    ///
    /// A path component named like `manga` or `hentai` (case-insensitive)
    /// wins; everything else is treated as a western comic.
    pub fn infer_from_path(path: &Path) -> Self {
        let mut class = ContentClass::Western;
        for component in path.components() {
            let lower = component.as_os_str().to_string_lossy().to_lowercase();
            if lower.contains("hentai") || lower.contains("doujin") {
                return ContentClass::Hentai;
            }
            if lower.contains("manga") {
                class = ContentClass::Manga;
            }
        }
        class
    }
}

impl std::fmt::Display for ContentClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ContentClass {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "western" => Ok(ContentClass::Western),
            "manga" => Ok(ContentClass::Manga),
            "hentai" => Ok(ContentClass::Hentai),
            "unknown" => Ok(ContentClass::Unknown),
            _ => Err(()),
        }
    }
}

/// Normalized metadata for one item, whatever provider produced it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComicMetadata {
    /// Provider name (e.g. "comicvine", "filename")
    pub provider: Option<String>,
    /// Identifier in the provider's catalog
    pub catalog_id: Option<String>,
    pub series: Option<String>,
    pub title: Option<String>,
    /// Issue number as printed; may be fractional or non-numeric ("Annual 1")
    pub issue: Option<String>,
    pub volume: Option<u32>,
    pub chapter: Option<String>,
    /// Year the series (volume run) started
    pub series_year: Option<i32>,
    /// Publication year of this item
    pub year: Option<i32>,
    pub cover_date: Option<NaiveDate>,
    pub publisher: Option<String>,
    /// Doujin circle / group
    pub circle: Option<String>,
    pub language: Option<String>,
}

impl ComicMetadata {
    /// Series name with surrounding whitespace removed, if non-empty.
    pub fn series_name(&self) -> Option<&str> {
        self.series.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

/// How the provider matched the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    /// External catalog identifier matched exactly
    ExactId,
    /// Name-based fuzzy match with a score
    Fuzzy,
    /// No match
    #[default]
    None,
}

/// Quality signals consumed by the confidence evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchSignals {
    pub match_type: MatchType,
    /// Catalog identifier of the chosen candidate
    pub catalog_id: Option<String>,
    /// Fuzzy score of the chosen candidate (0.0-1.0)
    pub score: Option<f64>,
    /// Number of equally plausible candidates
    pub candidate_count: u32,
    /// Signal that broke a tie between candidates (e.g. "year-match")
    pub tie_break: Option<String>,
    /// Heuristic used to pick among candidates (e.g. "most-popular")
    pub heuristic: Option<String>,
    pub provider_reachable: bool,
    /// A structured filename parse produced at least a series name
    pub filename_parsed: bool,
    /// Pipeline stage that failed, when any did
    pub failed_stage: Option<String>,
    pub provider: Option<String>,
}

impl Default for MatchSignals {
    fn default() -> Self {
        Self {
            match_type: MatchType::None,
            catalog_id: None,
            score: None,
            candidate_count: 0,
            tie_break: None,
            heuristic: None,
            provider_reachable: true,
            filename_parsed: false,
            failed_stage: None,
            provider: None,
        }
    }
}

/// Output of the enrichment collaborator for one item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Enrichment {
    pub content_class: Option<ContentClass>,
    pub metadata: ComicMetadata,
    pub signals: MatchSignals,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_class_from_path() {
        assert_eq!(
            ContentClass::infer_from_path(Path::new("/src/Manga/Berserk/v01.cbz")),
            ContentClass::Manga
        );
        assert_eq!(
            ContentClass::infer_from_path(Path::new("/src/hentai/manga/x.cbz")),
            ContentClass::Hentai
        );
        assert_eq!(
            ContentClass::infer_from_path(Path::new("/src/batman_001.cbz")),
            ContentClass::Western
        );
    }

    #[test]
    fn test_series_name_ignores_blank() {
        let meta = ComicMetadata {
            series: Some("   ".into()),
            ..Default::default()
        };
        assert_eq!(meta.series_name(), None);
    }

    #[test]
    fn test_signals_deserialize_with_defaults() {
        let signals: MatchSignals = serde_json::from_str(r#"{"match_type":"fuzzy","score":0.8}"#).unwrap();
        assert_eq!(signals.match_type, MatchType::Fuzzy);
        assert!(signals.provider_reachable);
        assert_eq!(signals.candidate_count, 0);
    }
}
