//! Best-effort structured parse of comic file names.
//!
//! Only the common `Series 001 (Year)` and `Series v01` shapes are recognized.
//! A parse counts as successful when both a series name and a number were
//! found.

use crate::models::ComicMetadata;
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

static YEAR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\((\d{4})\)").unwrap());

static BRACKETED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]*\]|\([^)]*\)|\{[^}]*\}").unwrap());

static VOLUME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:v|vol\.?|volume)\s*(\d{1,3})\b").unwrap());

static ISSUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:#|\s)(\d{1,4}(?:\.\d+)?)\s*$").unwrap());

static SPACES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// A dot that is not part of a decimal number.
static WORD_DOT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\D)\.").unwrap());

/// Fields recovered from a file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub series: String,
    pub issue: Option<String>,
    pub volume: Option<u32>,
    pub year: Option<i32>,
}

impl ParsedName {
    /// Filename-only metadata, tagged with the `filename` provider.
    pub fn to_metadata(&self) -> ComicMetadata {
        ComicMetadata {
            provider: Some("filename".to_string()),
            series: Some(self.series.clone()),
            issue: self.issue.clone(),
            volume: self.volume,
            year: self.year,
            ..Default::default()
        }
    }
}

/// Parse the stem of `path`.
pub fn parse_filename(path: &Path) -> Option<ParsedName> {
    let stem = path.file_stem()?.to_string_lossy().to_string();

    let year = YEAR
        .captures(&stem)
        .and_then(|c| c[1].parse::<i32>().ok());

    let cleaned = BRACKETED.replace_all(&stem, " ");
    let cleaned = cleaned.replace('_', " ");
    let cleaned = WORD_DOT.replace_all(&cleaned, "$1 ");
    let cleaned = SPACES.replace_all(cleaned.trim(), " ").to_string();

    let (series, issue, volume) = if let Some(m) = VOLUME.captures(&cleaned) {
        let whole = m.get(0)?;
        let volume = m[1].parse::<u32>().ok();
        (cleaned[..whole.start()].to_string(), None, volume)
    } else if let Some(m) = ISSUE.captures(&cleaned) {
        let whole = m.get(0)?;
        (cleaned[..whole.start()].to_string(), Some(m[1].to_string()), None)
    } else {
        return None;
    };

    let series = series
        .trim_matches(|c: char| c.is_whitespace() || c == '-' || c == '#')
        .to_string();
    if series.is_empty() {
        return None;
    }

    Some(ParsedName {
        series,
        issue,
        volume,
        year,
    })
}
