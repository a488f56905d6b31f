//! Path resolution: content class + metadata -> relative target path.
//!
//! Resolution is a pure per-item function. It never touches the filesystem and
//! never looks at other items; collisions are the conflict detector's job.
//!
//! Layouts (relative to the class root):
//!
//! | Class   | Path |
//! |---------|------|
//! | WESTERN | `{publisher}/{series} ({start_year})/{series} ({start_year}) #{issue:03} ({date}).{ext}` |
//! | MANGA   | `{series}/{series} v{volume:02}.{ext}` or `{series}/{series} c{chapter:03}.{ext}` |
//! | HENTAI  | `[{circle}]/{title}/{title} v{volume:02}.{ext}` or `[{circle}]/{title}/({catalog_id}) - {title} ({language}).{ext}` |

mod naming;

pub use naming::{normalize_extension, pad_number, sanitize_component, MAX_COMPONENT_LENGTH};

use crate::error::{Result, ShelfError};
use crate::models::{ComicMetadata, ContentClass};
use std::path::PathBuf;

pub const UNKNOWN_PUBLISHER: &str = "Unknown Publisher";
pub const UNKNOWN_CIRCLE: &str = "Unknown Circle";
pub const UNKNOWN_LANGUAGE: &str = "Unknown Language";
pub const UNKNOWN_YEAR: &str = "0000";
pub const UNKNOWN_DATE: &str = "0000-00-00";

const ISSUE_WIDTH: usize = 3;
const VOLUME_WIDTH: usize = 2;
const CHAPTER_WIDTH: usize = 3;

/// Resolve the target path of one item, relative to its class root.
///
/// Fails with a persistent-data error when the series name (the work title
/// for HENTAI) is missing, or when the class is UNKNOWN.
pub fn resolve(class: ContentClass, metadata: &ComicMetadata, extension: &str) -> Result<PathBuf> {
    let ext = normalize_extension(extension);
    match class {
        ContentClass::Western => resolve_western(metadata, &ext),
        ContentClass::Manga => resolve_manga(metadata, &ext),
        ContentClass::Hentai => resolve_hentai(metadata, &ext),
        ContentClass::Unknown => Err(ShelfError::UnsupportedClass(class.to_string())),
    }
}

fn required(value: Option<&str>, field: &str) -> Result<String> {
    value
        .map(sanitize_component)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ShelfError::MissingField {
            field: field.to_string(),
        })
}

fn or_sentinel(value: Option<&str>, sentinel: &str) -> String {
    value
        .map(sanitize_component)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| sentinel.to_string())
}

fn with_ext(stem: String, ext: &str) -> String {
    if ext.is_empty() {
        stem
    } else {
        format!("{}.{}", stem, ext)
    }
}

fn resolve_western(metadata: &ComicMetadata, ext: &str) -> Result<PathBuf> {
    let series = required(metadata.series_name(), "series")?;
    let publisher = or_sentinel(metadata.publisher.as_deref(), UNKNOWN_PUBLISHER);
    let start_year = metadata
        .series_year
        .or(metadata.year)
        .map(|y| format!("{:04}", y))
        .unwrap_or_else(|| UNKNOWN_YEAR.to_string());
    let issue = pad_number(metadata.issue.as_deref().unwrap_or_default(), ISSUE_WIDTH);
    let date = metadata
        .cover_date
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| UNKNOWN_DATE.to_string());

    let folder = format!("{} ({})", series, start_year);
    let file = format!("{} ({}) #{} ({})", series, start_year, issue, date);
    Ok(PathBuf::from(publisher).join(folder).join(with_ext(file, ext)))
}

fn resolve_manga(metadata: &ComicMetadata, ext: &str) -> Result<PathBuf> {
    let series = required(metadata.series_name(), "series")?;
    let number = match (metadata.volume, metadata.chapter.as_deref()) {
        (Some(volume), _) => format!("v{:0width$}", volume, width = VOLUME_WIDTH),
        (None, Some(chapter)) if !chapter.trim().is_empty() => {
            format!("c{}", pad_number(chapter, CHAPTER_WIDTH))
        }
        _ => format!("v{}", pad_number("", VOLUME_WIDTH)),
    };

    let file = format!("{} {}", series, number);
    Ok(PathBuf::from(&series).join(with_ext(file, ext)))
}

fn resolve_hentai(metadata: &ComicMetadata, ext: &str) -> Result<PathBuf> {
    let title = required(
        metadata
            .title
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .or(metadata.series_name()),
        "title",
    )?;
    let circle = format!("[{}]", or_sentinel(metadata.circle.as_deref(), UNKNOWN_CIRCLE));

    let file = match metadata.volume {
        Some(volume) => format!("{} v{:0width$}", title, volume, width = VOLUME_WIDTH),
        None => {
            let catalog_id = or_sentinel(metadata.catalog_id.as_deref(), "0");
            let language = or_sentinel(metadata.language.as_deref(), UNKNOWN_LANGUAGE);
            format!("({}) - {} ({})", catalog_id, title, language)
        }
    };
    Ok(PathBuf::from(circle).join(&title).join(with_ext(file, ext)))
}
