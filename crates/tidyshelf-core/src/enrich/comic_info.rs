//! Metadata embedded in CBZ archives as `ComicInfo.xml`.

use super::EnrichmentSource;
use crate::error::{Result, ShelfError};
use crate::models::{ComicMetadata, ContentClass, Enrichment, ItemRecord, MatchSignals, MatchType};
use async_trait::async_trait;
use chrono::NaiveDate;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Archive entry holding the tags.
pub const COMIC_INFO_ENTRY: &str = "ComicInfo.xml";

/// Provider name recorded for metadata read from the archive.
pub const COMIC_INFO_PROVIDER: &str = "comicinfo";

/// Larger entries are not tag files.
const MAX_COMIC_INFO_BYTES: u64 = 1024 * 1024;

/// The subset of ComicRack's ComicInfo schema the engine uses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComicInfo {
    pub title: Option<String>,
    pub series: Option<String>,
    /// Issue number as tagged
    pub number: Option<String>,
    /// Volume number, or the series start year in western tagging
    pub volume: Option<i32>,
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub day: Option<u32>,
    pub publisher: Option<String>,
    pub language_iso: Option<String>,
    /// Catalog page URL, when the tagger recorded one
    pub web: Option<String>,
    /// `Yes`, `YesAndRightToLeft` or `No`
    pub manga: Option<String>,
}

impl ComicInfo {
    /// Parse the top-level elements of a ComicInfo document.
    ///
    /// Unknown elements are ignored, blank ones are treated as absent and
    /// non-positive numbers (ComicRack writes `-1` for unset) are dropped.
    pub fn parse(xml: &str) -> std::result::Result<Self, String> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut fields: HashMap<String, String> = HashMap::new();
        let mut depth = 0usize;
        let mut current: Option<String> = None;
        loop {
            match reader.read_event().map_err(|e| e.to_string())? {
                Event::Start(element) => {
                    depth += 1;
                    current = (depth == 2).then(|| {
                        String::from_utf8_lossy(element.local_name().as_ref()).into_owned()
                    });
                }
                Event::End(_) => {
                    depth = depth.saturating_sub(1);
                    current = None;
                }
                Event::Text(text) => {
                    if let Some(name) = &current {
                        let value = text.unescape().map_err(|e| e.to_string())?;
                        let value = value.trim();
                        if !value.is_empty() {
                            fields.insert(name.clone(), value.to_string());
                        }
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        let text = |name: &str| fields.get(name).cloned();
        let number = |name: &str| {
            fields
                .get(name)
                .and_then(|v| v.parse::<i64>().ok())
                .filter(|v| *v > 0)
        };
        Ok(Self {
            title: text("Title"),
            series: text("Series"),
            number: text("Number"),
            volume: number("Volume").and_then(|v| i32::try_from(v).ok()),
            year: number("Year").and_then(|v| i32::try_from(v).ok()),
            month: number("Month").and_then(|v| u32::try_from(v).ok()),
            day: number("Day").and_then(|v| u32::try_from(v).ok()),
            publisher: text("Publisher"),
            language_iso: text("LanguageISO"),
            web: text("Web"),
            manga: text("Manga"),
        })
    }

    fn series_name(&self) -> Option<&str> {
        self.series.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    /// Series plus an issue or volume number pins the item down.
    pub fn identifies_item(&self) -> bool {
        self.series_name().is_some() && (self.number.is_some() || self.volume_number().is_some())
    }

    fn volume_number(&self) -> Option<u32> {
        self.volume
            .filter(|v| *v < 1000)
            .and_then(|v| u32::try_from(v).ok())
    }

    pub fn content_class(&self) -> Option<ContentClass> {
        match self.manga.as_deref() {
            Some(m) if m.to_ascii_lowercase().starts_with("yes") => Some(ContentClass::Manga),
            _ => None,
        }
    }

    pub fn to_metadata(&self) -> ComicMetadata {
        let cover_date = match (self.year, self.month, self.day) {
            (Some(y), Some(m), Some(d)) => NaiveDate::from_ymd_opt(y, m, d),
            _ => None,
        };
        ComicMetadata {
            provider: Some(COMIC_INFO_PROVIDER.to_string()),
            catalog_id: self.web.clone(),
            series: self.series_name().map(str::to_string),
            title: self.title.clone(),
            issue: self.number.clone(),
            volume: self.volume_number(),
            series_year: self.volume.filter(|v| *v >= 1000),
            year: self.year,
            cover_date,
            publisher: self.publisher.clone(),
            language: self.language_iso.clone(),
            ..Default::default()
        }
    }

    /// Copy tagged fields into `metadata` wherever it has none.
    pub fn fill_gaps(&self, metadata: &mut ComicMetadata) {
        let tagged = self.to_metadata();
        metadata.series = metadata.series.take().or(tagged.series);
        metadata.title = metadata.title.take().or(tagged.title);
        metadata.issue = metadata.issue.take().or(tagged.issue);
        metadata.volume = metadata.volume.or(tagged.volume);
        metadata.series_year = metadata.series_year.or(tagged.series_year);
        metadata.year = metadata.year.or(tagged.year);
        metadata.cover_date = metadata.cover_date.or(tagged.cover_date);
        metadata.publisher = metadata.publisher.take().or(tagged.publisher);
        metadata.language = metadata.language.take().or(tagged.language);
    }
}

/// Read `ComicInfo.xml` from a CBZ archive.
///
/// Returns `Ok(None)` for other formats and for archives without tags.
pub fn read_comic_info(path: &Path) -> Result<Option<ComicInfo>> {
    let is_zip = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("cbz") || e.eq_ignore_ascii_case("zip"))
        .unwrap_or(false);
    if !is_zip {
        return Ok(None);
    }

    let archive_error = |message: String| ShelfError::Archive {
        path: path.to_path_buf(),
        message,
    };
    let file = std::fs::File::open(path).map_err(|e| ShelfError::io_with_path(e, path))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| archive_error(format!("Failed to read zip: {}", e)))?;

    let Some(name) = archive
        .file_names()
        .find(|n| n.eq_ignore_ascii_case(COMIC_INFO_ENTRY))
        .map(str::to_string)
    else {
        return Ok(None);
    };
    let entry = archive
        .by_name(&name)
        .map_err(|e| archive_error(format!("Failed to open {}: {}", name, e)))?;

    let mut xml = String::new();
    entry
        .take(MAX_COMIC_INFO_BYTES)
        .read_to_string(&mut xml)
        .map_err(|e| archive_error(format!("Failed to read {}: {}", name, e)))?;
    ComicInfo::parse(&xml)
        .map(Some)
        .map_err(|e| archive_error(format!("Invalid {}: {}", name, e)))
}

/// Prefers the tags embedded in the archive and hands everything else to
/// `inner`.
///
/// Tags naming a series and an issue or volume are taken as an exact match.
/// Partial tags only fill the gaps in what `inner` found.
pub struct ComicInfoEnricher {
    inner: Arc<dyn EnrichmentSource>,
}

impl std::fmt::Debug for ComicInfoEnricher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComicInfoEnricher").finish_non_exhaustive()
    }
}

impl ComicInfoEnricher {
    pub fn new(inner: Arc<dyn EnrichmentSource>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl EnrichmentSource for ComicInfoEnricher {
    async fn enrich(&self, record: &ItemRecord) -> Enrichment {
        let path = record.source_path.clone();
        let info = match tokio::task::spawn_blocking(move || read_comic_info(&path)).await {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                debug!("No usable ComicInfo.xml: {}", e);
                None
            }
            Err(e) => {
                warn!("ComicInfo reader task failed: {}", e);
                None
            }
        };

        let Some(info) = info else {
            return self.inner.enrich(record).await;
        };
        if info.identifies_item() {
            debug!(
                "{}: identified by {}",
                record.source_path.display(),
                COMIC_INFO_ENTRY
            );
            return Enrichment {
                content_class: info.content_class(),
                metadata: info.to_metadata(),
                signals: MatchSignals {
                    match_type: MatchType::ExactId,
                    catalog_id: info.web.clone(),
                    candidate_count: 1,
                    provider: Some(COMIC_INFO_PROVIDER.to_string()),
                    ..Default::default()
                },
            };
        }

        let mut enrichment = self.inner.enrich(record).await;
        info.fill_gaps(&mut enrichment.metadata);
        if enrichment.content_class.is_none() {
            enrichment.content_class = info.content_class();
        }
        enrichment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confidence::evaluate;
    use crate::enrich::FilenameEnricher;
    use crate::models::Confidence;
    use crate::scan::ScanEntry;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    const BATMAN_TAGS: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<ComicInfo xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
  <Title>The Legend of the Batman &amp; Robin</Title>
  <Series>Batman</Series>
  <Number>1</Number>
  <Volume>1940</Volume>
  <Year>1940</Year>
  <Month>4</Month>
  <Day>25</Day>
  <Publisher>DC Comics</Publisher>
  <Web>https://comicvine.gamespot.com/batman-1/4000-1/</Web>
  <PageCount>68</PageCount>
  <Pages>
    <Page Image="0" Type="FrontCover" />
  </Pages>
</ComicInfo>"#;

    fn cbz(dir: &Path, name: &str, entries: &[(&str, &str)]) -> PathBuf {
        let path = dir.join(name);
        let mut writer = zip::ZipWriter::new(std::fs::File::create(&path).unwrap());
        for (entry, body) in entries {
            writer.start_file(*entry, SimpleFileOptions::default()).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    fn record(path: &Path) -> ItemRecord {
        let entry = ScanEntry {
            source_path: path.to_path_buf(),
            content_hash: "h".into(),
            size: 1,
            modified_time: None,
        };
        ItemRecord::discovered(&entry, PathBuf::from(path.file_name().unwrap()), 0)
    }

    #[test]
    fn test_parse_top_level_fields() {
        let info = ComicInfo::parse(BATMAN_TAGS).unwrap();
        assert_eq!(info.series.as_deref(), Some("Batman"));
        assert_eq!(info.title.as_deref(), Some("The Legend of the Batman & Robin"));
        assert_eq!(info.number.as_deref(), Some("1"));
        assert_eq!(info.volume, Some(1940));

        let meta = info.to_metadata();
        assert_eq!(meta.series_year, Some(1940));
        assert_eq!(meta.volume, None);
        assert_eq!(meta.cover_date, NaiveDate::from_ymd_opt(1940, 4, 25));
        assert_eq!(meta.publisher.as_deref(), Some("DC Comics"));
        assert_eq!(meta.provider.as_deref(), Some(COMIC_INFO_PROVIDER));
    }

    #[test]
    fn test_parse_drops_unset_numbers() {
        let info = ComicInfo::parse(
            "<ComicInfo><Series>Berserk</Series><Volume>-1</Volume><Year></Year><Manga>YesAndRightToLeft</Manga></ComicInfo>",
        )
        .unwrap();
        assert_eq!(info.volume, None);
        assert_eq!(info.year, None);
        assert_eq!(info.content_class(), Some(ContentClass::Manga));
        assert!(!info.identifies_item());
    }

    #[test]
    fn test_parse_rejects_malformed_xml() {
        assert!(ComicInfo::parse("<ComicInfo><Series>Batman</Number></ComicInfo>").is_err());
    }

    #[test]
    fn test_read_from_archive() {
        let temp = TempDir::new().unwrap();
        let tagged = cbz(
            temp.path(),
            "batman.cbz",
            &[("page001.jpg", "jpeg"), ("comicinfo.xml", BATMAN_TAGS)],
        );
        let info = read_comic_info(&tagged).unwrap().unwrap();
        assert_eq!(info.series.as_deref(), Some("Batman"));

        let untagged = cbz(temp.path(), "plain.cbz", &[("page001.jpg", "jpeg")]);
        assert_eq!(read_comic_info(&untagged).unwrap(), None);

        let pdf = temp.path().join("scan.pdf");
        std::fs::write(&pdf, b"%PDF").unwrap();
        assert_eq!(read_comic_info(&pdf).unwrap(), None);

        let fake = temp.path().join("really-a-rar.cbz");
        std::fs::write(&fake, b"Rar!").unwrap();
        assert!(matches!(read_comic_info(&fake), Err(ShelfError::Archive { .. })));
    }

    #[tokio::test]
    async fn test_complete_tags_are_an_exact_match() {
        let temp = TempDir::new().unwrap();
        let path = cbz(temp.path(), "scan_0042.cbz", &[("ComicInfo.xml", BATMAN_TAGS)]);
        let enricher = ComicInfoEnricher::new(Arc::new(FilenameEnricher));

        let e = enricher.enrich(&record(&path)).await;
        assert_eq!(e.signals.match_type, MatchType::ExactId);
        assert_eq!(e.metadata.series.as_deref(), Some("Batman"));
        assert_eq!(e.metadata.issue.as_deref(), Some("1"));
        assert_eq!(
            evaluate(&e.signals, &Default::default()).confidence,
            Confidence::High
        );
    }

    #[tokio::test]
    async fn test_partial_tags_fill_fallback_gaps() {
        let temp = TempDir::new().unwrap();
        let path = cbz(
            temp.path(),
            "Berserk v03.cbz",
            &[(
                "ComicInfo.xml",
                "<ComicInfo><Publisher>Dark Horse</Publisher><Manga>Yes</Manga></ComicInfo>",
            )],
        );
        let enricher = ComicInfoEnricher::new(Arc::new(FilenameEnricher));

        let e = enricher.enrich(&record(&path)).await;
        assert_eq!(e.signals.match_type, MatchType::None);
        assert_eq!(e.metadata.series.as_deref(), Some("Berserk"));
        assert_eq!(e.metadata.publisher.as_deref(), Some("Dark Horse"));
        assert_eq!(e.content_class, Some(ContentClass::Manga));
    }

    #[tokio::test]
    async fn test_unreadable_archive_falls_back() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("Batman 001.cbz");
        std::fs::write(&path, b"not a zip").unwrap();
        let enricher = ComicInfoEnricher::new(Arc::new(FilenameEnricher));

        let e = enricher.enrich(&record(&path)).await;
        assert!(e.signals.filename_parsed);
        assert_eq!(e.metadata.provider.as_deref(), Some("filename"));
    }
}
