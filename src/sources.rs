use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::IngestError;
use crate::locale::{resolve_locale, UnresolvedLog};
use crate::merge::SourceTable;
use crate::models::{LocaleEncoding, LocaleKind, ResolvedRecord, Source};
use crate::taxonomy::canonicalize;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "layout", rename_all = "lowercase")]
pub enum Layout {
    Wide {
        #[serde(default)]
        date_prefix: Option<String>,
    },
    Long {
        date_column: String,
        value_column: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub source: Source,
    pub path: PathBuf,
    #[serde(flatten)]
    pub layout: Layout,
    pub entity_column: String,
    pub locale_column: String,
    pub locale_encoding: LocaleEncoding,
}

impl SourceSpec {
    pub fn platform_default(source: Source, path: impl Into<PathBuf>) -> Self {
        let long = |date: &str, value: &str| Layout::Long {
            date_column: date.to_string(),
            value_column: value.to_string(),
        };
        let (layout, locale_column, locale_encoding) = match source {
            Source::Wikipedia => (Layout::Wide { date_prefix: None }, "lang", LocaleEncoding::Language),
            Source::Flickr => (long("date_taken", "photos"), "country", LocaleEncoding::CountryName),
            Source::Youtube => (long("published_date", "videos"), "language", LocaleEncoding::Language),
            Source::Inaturalist => (
                long("observed_on", "observations"),
                "country",
                LocaleEncoding::CountryName,
            ),
            Source::Gbif => (long("eventDate", "occurrences"), "countryCode", LocaleEncoding::Iso2),
            Source::Facebook => (
                Layout::Wide {
                    date_prefix: Some("X".to_string()),
                },
                "country",
                LocaleEncoding::CountryName,
            ),
            Source::Instagram => (long("date", "posts"), "country", LocaleEncoding::Iso2),
            Source::Reddit => (long("date", "mentions"), "language", LocaleEncoding::Language),
        };

        Self {
            source,
            path: path.into(),
            layout,
            entity_column: "species".to_string(),
            locale_column: locale_column.to_string(),
            locale_encoding,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub entity: String,
    pub locale: String,
    pub date: NaiveDate,
    pub count: f64,
}

pub trait SourceAdapter {
    fn source(&self) -> Source;

    fn locale_encoding(&self) -> LocaleEncoding;

    fn read_raw(&self, visit: &mut dyn FnMut(RawRecord)) -> Result<(), IngestError>;

    fn read_canonical(
        &self,
        kind: LocaleKind,
        unresolved: &UnresolvedLog,
    ) -> Result<SourceTable, IngestError> {
        let source = self.source();
        let encoding = self.locale_encoding();
        let mut table = SourceTable::new(source);
        let mut raw_rows = 0usize;

        self.read_raw(&mut |raw| {
            raw_rows += 1;
            let locales = resolve_locale(&raw.locale, encoding, kind);
            if locales.is_empty() {
                unresolved.note(source.tag(), &raw.locale);
                return;
            }
            let entity = canonicalize(&raw.entity);
            for locale in locales {
                table.insert(ResolvedRecord {
                    entity: entity.clone(),
                    locale,
                    date: raw.date,
                    count: raw.count,
                });
            }
        })?;

        info!(
            %source,
            raw_rows,
            pairs = table.pair_count(),
            cells = table.cell_count(),
            "read source extract"
        );
        Ok(table)
    }
}

pub fn adapter_for(spec: &SourceSpec) -> Box<dyn SourceAdapter + Send + Sync> {
    match &spec.layout {
        Layout::Wide { date_prefix } => Box::new(WideAdapter {
            spec: spec.clone(),
            date_prefix: date_prefix.clone(),
        }),
        Layout::Long {
            date_column,
            value_column,
        } => Box::new(LongAdapter {
            spec: spec.clone(),
            date_column: date_column.clone(),
            value_column: value_column.clone(),
        }),
    }
}

pub struct WideAdapter {
    spec: SourceSpec,
    date_prefix: Option<String>,
}

impl SourceAdapter for WideAdapter {
    fn source(&self) -> Source {
        self.spec.source
    }

    fn locale_encoding(&self) -> LocaleEncoding {
        self.spec.locale_encoding
    }

    fn read_raw(&self, visit: &mut dyn FnMut(RawRecord)) -> Result<(), IngestError> {
        let spec = &self.spec;
        let mut reader = open(&spec.path)?;
        let headers = headers(&mut reader, &spec.path)?;
        let entity_idx = column_index(spec, &headers, &spec.entity_column)?;
        let locale_idx = column_index(spec, &headers, &spec.locale_column)?;

        let mut date_columns = Vec::new();
        for (idx, header) in headers.iter().enumerate() {
            if idx == entity_idx || idx == locale_idx {
                continue;
            }
            let token = match self.date_prefix.as_deref() {
                Some(prefix) => match header.strip_prefix(prefix) {
                    Some(token) => token,
                    None => continue,
                },
                None => header,
            };
            let date = parse_date_token(token).ok_or_else(|| {
                schema_mismatch(spec, format!("column '{header}' is not a date"))
            })?;
            date_columns.push((idx, date));
        }
        if date_columns.is_empty() {
            return Err(schema_mismatch(spec, "no date columns".to_string()));
        }
        debug!(source = %spec.source, columns = date_columns.len(), "wide extract dates");

        let mut row = StringRecord::new();
        while read_row(&mut reader, &mut row, &spec.path)? {
            let line = row.position().map(|pos| pos.line()).unwrap_or(0);
            let entity = row.get(entity_idx).unwrap_or_default();
            let locale = row.get(locale_idx).unwrap_or_default();
            for &(idx, date) in &date_columns {
                if let Some(count) = parse_count(spec.source, line, row.get(idx))? {
                    visit(RawRecord {
                        entity: entity.to_string(),
                        locale: locale.to_string(),
                        date,
                        count,
                    });
                }
            }
        }
        Ok(())
    }
}

pub struct LongAdapter {
    spec: SourceSpec,
    date_column: String,
    value_column: String,
}

impl SourceAdapter for LongAdapter {
    fn source(&self) -> Source {
        self.spec.source
    }

    fn locale_encoding(&self) -> LocaleEncoding {
        self.spec.locale_encoding
    }

    fn read_raw(&self, visit: &mut dyn FnMut(RawRecord)) -> Result<(), IngestError> {
        let spec = &self.spec;
        let mut reader = open(&spec.path)?;
        let headers = headers(&mut reader, &spec.path)?;
        let entity_idx = column_index(spec, &headers, &spec.entity_column)?;
        let locale_idx = column_index(spec, &headers, &spec.locale_column)?;
        let date_idx = column_index(spec, &headers, &self.date_column)?;
        let value_idx = column_index(spec, &headers, &self.value_column)?;

        let mut row = StringRecord::new();
        while read_row(&mut reader, &mut row, &spec.path)? {
            let line = row.position().map(|pos| pos.line()).unwrap_or(0);
            let raw_date = row.get(date_idx).unwrap_or_default();
            let date = parse_date_token(raw_date).ok_or_else(|| {
                schema_mismatch(spec, format!("undatable value {raw_date:?} at line {line}"))
            })?;
            if let Some(count) = parse_count(spec.source, line, row.get(value_idx))? {
                visit(RawRecord {
                    entity: row.get(entity_idx).unwrap_or_default().to_string(),
                    locale: row.get(locale_idx).unwrap_or_default().to_string(),
                    date,
                    count,
                });
            }
        }
        Ok(())
    }
}

// YYYY-MM-DD, YYYY.MM.DD, YYYY_MM_DD, YYYYMMDD, YYYY-MM and ISO timestamps.
pub fn parse_date_token(token: &str) -> Option<NaiveDate> {
    let token = token.trim();
    for format in ["%Y-%m-%d", "%Y.%m.%d", "%Y_%m_%d", "%Y%m%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(token, format) {
            return Some(date);
        }
    }
    if let Some(prefix) = token.get(..10) {
        if token.len() > 10 && token[10..].starts_with(['T', ' ']) {
            if let Ok(date) = NaiveDate::parse_from_str(prefix, "%Y-%m-%d") {
                return Some(date);
            }
        }
    }
    for format in ["%Y-%m", "%Y.%m"] {
        if let Ok(date) = NaiveDate::parse_from_str(&format!("{token}-01"), &format!("{format}-%d")) {
            return Some(date);
        }
    }
    None
}

fn parse_count(source: Source, line: u64, cell: Option<&str>) -> Result<Option<f64>, IngestError> {
    let value = cell.unwrap_or_default().trim();
    if value.is_empty() || value.eq_ignore_ascii_case("na") || value.eq_ignore_ascii_case("nan") {
        return Ok(None);
    }
    match value.parse::<f64>() {
        Ok(count) if count.is_finite() && count >= 0.0 => Ok(Some(count)),
        _ => Err(IngestError::InvalidCount {
            platform: source,
            line,
            value: value.to_string(),
        }),
    }
}

fn open(path: &Path) -> Result<csv::Reader<std::fs::File>, IngestError> {
    csv::ReaderBuilder::new()
        .flexible(false)
        .from_path(path)
        .map_err(|err| IngestError::Csv {
            path: path.to_path_buf(),
            err,
        })
}

fn headers(reader: &mut csv::Reader<std::fs::File>, path: &Path) -> Result<StringRecord, IngestError> {
    reader.headers().cloned().map_err(|err| IngestError::Csv {
        path: path.to_path_buf(),
        err,
    })
}

fn read_row(
    reader: &mut csv::Reader<std::fs::File>,
    row: &mut StringRecord,
    path: &Path,
) -> Result<bool, IngestError> {
    reader.read_record(row).map_err(|err| IngestError::Csv {
        path: path.to_path_buf(),
        err,
    })
}

fn column_index(spec: &SourceSpec, headers: &StringRecord, name: &str) -> Result<usize, IngestError> {
    headers
        .iter()
        .position(|header| header.trim() == name)
        .ok_or_else(|| schema_mismatch(spec, format!("missing column '{name}'")))
}

fn schema_mismatch(spec: &SourceSpec, reason: String) -> IngestError {
    IngestError::SchemaMismatch {
        platform: spec.source,
        path: spec.path.clone(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PairKey;
    use rstest::rstest;
    use std::io::Write;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn write_csv(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    #[rstest]
    #[case("2024-02-29", Some(date(2024, 2, 29)))]
    #[case("2024.02.03", Some(date(2024, 2, 3)))]
    #[case("20240203", Some(date(2024, 2, 3)))]
    #[case("2024_02_03", Some(date(2024, 2, 3)))]
    #[case("2024-02", Some(date(2024, 2, 1)))]
    #[case("2024-02-03T10:15:00Z", Some(date(2024, 2, 3)))]
    #[case("habitat", None)]
    #[case("2023-02-29", None)]
    fn parses_date_tokens(#[case] token: &str, #[case] expected: Option<NaiveDate>) {
        assert_eq!(parse_date_token(token), expected);
    }

    #[test]
    fn wide_extract_with_prefix_expands_languages() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(
            &dir,
            "facebook.csv",
            "species,country,note,X2024.01.01,X2024.01.02\n\
             Vespa velutina nigrithorax,France,x,3,\n\
             Procyon lotor,unknown,y,4,5\n",
        );
        let spec = SourceSpec::platform_default(Source::Facebook, path);
        let log = UnresolvedLog::default();
        let table = adapter_for(&spec)
            .read_canonical(LocaleKind::Country, &log)
            .unwrap();

        let pairs: Vec<_> = table.pairs().cloned().collect();
        assert_eq!(pairs, vec![PairKey::new("Vespa velutina", "FR")]);
        assert_eq!(table.cell_count(), 1);
        assert_eq!(log.count(), 1);
    }

    #[test]
    fn long_extract_cross_expands_languages() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(
            &dir,
            "reddit.csv",
            "species,language,date,mentions\n\
             Procyon lotor,nl,2024-03-01,2\n\
             Procyon lotor,nl,2024-03-02,NA\n",
        );
        let spec = SourceSpec::platform_default(Source::Reddit, path);
        let table = adapter_for(&spec)
            .read_canonical(LocaleKind::Country, &UnresolvedLog::default())
            .unwrap();
        let pairs: Vec<_> = table.pairs().cloned().collect();
        assert_eq!(
            pairs,
            vec![PairKey::new("Procyon lotor", "BE"), PairKey::new("Procyon lotor", "NL")]
        );
        assert_eq!(table.cell_count(), 2);
    }

    #[test]
    fn missing_columns_are_a_schema_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(&dir, "gbif.csv", "species,eventDate,occurrences\nA b,2024-01-01,1\n");
        let spec = SourceSpec::platform_default(Source::Gbif, path);
        let err = adapter_for(&spec)
            .read_canonical(LocaleKind::Country, &UnresolvedLog::default())
            .unwrap_err();
        assert!(matches!(err, IngestError::SchemaMismatch { platform: Source::Gbif, .. }));
    }

    #[test]
    fn undatable_wide_header_is_a_schema_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(&dir, "wikipedia.csv", "species,lang,2024-01-01,total\nA b,de,1,1\n");
        let spec = SourceSpec::platform_default(Source::Wikipedia, path);
        let err = adapter_for(&spec)
            .read_canonical(LocaleKind::Language, &UnresolvedLog::default())
            .unwrap_err();
        assert!(err.to_string().contains("column 'total' is not a date"));
    }

    #[test]
    fn negative_counts_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(
            &dir,
            "instagram.csv",
            "species,country,date,posts\nA b,DE,2024-01-01,-3\n",
        );
        let spec = SourceSpec::platform_default(Source::Instagram, path);
        let err = adapter_for(&spec)
            .read_canonical(LocaleKind::Country, &UnresolvedLog::default())
            .unwrap_err();
        assert!(matches!(err, IngestError::InvalidCount { line: 2, .. }));
    }
}
