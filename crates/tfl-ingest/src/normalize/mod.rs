//! Record normalization
//!
//! Maps raw source columns onto staging columns and types each value. Missing
//! values become NULL; a row is never dropped. A bad key, timestamp or
//! coordinate aborts the batch, while a malformed nested document only nulls
//! that field.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;
use tracing::warn;

use crate::error::{IngestError, Result};
use crate::models::{AccidentRecord, ColumnSlots, StagingColumn};
use crate::source::RawRow;

pub mod documents;

use documents::{parse_document, DocumentKind};

/// Source column name to staging column. Columns not listed here (the API's
/// `$type`, the `year` tag added at fetch time, ...) are dropped.
pub static FIELD_MAPPING: &[(&str, StagingColumn)] = &[
    ("id", StagingColumn::AccidentId),
    ("date", StagingColumn::AccidentDate),
    ("accident_id", StagingColumn::AccidentId),
    ("lat", StagingColumn::Lat),
    ("lon", StagingColumn::Lon),
    ("location", StagingColumn::Location),
    ("accident_date", StagingColumn::AccidentDate),
    ("severity", StagingColumn::Severity),
    ("borough", StagingColumn::Borough),
    ("casualties", StagingColumn::Casualties),
    ("vehicles", StagingColumn::Vehicles),
];

pub fn map_field(name: &str) -> Option<StagingColumn> {
    FIELD_MAPPING
        .iter()
        .find(|(source, _)| *source == name)
        .map(|(_, column)| *column)
}

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Counters collected while normalizing one source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeStats {
    pub rows: u64,
    pub malformed_documents: u64,
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    source: String,
}

impl Normalizer {
    /// `source` labels records in errors and warnings, usually the file name.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// Normalizes one row. Also returns how many nested documents were
    /// malformed and replaced by NULL.
    pub fn normalize(&self, row: &RawRow) -> Result<(AccidentRecord, u64)> {
        let label = format!("{} line {}", self.source, row.line);

        let mut slots = ColumnSlots::default();
        for (name, value) in &row.fields {
            if let Some(column) = map_field(name) {
                slots.set(column, value);
            }
        }

        let mut record = AccidentRecord::new(parse_id(slots.get(StagingColumn::AccidentId), &label)?);

        record.lat = parse_coordinate(slots.get(StagingColumn::Lat), &label, "lat")?;
        record.lon = parse_coordinate(slots.get(StagingColumn::Lon), &label, "lon")?;
        record.location = parse_text(slots.get(StagingColumn::Location));
        record.accident_date = parse_timestamp(slots.get(StagingColumn::AccidentDate), &label)?;
        record.severity = parse_text(slots.get(StagingColumn::Severity));
        record.borough = parse_text(slots.get(StagingColumn::Borough));

        let mut malformed = 0;
        for (column, kind) in [
            (StagingColumn::Casualties, DocumentKind::Casualties),
            (StagingColumn::Vehicles, DocumentKind::Vehicles),
        ] {
            let Some(raw) = slots.get(column) else { continue };
            let doc = match parse_document(raw, kind) {
                Ok(doc) => doc,
                Err(reason) => {
                    warn!(
                        record = %label,
                        accident_id = record.accident_id,
                        field = column.name(),
                        %reason,
                        "Malformed nested document, storing NULL"
                    );
                    malformed += 1;
                    None
                },
            };
            match column {
                StagingColumn::Casualties => record.casualties = doc,
                _ => record.vehicles = doc,
            }
        }

        Ok((record, malformed))
    }

    /// Lazily normalizes `rows`. The adapter stops after the first error.
    pub fn normalize_rows<I>(self, rows: I) -> NormalizedRows<I>
    where
        I: Iterator<Item = Result<RawRow>>,
    {
        NormalizedRows {
            normalizer: self,
            rows,
            stats: NormalizeStats::default(),
            done: false,
        }
    }
}

pub struct NormalizedRows<I> {
    normalizer: Normalizer,
    rows: I,
    stats: NormalizeStats,
    done: bool,
}

impl<I> NormalizedRows<I> {
    pub fn stats(&self) -> NormalizeStats {
        self.stats
    }
}

impl<I> Iterator for NormalizedRows<I>
where
    I: Iterator<Item = Result<RawRow>>,
{
    type Item = Result<AccidentRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let result = match self.rows.next()? {
            Ok(row) => self.normalizer.normalize(&row),
            Err(e) => Err(e),
        };
        match result {
            Ok((record, malformed)) => {
                self.stats.rows += 1;
                self.stats.malformed_documents += malformed;
                Some(Ok(record))
            },
            Err(e) => {
                self.done = true;
                Some(Err(e))
            },
        }
    }
}

fn parse_id(value: Option<&Value>, label: &str) -> Result<i32> {
    let value = match value {
        None | Some(Value::Null) => {
            return Err(IngestError::normalization(label, "accident_id", "missing"))
        },
        Some(value) => value,
    };
    let parsed = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    parsed
        .and_then(|id| i32::try_from(id).ok())
        .ok_or_else(|| {
            IngestError::normalization(label, "accident_id", format!("not an integer: {value}"))
        })
}

fn parse_coordinate(value: Option<&Value>, label: &str, field: &'static str) -> Result<Option<f64>> {
    let parsed = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => return Ok(None),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(Value::Number(n)) => n.as_f64(),
        Some(_) => None,
    };
    match parsed {
        Some(v) if v.is_finite() => Ok(Some(v)),
        _ => Err(IngestError::normalization(
            label,
            field,
            format!("not a finite number: {}", value.unwrap_or(&Value::Null)),
        )),
    }
}

fn parse_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn parse_timestamp(value: Option<&Value>, label: &str) -> Result<Option<NaiveDateTime>> {
    let text = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) => s.trim(),
        Some(other) => {
            return Err(IngestError::normalization(
                label,
                "accident_date",
                format!("expected a timestamp string, got {other}"),
            ))
        },
    };
    if text.is_empty() {
        return Ok(None);
    }
    parse_timestamp_str(text).map(Some).ok_or_else(|| {
        IngestError::normalization(label, "accident_date", format!("unrecognised timestamp {text:?}"))
    })
}

/// Parses the timestamp shapes the feed and its CSV export produce. Values
/// with an offset are converted to UTC.
pub fn parse_timestamp_str(text: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_utc());
    }
    for format in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(text, DATE_FORMAT)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}
