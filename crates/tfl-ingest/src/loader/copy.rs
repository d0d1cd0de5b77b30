//! PostgreSQL COPY text-format encoding
//!
//! Rows are tab-separated, `\N` is NULL, and backslash, newline, carriage
//! return and tab inside values are backslash-escaped.

use std::fmt::Write as _;

use chrono::NaiveDateTime;
use serde_json::Value;

use crate::models::{AccidentRecord, STAGING_COLUMNS};

const NULL: &str = "\\N";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// A row that can be written in COPY text format.
pub trait CopyRow {
    /// Destination columns, in the order `write_fields` emits them.
    const COLUMNS: &'static [&'static str];

    fn write_fields(&self, out: &mut CopyRowWriter<'_>);
}

impl CopyRow for AccidentRecord {
    const COLUMNS: &'static [&'static str] = &STAGING_COLUMNS;

    fn write_fields(&self, out: &mut CopyRowWriter<'_>) {
        out.int(i64::from(self.accident_id));
        out.float(self.lat);
        out.float(self.lon);
        out.text(self.location.as_deref());
        out.timestamp(self.accident_date);
        out.text(self.severity.as_deref());
        out.text(self.borough.as_deref());
        out.json(self.casualties.as_ref());
        out.json(self.vehicles.as_ref());
    }
}

/// Field writer for a single row; separators are inserted automatically.
pub struct CopyRowWriter<'a> {
    buf: &'a mut String,
    fields: usize,
}

impl<'a> CopyRowWriter<'a> {
    fn new(buf: &'a mut String) -> Self {
        Self { buf, fields: 0 }
    }

    fn separator(&mut self) {
        if self.fields > 0 {
            self.buf.push('\t');
        }
        self.fields += 1;
    }

    pub fn null(&mut self) {
        self.separator();
        self.buf.push_str(NULL);
    }

    pub fn text(&mut self, value: Option<&str>) {
        match value {
            Some(v) => {
                self.separator();
                escape_into(self.buf, v);
            },
            None => self.null(),
        }
    }

    pub fn int(&mut self, value: i64) {
        self.separator();
        let _ = write!(self.buf, "{value}");
    }

    pub fn float(&mut self, value: Option<f64>) {
        let Some(v) = value else {
            return self.null();
        };
        self.separator();
        if v.is_nan() {
            self.buf.push_str("NaN");
        } else if v.is_infinite() {
            self.buf
                .push_str(if v > 0.0 { "Infinity" } else { "-Infinity" });
        } else {
            let _ = write!(self.buf, "{v}");
        }
    }

    pub fn timestamp(&mut self, value: Option<NaiveDateTime>) {
        match value {
            Some(ts) => {
                self.separator();
                let _ = write!(self.buf, "{}", ts.format(TIMESTAMP_FORMAT));
            },
            None => self.null(),
        }
    }

    /// JSON documents are written compactly; a JSON `null` is stored as SQL NULL.
    pub fn json(&mut self, value: Option<&Value>) {
        match value {
            Some(Value::Null) | None => self.null(),
            Some(doc) => {
                self.separator();
                escape_into(self.buf, &doc.to_string());
            },
        }
    }
}

pub(crate) fn escape_into(buf: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            '\\' => buf.push_str("\\\\"),
            '\n' => buf.push_str("\\n"),
            '\r' => buf.push_str("\\r"),
            '\t' => buf.push_str("\\t"),
            c => buf.push(c),
        }
    }
}

/// Accumulates encoded rows for one chunk.
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    data: String,
    rows: u64,
}

impl ChunkBuffer {
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            data: String::with_capacity(bytes),
            rows: 0,
        }
    }

    pub fn push<R: CopyRow>(&mut self, row: &R) {
        let mut writer = CopyRowWriter::new(&mut self.data);
        row.write_fields(&mut writer);
        debug_assert_eq!(writer.fields, R::COLUMNS.len());
        self.data.push('\n');
        self.rows += 1;
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_bytes()
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.rows = 0;
    }
}
