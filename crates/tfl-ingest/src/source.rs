//! Row readers for plain CSV and JSON-lines sources

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::error::{IngestError, Result};
use crate::extract::SourceFormat;

/// One raw input row keyed by source column name.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    /// 1-based line number of the row in its source file.
    pub line: u64,
    pub fields: Map<String, Value>,
}

/// Streaming reader yielding one [`RawRow`] at a time.
pub enum RowReader {
    Csv {
        path: PathBuf,
        headers: Vec<String>,
        records: csv::StringRecordsIntoIter<BufReader<File>>,
    },
    Jsonl {
        path: PathBuf,
        lines: Lines<BufReader<File>>,
        line: u64,
    },
}

impl RowReader {
    /// Opens an uncompressed source file.
    pub fn open(path: &Path, format: SourceFormat) -> Result<Self> {
        let file = File::open(path).map_err(|e| IngestError::decode(path, e))?;
        let reader = BufReader::new(file);

        if format.is_csv() {
            let mut csv_reader = csv::ReaderBuilder::new()
                .has_headers(true)
                .flexible(false)
                .from_reader(reader);
            let headers = csv_reader
                .headers()
                .map_err(|e| csv_error(path, e))?
                .iter()
                .map(|h| h.trim().to_string())
                .collect();
            Ok(RowReader::Csv {
                path: path.to_path_buf(),
                headers,
                records: csv_reader.into_records(),
            })
        } else {
            Ok(RowReader::Jsonl {
                path: path.to_path_buf(),
                lines: reader.lines(),
                line: 0,
            })
        }
    }
}

impl Iterator for RowReader {
    type Item = Result<RawRow>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            RowReader::Csv {
                path,
                headers,
                records,
            } => {
                let record = match records.next()? {
                    Ok(record) => record,
                    Err(e) => return Some(Err(csv_error(path, e))),
                };
                let line = record.position().map(|p| p.line()).unwrap_or_default();
                let fields = headers
                    .iter()
                    .zip(record.iter())
                    .map(|(name, value)| {
                        let value = if value.is_empty() {
                            Value::Null
                        } else {
                            Value::String(value.to_string())
                        };
                        (name.clone(), value)
                    })
                    .collect();
                Some(Ok(RawRow { line, fields }))
            },
            RowReader::Jsonl { path, lines, line } => loop {
                let text = match lines.next()? {
                    Ok(text) => text,
                    Err(e) => return Some(Err(IngestError::decode(path.as_path(), e))),
                };
                *line += 1;
                if text.trim().is_empty() {
                    continue;
                }
                let parsed = match serde_json::from_str::<Value>(&text) {
                    Ok(Value::Object(fields)) => Ok(RawRow {
                        line: *line,
                        fields,
                    }),
                    Ok(_) => Err(IngestError::decode(
                        path.as_path(),
                        std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            format!("line {line}: expected a JSON object"),
                        ),
                    )),
                    Err(e) => Err(IngestError::decode(
                        path.as_path(),
                        std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            format!("line {line}: {e}"),
                        ),
                    )),
                };
                return Some(parsed);
            },
        }
    }
}

fn csv_error(path: &Path, err: csv::Error) -> IngestError {
    IngestError::decode(path, std::io::Error::new(std::io::ErrorKind::InvalidData, err))
}
