//! File-to-COPY tests that need no database
//!
//! Snapshots are discovered, extracted, read and normalized for real; the
//! encoded chunks are captured by an in-memory sink.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::{csv_snapshot, jsonl_snapshot, write_gz, CSV_HEADER};
use serde_json::json;
use tempfile::TempDir;
use tfl_ingest::extract::{discover_sources, extract_gzip};
use tfl_ingest::loader::{BatchLoader, CopySink};
use tfl_ingest::normalize::Normalizer;
use tfl_ingest::source::RowReader;
use tfl_ingest::IngestError;

#[derive(Debug, Default)]
struct Captured {
    chunks: Vec<String>,
    committed: bool,
    rollbacks: usize,
}

#[derive(Clone, Default)]
struct CapturingSink(Arc<Mutex<Captured>>);

#[async_trait]
impl CopySink for CapturingSink {
    async fn copy_chunk(&mut self, _columns: &[&str], data: &[u8]) -> Result<u64, sqlx::Error> {
        let text = String::from_utf8(data.to_vec()).unwrap();
        let rows = text.lines().count() as u64;
        self.0.lock().unwrap().chunks.push(text);
        Ok(rows)
    }

    async fn commit(&mut self) -> Result<(), sqlx::Error> {
        self.0.lock().unwrap().committed = true;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), sqlx::Error> {
        self.0.lock().unwrap().rollbacks += 1;
        Ok(())
    }
}

/// Runs discovery through loading the way the pipeline does, minus archival.
async fn load_dir(dir: &Path, sink: CapturingSink, chunk_size: usize) -> tfl_ingest::Result<u64> {
    let mut loader = BatchLoader::new(sink, chunk_size);
    for source in discover_sources(dir)? {
        let (path, format) = if source.format.is_compressed() {
            (extract_gzip(&source.path)?, source.format.decompressed())
        } else {
            (source.path.clone(), source.format)
        };
        let rows = Normalizer::new(source.file_name()).normalize_rows(RowReader::open(&path, format)?);
        if let Err(e) = loader.load(rows).await {
            loader.rollback().await;
            return Err(e);
        }
    }
    Ok(loader.finish().await?.rows)
}

#[tokio::test]
async fn test_csv_snapshot_becomes_copy_rows() {
    let dir = TempDir::new().unwrap();
    let csv = format!(
        "{CSV_HEADER}\n\
         345979,51.570865,-0.231959,\"On Edgware Road, Junction\",2019-01-30T23:30:00Z,Slight,Barnet,\
         \"[{{'age': 31, 'class': 'Driver', '$type': 'x'}}]\",\"[{{'type': 'Car'}}]\"\n"
    );
    write_gz(dir.path(), "tfl_accidents_2019.csv.gz", &csv);

    let sink = CapturingSink::default();
    let rows = load_dir(dir.path(), sink.clone(), 100).await.unwrap();

    assert_eq!(rows, 1);
    let captured = sink.0.lock().unwrap();
    assert!(captured.committed);
    let fields: Vec<&str> = captured.chunks[0].trim_end_matches('\n').split('\t').collect();
    assert_eq!(fields.len(), 9);
    assert_eq!(fields[0], "345979");
    assert_eq!(fields[1], "51.570865");
    assert_eq!(fields[3], "On Edgware Road, Junction");
    assert_eq!(fields[4], "2019-01-30 23:30:00");
    assert_eq!(fields[6], "Barnet");
    let casualties: serde_json::Value = serde_json::from_str(fields[7]).unwrap();
    assert_eq!(
        casualties,
        json!([{"age": 31, "class": "Driver", "sexOfCasualty": null}])
    );
    assert_eq!(fields[8], r#"[{"type":"Car"}]"#);
}

#[tokio::test]
async fn test_files_load_in_name_order_with_shared_chunking() {
    let dir = TempDir::new().unwrap();
    write_gz(dir.path(), "b_2020.csv.gz", &csv_snapshot(100, 3));
    let jsonl = jsonl_snapshot(&[json!({"id": 1}), json!({"id": 2})]);
    std::fs::write(dir.path().join("a_2019.jsonl"), jsonl).unwrap();

    let sink = CapturingSink::default();
    let rows = load_dir(dir.path(), sink.clone(), 2).await.unwrap();

    assert_eq!(rows, 5);
    let captured = sink.0.lock().unwrap();
    let ids: Vec<&str> = captured
        .chunks
        .iter()
        .flat_map(|chunk| chunk.lines())
        .map(|line| line.split('\t').next().unwrap())
        .collect();
    assert_eq!(ids, vec!["1", "2", "100", "101", "102"]);
    // A chunk never spans two files.
    assert_eq!(captured.chunks.len(), 3);
}

#[tokio::test]
async fn test_missing_values_are_copy_nulls() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("sparse.jsonl"), "{\"id\": 9}\n\n").unwrap();

    let sink = CapturingSink::default();
    load_dir(dir.path(), sink.clone(), 10).await.unwrap();

    let captured = sink.0.lock().unwrap();
    assert_eq!(captured.chunks[0], "9\t\\N\t\\N\t\\N\t\\N\t\\N\t\\N\t\\N\t\\N\n");
}

#[tokio::test]
async fn test_corrupt_gzip_stops_before_any_chunk() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("broken.csv.gz"), b"not gzip at all").unwrap();

    let sink = CapturingSink::default();
    let err = load_dir(dir.path(), sink.clone(), 10).await.unwrap_err();

    assert!(matches!(err, IngestError::Decode { .. }));
    assert_eq!(err.stage(), "extraction");
    let captured = sink.0.lock().unwrap();
    assert!(captured.chunks.is_empty());
    assert!(!captured.committed);
}

#[tokio::test]
async fn test_bad_row_rolls_back_and_names_the_line() {
    let dir = TempDir::new().unwrap();
    let csv = format!("{CSV_HEADER}\n1,51.5,-0.1,,,,,,\n2,north,-0.1,,,,,,\n");
    std::fs::write(dir.path().join("coords.csv"), csv).unwrap();

    let sink = CapturingSink::default();
    let err = load_dir(dir.path(), sink.clone(), 10).await.unwrap_err();

    match &err {
        IngestError::Normalization { record, field, .. } => {
            assert_eq!(record, "coords.csv line 3");
            assert_eq!(*field, "lat");
        },
        other => panic!("expected a normalization error, got {other:?}"),
    }
    let captured = sink.0.lock().unwrap();
    assert!(captured.chunks.is_empty());
    assert!(captured.rollbacks >= 1);
    assert!(!captured.committed);
}
