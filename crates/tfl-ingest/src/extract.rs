//! Source discovery and gzip extraction
//!
//! Source snapshots live in the scratch directory as `*.csv.gz`, `*.csv`,
//! `*.jsonl.gz` or `*.jsonl`. Compressed snapshots are decoded to a sibling
//! file before reading.
//!
//! # Examples
//!
//! ```rust,ignore
//! use tfl_ingest::extract::{discover_sources, extract_gzip};
//!
//! for source in discover_sources("downloaded_data")? {
//!     if source.format.is_compressed() {
//!         let plain = extract_gzip(&source.path)?;
//!     }
//! }
//! ```

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use tracing::{debug, info};

use crate::error::{IngestError, Result};

const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    CsvGz,
    Csv,
    JsonlGz,
    Jsonl,
}

impl SourceFormat {
    /// Classifies a file by its name suffix.
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".csv.gz") {
            Some(SourceFormat::CsvGz)
        } else if name.ends_with(".csv") {
            Some(SourceFormat::Csv)
        } else if name.ends_with(".jsonl.gz") {
            Some(SourceFormat::JsonlGz)
        } else if name.ends_with(".jsonl") {
            Some(SourceFormat::Jsonl)
        } else {
            None
        }
    }

    pub fn is_compressed(self) -> bool {
        matches!(self, SourceFormat::CsvGz | SourceFormat::JsonlGz)
    }

    pub fn is_csv(self) -> bool {
        matches!(self, SourceFormat::CsvGz | SourceFormat::Csv)
    }

    /// Format of the file produced by [`extract_gzip`].
    pub fn decompressed(self) -> Self {
        match self {
            SourceFormat::CsvGz => SourceFormat::Csv,
            SourceFormat::JsonlGz => SourceFormat::Jsonl,
            plain => plain,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            SourceFormat::CsvGz => ".csv.gz",
            SourceFormat::Csv => ".csv",
            SourceFormat::JsonlGz => ".jsonl.gz",
            SourceFormat::Jsonl => ".jsonl",
        }
    }
}

/// A snapshot file found in the scratch directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub format: SourceFormat,
    /// File name without its format suffixes, e.g. `tfl_accidents_2019`.
    pub snapshot: String,
}

impl SourceFile {
    pub fn from_path(path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        let format = SourceFormat::detect(&path)?;
        let name = path.file_name()?.to_str()?;
        let snapshot = name[..name.len() - format.suffix().len()].to_string();
        Some(Self {
            path,
            format,
            snapshot,
        })
    }

    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.snapshot)
    }
}

/// Lists source snapshots in `dir`, sorted by file name.
///
/// Leftover `*.partial` files from an interrupted extraction are ignored.
pub fn discover_sources(dir: impl AsRef<Path>) -> Result<Vec<SourceFile>> {
    let dir = dir.as_ref();
    let mut sources = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(source) = SourceFile::from_path(entry.path()) {
            sources.push(source);
        }
    }

    // A plain file next to its compressed snapshot is a previous extraction
    // that the compressed file will overwrite.
    let compressed: Vec<(String, SourceFormat)> = sources
        .iter()
        .filter(|s| s.format.is_compressed())
        .map(|s| (s.snapshot.clone(), s.format.decompressed()))
        .collect();
    sources.retain(|s| {
        s.format.is_compressed()
            || !compressed
                .iter()
                .any(|(snapshot, format)| *snapshot == s.snapshot && *format == s.format)
    });

    sources.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));
    info!(dir = %dir.display(), count = sources.len(), "Discovered source files");
    Ok(sources)
}

/// Decodes a gzip file into a sibling file with the `.gz` suffix removed.
///
/// The output is written to `<target>.partial`, synced, then renamed into
/// place; the compressed input is deleted only after the rename. On a decode
/// failure the partial output is removed, the input is left untouched and
/// [`IngestError::Decode`] is returned.
pub fn extract_gzip(path: &Path) -> Result<PathBuf> {
    let target = path.with_extension("");
    let mut partial = target.clone().into_os_string();
    partial.push(PARTIAL_SUFFIX);
    let partial = PathBuf::from(partial);

    let written = match decode_to(path, &partial) {
        Ok(bytes) => bytes,
        Err(e) => {
            let _ = fs::remove_file(&partial);
            return Err(IngestError::decode(path, e));
        },
    };

    fs::rename(&partial, &target).map_err(|e| IngestError::decode(path, e))?;
    fs::remove_file(path)?;

    info!(
        source = %path.display(),
        target = %target.display(),
        bytes = written,
        "Extracted gzip file"
    );
    Ok(target)
}

fn decode_to(source: &Path, partial: &Path) -> io::Result<u64> {
    let input = BufReader::new(File::open(source)?);
    let mut decoder = MultiGzDecoder::new(input);
    let file = File::create(partial)?;
    let mut output = BufWriter::new(file);
    let written = io::copy(&mut decoder, &mut output)?;
    let file = output.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(written)
}

/// Decompress gzip-compressed data held in memory.
pub fn decompress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = MultiGzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| IngestError::decode("<memory>", e))?;
    debug!("Decompressed {} -> {} bytes", data.len(), decompressed.len());
    Ok(decompressed)
}

/// Gzip-compress data held in memory.
pub fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CSV: &str = "id,lat,lon\n1,51.5,-0.1\n2,51.6,-0.2\n";

    #[test]
    fn test_detect_format() {
        assert_eq!(SourceFormat::detect(Path::new("a.csv.gz")), Some(SourceFormat::CsvGz));
        assert_eq!(SourceFormat::detect(Path::new("a.CSV")), Some(SourceFormat::Csv));
        assert_eq!(SourceFormat::detect(Path::new("a.jsonl.gz")), Some(SourceFormat::JsonlGz));
        assert_eq!(SourceFormat::detect(Path::new("a.jsonl")), Some(SourceFormat::Jsonl));
        assert_eq!(SourceFormat::detect(Path::new("a.json")), None);
        assert_eq!(SourceFormat::detect(Path::new("a.csv.partial")), None);
    }

    #[test]
    fn test_snapshot_name() {
        let source = SourceFile::from_path("/tmp/tfl_accidents_2019.jsonl.gz").unwrap();
        assert_eq!(source.snapshot, "tfl_accidents_2019");
        assert_eq!(source.file_name(), "tfl_accidents_2019.jsonl.gz");
        assert_eq!(source.format.decompressed(), SourceFormat::Jsonl);
    }

    #[test]
    fn test_discover_sorted_and_filtered() {
        let dir = TempDir::new().unwrap();
        for name in ["b.csv.gz", "a.jsonl", "notes.txt", "c.csv.partial"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        fs::create_dir(dir.path().join("d.csv")).unwrap();

        let names: Vec<String> = discover_sources(dir.path())
            .unwrap()
            .iter()
            .map(|s| s.file_name().to_string())
            .collect();
        assert_eq!(names, vec!["a.jsonl", "b.csv.gz"]);
    }

    #[test]
    fn test_discover_prefers_compressed_snapshot() {
        let dir = TempDir::new().unwrap();
        for name in ["tfl_2019.csv.gz", "tfl_2019.csv", "tfl_2020.csv", "tfl_2019.jsonl"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }

        let names: Vec<String> = discover_sources(dir.path())
            .unwrap()
            .iter()
            .map(|s| s.file_name().to_string())
            .collect();
        assert_eq!(names, vec!["tfl_2019.csv.gz", "tfl_2019.jsonl", "tfl_2020.csv"]);
    }

    #[test]
    fn test_extract_replaces_compressed_file() {
        let dir = TempDir::new().unwrap();
        let gz = dir.path().join("tfl.csv.gz");
        fs::write(&gz, compress_gzip(CSV.as_bytes()).unwrap()).unwrap();

        let out = extract_gzip(&gz).unwrap();

        assert_eq!(out, dir.path().join("tfl.csv"));
        assert_eq!(fs::read_to_string(&out).unwrap(), CSV);
        assert!(!gz.exists());
        assert!(!dir.path().join("tfl.csv.partial").exists());
    }

    #[test]
    fn test_corrupt_input_leaves_no_partial_state() {
        let dir = TempDir::new().unwrap();
        let gz = dir.path().join("broken.csv.gz");
        let mut bytes = compress_gzip(CSV.as_bytes()).unwrap();
        bytes.truncate(bytes.len() / 2);
        fs::write(&gz, &bytes).unwrap();

        let err = extract_gzip(&gz).unwrap_err();

        assert!(matches!(err, IngestError::Decode { .. }));
        assert!(gz.exists());
        assert!(!dir.path().join("broken.csv").exists());
        assert!(!dir.path().join("broken.csv.partial").exists());
    }

    #[test]
    fn test_not_gzip_is_decode_error() {
        let dir = TempDir::new().unwrap();
        let gz = dir.path().join("plain.jsonl.gz");
        fs::write(&gz, b"{\"id\": 1}\n").unwrap();

        assert!(matches!(extract_gzip(&gz), Err(IngestError::Decode { .. })));
        assert!(gz.exists());
    }

    #[test]
    fn test_in_memory_roundtrip() {
        let packed = compress_gzip(b"hello").unwrap();
        assert_eq!(decompress_gzip(&packed).unwrap(), b"hello");
        assert!(decompress_gzip(b"nope").is_err());
    }
}
