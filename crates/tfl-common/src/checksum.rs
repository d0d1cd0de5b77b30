//! SHA-256 checksums for archived artifacts

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Hex-encoded SHA-256 of a file's contents
pub fn compute_file_checksum(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    compute_checksum(&mut file)
}

/// Hex-encoded SHA-256 of everything `reader` yields
pub fn compute_checksum<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}
