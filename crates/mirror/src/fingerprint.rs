//! Content fingerprints embedded in transcoded files.
//!
//! The fingerprint is the hex SHA-256 of the full source file. It is written
//! into the destination's own tags by the encoder, so retagging or touching
//! the destination does not invalidate it.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// Tag key holding the source fingerprint inside the destination container
pub const FINGERPRINT_TAG: &str = "mediamirror_fingerprint";

const READ_BUFFER: usize = 64 * 1024;

/// Reads the embedded fingerprint back out of a destination file
#[async_trait]
pub trait TagReader: Send + Sync {
    /// `Ok(None)` when the file carries no fingerprint tag
    async fn read_fingerprint(&self, path: &Path) -> Result<Option<String>>;
}

/// Hash a file on the blocking pool
pub async fn source_fingerprint(path: &Path) -> Result<String> {
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || fingerprint_file(&path))
        .await
        .context("Fingerprint task failed")?
}

/// Hex SHA-256 of the full file content
pub fn fingerprint_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .with_context(|| format!("Failed to open for fingerprinting: {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("Failed to read for fingerprinting: {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
