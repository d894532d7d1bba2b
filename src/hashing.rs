use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::error::Result;

/// Hex-encoded SHA-256 of a file's contents.
pub async fn calculate_hash(filepath: &Path) -> Result<String> {
    let mut reader = BufReader::with_capacity(64 * 1024, File::open(filepath).await?);
    let mut hasher = Sha256::new();
    loop {
        let block = reader.fill_buf().await?;
        if block.is_empty() {
            break;
        }
        hasher.update(block);
        let consumed = block.len();
        reader.consume(consumed);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compares a file against an expected hex digest, ignoring case and surrounding blanks.
pub async fn verify_sha256(filepath: &Path, expected: &str) -> Result<bool> {
    let actual = calculate_hash(filepath).await?;
    Ok(actual.eq_ignore_ascii_case(expected.trim()))
}
