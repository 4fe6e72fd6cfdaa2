//! Checkpoint blob checksums
//!
//! CRC32 detects accidental corruption quickly. It offers no protection
//! against deliberate tampering.

use pserver_core::{Error, Result};

/// Hex-encoded CRC32 of `data`
pub fn checksum(data: &[u8]) -> String {
    format!("{:08x}", crc32fast::hash(data))
}

/// Verify that `data` read from `path` matches the recorded checksum
pub fn verify(path: &str, data: &[u8], expected: &str) -> Result<()> {
    let computed = checksum(data);
    if !computed.eq_ignore_ascii_case(expected.trim()) {
        return Err(Error::ChecksumMismatch {
            path: path.to_string(),
            expected: expected.to_string(),
            computed,
        });
    }
    Ok(())
}
