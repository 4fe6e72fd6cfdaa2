//! Binary encoding of checkpoint snapshots
//!
//! Layout (20-byte header + payload):
//! - Bytes 0-3:   Magic "PSCK"
//! - Bytes 4-7:   Format version (u32 little-endian)
//! - Bytes 8-11:  Entry count (u32 little-endian)
//! - Bytes 12-19: Payload length (u64 little-endian)
//! - Bytes 20+:   bincode-encoded `Vec<ParameterCheckpoint>`

use bytes::{BufMut, Bytes, BytesMut};
use pserver_core::{CheckpointSnapshot, Error, ParameterCheckpoint, Result};

/// Magic bytes for checkpoint blobs
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"PSCK";

/// Checkpoint format version
pub const CHECKPOINT_VERSION: u32 = 1;

/// Size of the fixed blob header
pub const HEADER_SIZE: usize = 20;

/// Encode a snapshot into a self-describing blob
pub fn encode(snapshot: &[ParameterCheckpoint]) -> Result<Bytes> {
    let payload = bincode::serialize(snapshot)?;
    let entry_count = u32::try_from(snapshot.len())
        .map_err(|_| Error::Encoding(format!("too many entries: {}", snapshot.len())))?;

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_slice(&CHECKPOINT_MAGIC);
    buf.put_u32_le(CHECKPOINT_VERSION);
    buf.put_u32_le(entry_count);
    buf.put_u64_le(payload.len() as u64);
    buf.put_slice(&payload);

    Ok(buf.freeze())
}

/// Decode a blob produced by [`encode`]
///
/// Fails with `Error::Encoding` if the header does not match the payload.
pub fn decode(data: &[u8]) -> Result<CheckpointSnapshot> {
    if data.len() < HEADER_SIZE {
        return Err(Error::Encoding(format!(
            "checkpoint too small: {} bytes, header is {}",
            data.len(),
            HEADER_SIZE
        )));
    }

    let (header, payload) = data.split_at(HEADER_SIZE);
    if header[0..4] != CHECKPOINT_MAGIC {
        return Err(Error::Encoding("invalid checkpoint magic".to_string()));
    }

    let version = read_u32(&header[4..8]);
    if version != CHECKPOINT_VERSION {
        return Err(Error::Encoding(format!(
            "unsupported checkpoint version {}, expected {}",
            version, CHECKPOINT_VERSION
        )));
    }

    let entry_count = read_u32(&header[8..12]) as usize;
    let declared_len = read_u64(&header[12..20]);
    if declared_len != payload.len() as u64 {
        return Err(Error::Encoding(format!(
            "payload length mismatch: declared {}, actual {}",
            declared_len,
            payload.len()
        )));
    }

    let snapshot: CheckpointSnapshot = bincode::deserialize(payload)?;
    if snapshot.len() != entry_count {
        return Err(Error::Encoding(format!(
            "entry count mismatch: declared {}, decoded {}",
            entry_count,
            snapshot.len()
        )));
    }

    Ok(snapshot)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}
