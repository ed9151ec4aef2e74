//! On-disk encoding of log records and checkpoints.
//!
//! ```text
//! log record:  [len u32 LE][crc32 u32 LE][bincode(JournalEntry); len bytes]
//! checkpoint:  [magic 4][version u16 LE][len u64 LE][crc32 u32 LE][bincode(Checkpoint)]
//! ```
//!
//! The record checksum covers the payload only. A record that runs past the
//! end of the file, or fails its checksum as the last record of the file, is
//! a torn write.

use serde::Serialize;

use super::JournalError;
use super::entry::{Checkpoint, JournalEntry, JournalOp};

pub const RECORD_HEADER_SIZE: usize = 8;
/// Records larger than this are treated as garbage lengths.
pub const MAX_RECORD_SIZE: usize = 256 * 1024 * 1024;

pub const CHECKPOINT_MAGIC: &[u8; 4] = b"NSCP";
pub const CHECKPOINT_VERSION: u16 = 1;
pub const CHECKPOINT_HEADER_SIZE: usize = 4 + 2 + 8 + 4;

// Encodes exactly like `JournalEntry` without cloning the op.
#[derive(Serialize)]
struct EntryRef<'a> {
    sequence: u64,
    op: &'a JournalOp,
}

pub fn encode_record(sequence: u64, op: &JournalOp) -> Result<Vec<u8>, JournalError> {
    let payload = bincode::serialize(&EntryRef { sequence, op })?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|&l| (l as usize) <= MAX_RECORD_SIZE)
        .ok_or_else(|| JournalError::Corrupted {
            offset: 0,
            reason: format!("record of {} bytes is too large", payload.len()),
        })?;
    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

#[derive(Debug)]
pub enum DecodeResult {
    /// A record and the number of bytes it occupied.
    Record(JournalEntry, usize),
    /// The remaining bytes do not hold a whole record.
    Torn,
    Corrupted(String),
    EndOfData,
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(b)
}

/// Decode the record at the start of `bytes`.
pub fn decode_record(bytes: &[u8]) -> DecodeResult {
    if bytes.is_empty() {
        return DecodeResult::EndOfData;
    }
    if bytes.len() < RECORD_HEADER_SIZE {
        return DecodeResult::Torn;
    }
    let len = read_u32(bytes, 0) as usize;
    if len > MAX_RECORD_SIZE {
        return DecodeResult::Corrupted(format!("record length {len} out of range"));
    }
    let total = RECORD_HEADER_SIZE + len;
    if bytes.len() < total {
        return DecodeResult::Torn;
    }
    let stored = read_u32(bytes, 4);
    let payload = &bytes[RECORD_HEADER_SIZE..total];
    let computed = crc32fast::hash(payload);
    if stored != computed {
        if bytes.len() == total {
            return DecodeResult::Torn;
        }
        return DecodeResult::Corrupted(format!(
            "crc mismatch: stored {stored:#010x}, computed {computed:#010x}"
        ));
    }
    match bincode::deserialize::<JournalEntry>(payload) {
        Ok(entry) => DecodeResult::Record(entry, total),
        Err(e) => DecodeResult::Corrupted(format!("undecodable record: {e}")),
    }
}

pub fn encode_checkpoint(checkpoint: &Checkpoint) -> Result<Vec<u8>, JournalError> {
    let payload = bincode::serialize(checkpoint)?;
    let mut buf = Vec::with_capacity(CHECKPOINT_HEADER_SIZE + payload.len());
    buf.extend_from_slice(CHECKPOINT_MAGIC);
    buf.extend_from_slice(&CHECKPOINT_VERSION.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

pub fn decode_checkpoint(bytes: &[u8]) -> Result<Checkpoint, JournalError> {
    let corrupted = |reason: String| JournalError::Corrupted { offset: 0, reason };
    if bytes.len() < CHECKPOINT_HEADER_SIZE {
        return Err(corrupted(format!(
            "checkpoint header too short: {} bytes",
            bytes.len()
        )));
    }
    if &bytes[0..4] != CHECKPOINT_MAGIC {
        return Err(corrupted("checkpoint magic mismatch".into()));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != CHECKPOINT_VERSION {
        return Err(corrupted(format!(
            "unsupported checkpoint version {version}"
        )));
    }
    let mut len = [0u8; 8];
    len.copy_from_slice(&bytes[6..14]);
    let len = u64::from_le_bytes(len) as usize;
    let stored = read_u32(bytes, 14);
    let payload = bytes
        .get(CHECKPOINT_HEADER_SIZE..CHECKPOINT_HEADER_SIZE.saturating_add(len))
        .ok_or_else(|| corrupted(format!("checkpoint payload truncated, expected {len} bytes")))?;
    if crc32fast::hash(payload) != stored {
        return Err(corrupted("checkpoint crc mismatch".into()));
    }
    Ok(bincode::deserialize(payload)?)
}
