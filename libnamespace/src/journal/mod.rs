//! Write-ahead journal: an ordered, checksummed log of namespace mutations
//! plus periodic checkpoints of the full state.

pub mod entry;
pub mod format;
mod store;

use std::io;

pub use entry::{
    Checkpoint, CompleteFileOp, CreateOp, DeleteOp, FreeOp, JournalEntry, JournalOp,
    LoadMetadataOp, MountOp, NewBlockOp, PersistStateOp, RenameOp, SetAttributeOp, UnmountOp,
};
pub use store::{Journal, Recovered};

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("journal i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("journal codec failed: {0}")]
    Codec(#[from] bincode::Error),
    #[error("journal corrupted at offset {offset}: {reason}")]
    Corrupted { offset: u64, reason: String },
    #[error("journal sequence gap: expected {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },
    #[error("journal replay mismatch: {0}")]
    ReplayMismatch(String),
}
