//! Segment files and the checkpoint file inside the journal directory.

use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::JournalError;
use super::entry::{Checkpoint, JournalEntry, JournalOp};
use super::format::{self, DecodeResult};

const SEGMENT_PREFIX: &str = "log.";
const CHECKPOINT_FILE: &str = "checkpoint";
const CHECKPOINT_TMP: &str = "checkpoint.tmp";

fn segment_name(first_sequence: u64) -> String {
    format!("{SEGMENT_PREFIX}{first_sequence:020}")
}

/// What `open` found on disk.
#[derive(Debug, Default)]
pub struct Recovered {
    pub checkpoint: Option<Checkpoint>,
    /// Entries after the checkpoint, in sequence order.
    pub entries: Vec<JournalEntry>,
}

struct Writer {
    file: fs::File,
    segment: PathBuf,
    next_sequence: u64,
    since_checkpoint: u64,
}

/// The append side of the journal. One writer at a time; every append is
/// synced before it returns.
pub struct Journal {
    dir: PathBuf,
    writer: Mutex<Writer>,
    #[cfg(test)]
    fail_next_append: std::sync::atomic::AtomicBool,
}

async fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>, JournalError> {
    let mut out = Vec::new();
    let mut rd = fs::read_dir(dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(seq) = name
            .strip_prefix(SEGMENT_PREFIX)
            .and_then(|s| s.parse::<u64>().ok())
        {
            out.push((seq, entry.path()));
        }
    }
    out.sort();
    Ok(out)
}

/// Decode one segment. A torn tail is cut off when `is_last`.
async fn read_segment(path: &Path, is_last: bool) -> Result<Vec<JournalEntry>, JournalError> {
    let bytes = fs::read(path).await?;
    let mut entries = Vec::new();
    let mut offset = 0usize;
    loop {
        match format::decode_record(&bytes[offset..]) {
            DecodeResult::Record(entry, used) => {
                entries.push(entry);
                offset += used;
            }
            DecodeResult::EndOfData => break,
            DecodeResult::Torn if is_last => {
                warn!(
                    "discarding torn journal tail of {} bytes in {}",
                    bytes.len() - offset,
                    path.display()
                );
                let f = fs::OpenOptions::new().write(true).open(path).await?;
                f.set_len(offset as u64).await?;
                f.sync_all().await?;
                break;
            }
            DecodeResult::Torn => {
                return Err(JournalError::Corrupted {
                    offset: offset as u64,
                    reason: format!("{}: torn record before the last segment", path.display()),
                });
            }
            DecodeResult::Corrupted(reason) => {
                return Err(JournalError::Corrupted {
                    offset: offset as u64,
                    reason: format!("{}: {reason}", path.display()),
                });
            }
        }
    }
    Ok(entries)
}

impl Journal {
    /// Open (or initialise) the journal in `dir` and return everything that
    /// has to be replayed.
    pub async fn open(dir: impl AsRef<Path>) -> Result<(Journal, Recovered), JournalError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        let _ = fs::remove_file(dir.join(CHECKPOINT_TMP)).await;

        let checkpoint = match fs::read(dir.join(CHECKPOINT_FILE)).await {
            Ok(bytes) => Some(format::decode_checkpoint(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let base = checkpoint.as_ref().map_or(0, |c| c.last_sequence);

        let segments = list_segments(&dir).await?;
        let mut entries = Vec::new();
        let mut expected = base + 1;
        for (i, (_, path)) in segments.iter().enumerate() {
            for entry in read_segment(path, i + 1 == segments.len()).await? {
                if entry.sequence <= base {
                    continue;
                }
                if entry.sequence != expected {
                    return Err(JournalError::SequenceGap {
                        expected,
                        found: entry.sequence,
                    });
                }
                expected += 1;
                entries.push(entry);
            }
        }
        let next_sequence = expected;

        let segment = match segments.last() {
            Some((_, path)) => path.clone(),
            None => dir.join(segment_name(next_sequence)),
        };
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&segment)
            .await?;
        info!(
            "journal opened at {}: checkpoint through {base}, {} entries to replay",
            dir.display(),
            entries.len()
        );
        let journal = Journal {
            dir,
            writer: Mutex::new(Writer {
                file,
                segment,
                next_sequence,
                since_checkpoint: entries.len() as u64,
            }),
            #[cfg(test)]
            fail_next_append: std::sync::atomic::AtomicBool::new(false),
        };
        Ok((
            journal,
            Recovered {
                checkpoint,
                entries,
            },
        ))
    }

    /// Durably append `op`; returns its sequence number.
    pub async fn append(&self, op: &JournalOp) -> Result<u64, JournalError> {
        let mut w = self.writer.lock().await;
        #[cfg(test)]
        if self
            .fail_next_append
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            return Err(std::io::Error::other("injected append failure").into());
        }
        let sequence = w.next_sequence;
        let record = format::encode_record(sequence, op)?;
        w.file.write_all(&record).await?;
        w.file.sync_data().await?;
        w.next_sequence += 1;
        w.since_checkpoint += 1;
        debug!("journaled {} as {sequence}", op.name());
        Ok(sequence)
    }

    /// Make the next `append` fail with an I/O error.
    #[cfg(test)]
    pub(crate) fn fail_next_append(&self) {
        self.fail_next_append
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub async fn last_sequence(&self) -> u64 {
        self.writer.lock().await.next_sequence - 1
    }

    pub async fn entries_since_checkpoint(&self) -> u64 {
        self.writer.lock().await.since_checkpoint
    }

    /// Persist `checkpoint`, which must cover every appended entry, then
    /// start a fresh segment and drop the covered ones.
    pub async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), JournalError> {
        let mut w = self.writer.lock().await;
        let last = w.next_sequence - 1;
        if checkpoint.last_sequence != last {
            return Err(JournalError::ReplayMismatch(format!(
                "checkpoint through {} but journal is at {last}",
                checkpoint.last_sequence
            )));
        }
        let bytes = format::encode_checkpoint(checkpoint)?;
        let tmp = self.dir.join(CHECKPOINT_TMP);
        let mut f = fs::File::create(&tmp).await?;
        f.write_all(&bytes).await?;
        f.sync_all().await?;
        drop(f);
        fs::rename(&tmp, self.dir.join(CHECKPOINT_FILE)).await?;
        fs::File::open(&self.dir).await?.sync_all().await?;

        let segment = self.dir.join(segment_name(w.next_sequence));
        if segment != w.segment {
            w.file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&segment)
                .await?;
            w.segment = segment;
        }
        for (_, path) in list_segments(&self.dir).await? {
            if path != w.segment {
                fs::remove_file(&path).await?;
            }
        }
        w.since_checkpoint = 0;
        info!(
            "checkpoint written through sequence {last} ({} inodes)",
            checkpoint.inodes.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::entry::{DeleteOp, NewBlockOp};

    fn op(id: u64) -> JournalOp {
        JournalOp::Delete(DeleteOp {
            path: format!("/f{id}"),
            id,
            op_time_ms: 1,
        })
    }

    fn checkpoint(last_sequence: u64) -> Checkpoint {
        Checkpoint {
            last_sequence,
            next_inode_id: 1,
            next_block_id: 1,
            inodes: Vec::new(),
            mounts: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_reopen_returns_entries_in_order() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (journal, rec) = Journal::open(dir.path()).await.unwrap();
            assert!(rec.checkpoint.is_none() && rec.entries.is_empty());
            for i in 1..=3 {
                assert_eq!(journal.append(&op(i)).await.unwrap(), i);
            }
        }
        let (journal, rec) = Journal::open(dir.path()).await.unwrap();
        let seqs: Vec<u64> = rec.entries.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(rec.entries[1].op, op(2));
        assert_eq!(journal.append(&op(4)).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (journal, _) = Journal::open(dir.path()).await.unwrap();
            journal.append(&op(1)).await.unwrap();
            journal.append(&op(2)).await.unwrap();
        }
        let (_, path) = list_segments(dir.path()).await.unwrap().pop().unwrap();
        let len = std::fs::metadata(&path).unwrap().len();
        let f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(len - 3).unwrap();
        drop(f);

        let (journal, rec) = Journal::open(dir.path()).await.unwrap();
        assert_eq!(rec.entries.len(), 1);
        assert_eq!(journal.append(&op(9)).await.unwrap(), 2);
        drop(journal);
        let (_, rec) = Journal::open(dir.path()).await.unwrap();
        assert_eq!(rec.entries.len(), 2);
        assert_eq!(rec.entries[1].op, op(9));
    }

    #[tokio::test]
    async fn test_checkpoint_rotates_segments() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (journal, _) = Journal::open(dir.path()).await.unwrap();
            journal.append(&op(1)).await.unwrap();
            journal.append(&op(2)).await.unwrap();
            assert!(journal.write_checkpoint(&checkpoint(1)).await.is_err());
            journal.write_checkpoint(&checkpoint(2)).await.unwrap();
            assert_eq!(journal.entries_since_checkpoint().await, 0);
            journal
                .append(&JournalOp::NewBlock(NewBlockOp {
                    path: "/f".into(),
                    id: 5,
                    block_id: 7,
                }))
                .await
                .unwrap();
        }
        let segments = list_segments(dir.path()).await.unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].0, 3);

        let (journal, rec) = Journal::open(dir.path()).await.unwrap();
        assert_eq!(rec.checkpoint.unwrap().last_sequence, 2);
        assert_eq!(rec.entries.len(), 1);
        assert_eq!(rec.entries[0].sequence, 3);
        assert_eq!(journal.last_sequence().await, 3);
    }

    #[tokio::test]
    async fn test_failed_append_consumes_no_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let (journal, _) = Journal::open(dir.path()).await.unwrap();
        journal.append(&op(1)).await.unwrap();
        journal.fail_next_append();
        assert!(matches!(
            journal.append(&op(2)).await,
            Err(JournalError::Io(_))
        ));
        assert_eq!(journal.last_sequence().await, 1);
        assert_eq!(journal.append(&op(3)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_sequence_gap_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let record = format::encode_record(5, &op(5)).unwrap();
        std::fs::write(dir.path().join(segment_name(1)), record).unwrap();
        let err = Journal::open(dir.path()).await.err().unwrap();
        assert!(matches!(
            err,
            JournalError::SequenceGap {
                expected: 1,
                found: 5
            }
        ));
    }
}
