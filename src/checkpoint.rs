//! Checkpoint/Recovery Coordinator.
//!
//! A checkpoint is a snapshot of every log's `UndoLogMeta`, written to a
//! new file named after the WAL LSN it's consistent with, fsynced (file,
//! then containing directory) before the previous checkpoint file is
//! removed. Startup locates the checkpoint with the greatest such LSN,
//! loads its slots, and replays the WAL from that LSN forward.
//!
//! File format: fixed header, per-log record table, checksum trailer —
//! the same shape as a mini-transaction log block, sized for this engine's
//! own per-log record layout.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use crc32c::crc32c;

use crate::control::SlotState;
use crate::encode;
use crate::error::UndoError;
use crate::log::{LogManager, Persistence, UndoLogMeta};
use crate::wal::{Lsn, WalRecord, WalSource};

const MAGIC: u32 = 0x554e444f; // "UNDO"
const PERSISTENCE_PERMANENT: u8 = 0;
const PERSISTENCE_UNLOGGED: u8 = 1;
const PERSISTENCE_TEMPORARY: u8 = 2;

/// One log's worth of metadata as it appears in a checkpoint file.
const RECORD_SIZE: usize = 4 // logno
    + 4  // tablespace
    + 8  // insert
    + 8  // end
    + 8  // discard
    + 8  // last_xact_start
    + 4  // xid
    + 4  // xid_epoch
    + 1  // is_first_rec
    + 2  // prevlen
    + 1  // persistence
    + 1  // slot state
    + 1; // xid valid flag (for Attached state); unused padding otherwise

/// Coordinates checkpoint writes and startup recovery for a `LogManager`.
/// `checkpoint_in_progress` gates `LogManager::discard`'s segment unlinks:
/// a checkpoint in flight must see a consistent snapshot, so discards
/// started while one is running still update in-memory state but defer
/// their segment unlink until the checkpoint completes.
pub struct Coordinator {
    dir: PathBuf,
    checkpoint_in_progress: AtomicBool,
}

impl Coordinator {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Coordinator {
            dir: dir.into(),
            checkpoint_in_progress: AtomicBool::new(false),
        }
    }

    pub fn checkpoint_in_progress(&self) -> bool {
        self.checkpoint_in_progress.load(Ordering::Acquire)
    }

    fn file_name(redo_lsn: Lsn) -> String {
        format!("{redo_lsn:016x}.ckpt")
    }

    /// Writes a new checkpoint file capturing every log's current
    /// metadata, consistent with `redo_lsn` (the WAL position recovery
    /// should resume from). Fsyncs the new file and its directory before
    /// removing the previous checkpoint file, so a crash between the two
    /// writes always leaves at least one valid checkpoint on disk.
    pub fn checkpoint(&self, manager: &LogManager, redo_lsn: Lsn) -> Result<()> {
        self.checkpoint_in_progress.store(true, Ordering::Release);
        let result = self.checkpoint_inner(manager, redo_lsn);
        self.checkpoint_in_progress.store(false, Ordering::Release);
        result
    }

    fn checkpoint_inner(&self, manager: &LogManager, redo_lsn: Lsn) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create checkpoint directory {}", self.dir.display()))?;

        let mut body = Vec::new();
        let mut count: u32 = 0;
        for slot in manager.control().iter() {
            let state = slot.state();
            if state == SlotState::Unused {
                continue;
            }
            slot.with_meta(|meta| {
                encode_record(&mut body, slot.logno(), state, meta);
            });
            count += 1;
        }

        let mut file_buf = Vec::new();
        file_buf.extend_from_slice(&MAGIC.to_le_bytes());
        file_buf.extend_from_slice(&redo_lsn.to_le_bytes());
        file_buf.extend_from_slice(&count.to_le_bytes());
        file_buf.extend_from_slice(&body);
        let checksum = crc32c(&file_buf);
        file_buf.extend_from_slice(&checksum.to_le_bytes());

        let old = self.latest_checkpoint_file()?;

        let path = self.dir.join(Self::file_name(redo_lsn));
        let mut file = File::create(&path)
            .with_context(|| format!("create checkpoint file {}", path.display()))?;
        file.write_all(&file_buf)
            .with_context(|| format!("write checkpoint file {}", path.display()))?;
        file.sync_all()
            .with_context(|| format!("fsync checkpoint file {}", path.display()))?;

        fsync_dir(&self.dir).with_context(|| {
            format!("fsync checkpoint directory {}", self.dir.display())
        })?;

        if let Some(old_path) = old
            && old_path != path
        {
            fs::remove_file(&old_path)
                .with_context(|| format!("remove old checkpoint file {}", old_path.display()))?;
            fsync_dir(&self.dir)?;
        }

        Ok(())
    }

    fn latest_checkpoint_file(&self) -> Result<Option<PathBuf>> {
        if !self.dir.exists() {
            return Ok(None);
        }
        let mut best: Option<(Lsn, PathBuf)> = None;
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("list checkpoint directory {}", self.dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if path.extension().and_then(|e| e.to_str()) != Some("ckpt") {
                continue;
            }
            let Ok(lsn) = Lsn::from_str_radix(name, 16) else {
                continue;
            };
            if best.as_ref().is_none_or(|(best_lsn, _)| lsn > *best_lsn) {
                best = Some((lsn, path));
            }
        }
        Ok(best.map(|(_, path)| path))
    }

    /// Loads the most recent valid checkpoint into `manager`'s control
    /// slots, then replays every WAL record from that checkpoint's LSN
    /// forward. Returns the LSN recovery resumed from (0 if no checkpoint
    /// existed, meaning every log starts empty).
    pub fn startup(&self, manager: &LogManager, wal: &mut dyn WalSource) -> Result<Lsn> {
        let redo_lsn = match self.latest_checkpoint_file()? {
            Some(path) => self.load_checkpoint(&path, manager)?,
            None => 0,
        };

        while let Some((_lsn, record)) = wal.next_record(redo_lsn)? {
            self.redo(manager, record)?;
        }

        Ok(redo_lsn)
    }

    fn load_checkpoint(&self, path: &Path, manager: &LogManager) -> Result<Lsn> {
        let mut buf = Vec::new();
        File::open(path)
            .with_context(|| format!("open checkpoint file {}", path.display()))?
            .read_to_end(&mut buf)
            .with_context(|| format!("read checkpoint file {}", path.display()))?;

        if buf.len() < 4 + 8 + 4 + 4 {
            return Err(UndoError::InvalidCheckpoint {
                path: path.display().to_string(),
                reason: format!("too short ({} bytes)", buf.len()),
            }
            .into());
        }

        let (body, checksum_bytes) = buf.split_at(buf.len() - 4);
        let expected = encode::read_u32(checksum_bytes);
        let actual = crc32c(body);
        if expected != actual {
            return Err(UndoError::InvalidCheckpoint {
                path: path.display().to_string(),
                reason: format!("checksum mismatch (expected {expected:#x}, got {actual:#x})"),
            }
            .into());
        }

        let magic = encode::read_u32(&body[0..4]);
        if magic != MAGIC {
            return Err(UndoError::InvalidCheckpoint {
                path: path.display().to_string(),
                reason: format!("bad magic {magic:#x}"),
            }
            .into());
        }
        let redo_lsn = encode::read_u64(&body[4..12]);
        let count = encode::read_u32(&body[12..16]);

        let mut off = 16;
        for _ in 0..count {
            if off + RECORD_SIZE > body.len() {
                return Err(UndoError::InvalidCheckpoint {
                    path: path.display().to_string(),
                    reason: "truncated record table".to_string(),
                }
                .into());
            }
            let (logno, state, meta) = decode_record(&body[off..off + RECORD_SIZE]);
            off += RECORD_SIZE;

            manager.restore_slot_from_redo(logno, meta)?;
            match state {
                SlotState::Idle => manager.detach(logno),
                SlotState::Exhausted => manager.control().slot(logno).mark_exhausted(),
                SlotState::FullyDiscarded => {
                    manager.control().slot(logno).mark_exhausted();
                    manager.control().slot(logno).mark_fully_discarded();
                }
                _ => {}
            }
        }

        Ok(redo_lsn)
    }

    /// Applies a single WAL record to `manager` during replay. Each
    /// variant maps directly onto one `LogManager` call; unlike live
    /// operation, replay tolerates operations on logs recovery hasn't
    /// seen a `CreateLog` for yet only via `restore_slot_from_redo`'s
    /// implicit slot reservation.
    pub fn redo(&self, manager: &LogManager, record: WalRecord) -> Result<()> {
        match record {
            WalRecord::CreateLog { logno, meta } => {
                manager.restore_slot_from_redo(logno, meta)?;
            }
            WalRecord::AdvanceInsert { logno, new_insert } => {
                manager.advance(logno, new_insert)?;
            }
            WalRecord::SetPrevlen { logno, prevlen } => {
                manager.set_prevlen(logno, prevlen);
            }
            WalRecord::MarkXactStart { logno, start } => {
                manager.mark_xact_start(logno, start);
            }
            WalRecord::Discard {
                logno,
                new_discard,
                unlink,
            } => {
                if unlink {
                    manager.discard(logno, new_discard)?;
                } else {
                    manager
                        .control()
                        .slot(logno)
                        .with_meta_mut(|m| m.discard = new_discard);
                }
            }
            WalRecord::Detach { logno } => {
                manager.detach(logno);
            }
        }
        Ok(())
    }

    /// Segment numbers of `logno` that a checkpoint covering `[discard,
    /// end)` still needs, for a caller deciding what to copy into a base
    /// backup.
    pub fn dirty_segment_range(&self, meta: &UndoLogMeta) -> std::ops::Range<u64> {
        crate::layout::segment_no(meta.discard)..crate::layout::segment_no(meta.end.max(meta.discard)) + 1
    }
}

fn encode_record(out: &mut Vec<u8>, logno: u32, state: SlotState, meta: &UndoLogMeta) {
    out.extend_from_slice(&logno.to_le_bytes());
    out.extend_from_slice(&meta.tablespace.to_le_bytes());
    out.extend_from_slice(&meta.insert.to_le_bytes());
    out.extend_from_slice(&meta.end.to_le_bytes());
    out.extend_from_slice(&meta.discard.to_le_bytes());
    out.extend_from_slice(&meta.last_xact_start.to_le_bytes());
    out.extend_from_slice(&meta.xid.to_le_bytes());
    out.extend_from_slice(&meta.xid_epoch.to_le_bytes());
    out.push(meta.is_first_rec as u8);
    out.extend_from_slice(&meta.prevlen.to_le_bytes());
    out.push(match meta.persistence {
        Persistence::Permanent => PERSISTENCE_PERMANENT,
        Persistence::Unlogged => PERSISTENCE_UNLOGGED,
        Persistence::Temporary => PERSISTENCE_TEMPORARY,
    });
    out.push(match state {
        SlotState::Unused => 0,
        SlotState::Attached { .. } => 1,
        SlotState::Idle => 2,
        SlotState::Exhausted => 3,
        SlotState::FullyDiscarded => 4,
    });
    out.push(0);
}

fn decode_record(buf: &[u8]) -> (u32, SlotState, UndoLogMeta) {
    let logno = encode::read_u32(&buf[0..4]);
    let tablespace = encode::read_u32(&buf[4..8]);
    let insert = encode::read_u64(&buf[8..16]);
    let end = encode::read_u64(&buf[16..24]);
    let discard = encode::read_u64(&buf[24..32]);
    let last_xact_start = encode::read_u64(&buf[32..40]);
    let xid = encode::read_u32(&buf[40..44]);
    let xid_epoch = encode::read_u32(&buf[44..48]);
    let is_first_rec = buf[48] != 0;
    let prevlen = encode::read_u16(&buf[49..51]);
    let persistence = match buf[51] {
        PERSISTENCE_UNLOGGED => Persistence::Unlogged,
        PERSISTENCE_TEMPORARY => Persistence::Temporary,
        _ => Persistence::Permanent,
    };
    let state = match buf[52] {
        1 => SlotState::Attached { xid },
        2 => SlotState::Idle,
        3 => SlotState::Exhausted,
        4 => SlotState::FullyDiscarded,
        _ => SlotState::Unused,
    };

    (
        logno,
        state,
        UndoLogMeta {
            tablespace,
            insert,
            end,
            discard,
            last_xact_start,
            xid,
            xid_epoch,
            is_first_rec,
            prevlen,
            persistence,
        },
    )
}

#[cfg(unix)]
fn fsync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn fsync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::wal::MemoryWal;
    use tempfile::tempdir;

    /// Checkpoint, restart with a fresh manager, recover.
    #[test]
    fn checkpoint_then_startup_round_trips_log_state() {
        let segdir = tempdir().unwrap();
        let ckdir = tempdir().unwrap();

        let manager = LogManager::new(segdir.path(), 4);
        let ptr = manager.allocate(1, 0, 100, Persistence::Permanent).unwrap();
        manager.advance(ptr.logno(), 100).unwrap();
        manager.set_prevlen(ptr.logno(), 0);

        let coordinator = Coordinator::new(ckdir.path());
        coordinator.checkpoint(&manager, 42).unwrap();

        let manager2 = LogManager::new(segdir.path(), 4);
        let mut wal = MemoryWal::new();
        let redo_lsn = coordinator
            .startup(&manager2, &mut crate::wal::MemoryWalCursor::new(&wal))
            .unwrap();
        let _ = &mut wal;

        assert_eq!(redo_lsn, 42);
        assert_eq!(manager2.current_location(ptr.logno()), 100);
    }

    #[test]
    fn checkpoint_survives_two_generations() {
        let segdir = tempdir().unwrap();
        let ckdir = tempdir().unwrap();
        let manager = LogManager::new(segdir.path(), 2);
        let coordinator = Coordinator::new(ckdir.path());

        coordinator.checkpoint(&manager, 1).unwrap();
        let first = coordinator.latest_checkpoint_file().unwrap().unwrap();
        assert!(first.exists());

        coordinator.checkpoint(&manager, 2).unwrap();
        assert!(!first.exists());
        let second = coordinator.latest_checkpoint_file().unwrap().unwrap();
        assert!(second.exists());
        assert_ne!(first, second);
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let segdir = tempdir().unwrap();
        let ckdir = tempdir().unwrap();
        let manager = LogManager::new(segdir.path(), 1);
        let coordinator = Coordinator::new(ckdir.path());
        coordinator.checkpoint(&manager, 5).unwrap();

        let path = coordinator.latest_checkpoint_file().unwrap().unwrap();
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        let manager2 = LogManager::new(segdir.path(), 1);
        let err = coordinator.load_checkpoint(&path, &manager2);
        assert!(err.is_err());
    }
}
