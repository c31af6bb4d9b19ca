//! WAL record schema for the undo log engine's own state transitions.
//!
//! This engine does not own a write-ahead log of its own; it assumes a
//! host storage engine's WAL already provides durability and ordering,
//! and this module exists only to define the small, closed set of record
//! kinds the checkpoint/recovery coordinator needs from it, plus the
//! trait boundary a host WAL implementation plugs into (`WalSink` to
//! append records while operating, `WalSource` to replay them at startup).

use crate::error::Result;
use crate::log::UndoLogMeta;

pub type Lsn = u64;

/// Every undo-engine state transition that must survive a crash. Kept
/// deliberately small: each variant corresponds to exactly one
/// `LogManager`/`ControlArray` mutation, so replay is a straight
/// dispatch (see `checkpoint::Coordinator::redo`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// A new log was attached to a control slot.
    CreateLog { logno: u32, meta: UndoLogMeta },
    /// A log's insert pointer (and therefore possibly its segment set)
    /// advanced to cover a newly written record.
    AdvanceInsert { logno: u32, new_insert: u64 },
    /// `prevlen` was stamped for the next record to be written.
    SetPrevlen { logno: u32, prevlen: u16 },
    /// A transaction's first record was written at `start`.
    MarkXactStart { logno: u32, start: u64 },
    /// A log's discard horizon advanced; `unlink` is true if the segments
    /// behind it should be removed during replay (it can be false for a
    /// record written before the corresponding checkpoint's unlink
    /// actually happened on the original node).
    Discard {
        logno: u32,
        new_discard: u64,
        unlink: bool,
    },
    /// A log was detached from its transaction back to `Idle`.
    Detach { logno: u32 },
}

impl WalRecord {
    pub fn logno(&self) -> u32 {
        match self {
            WalRecord::CreateLog { logno, .. }
            | WalRecord::AdvanceInsert { logno, .. }
            | WalRecord::SetPrevlen { logno, .. }
            | WalRecord::MarkXactStart { logno, .. }
            | WalRecord::Discard { logno, .. }
            | WalRecord::Detach { logno } => *logno,
        }
    }
}

/// Appends undo-engine WAL records to the host engine's write-ahead log.
/// Implemented by the host, not by this crate.
pub trait WalSink {
    fn append(&mut self, record: &WalRecord) -> Result<Lsn>;
}

/// Replays undo-engine WAL records from the host engine's write-ahead log
/// starting at a given LSN. Implemented by the host.
pub trait WalSource {
    /// Returns the next record at or after `from`, along with its LSN, or
    /// `None` once the log is exhausted.
    fn next_record(&mut self, from: Lsn) -> Result<Option<(Lsn, WalRecord)>>;
}

/// An in-memory `WalSink`/`WalSource` pair, useful for tests and for hosts
/// that haven't wired up their own WAL yet.
#[derive(Debug, Default)]
pub struct MemoryWal {
    records: Vec<(Lsn, WalRecord)>,
    next_lsn: Lsn,
}

impl MemoryWal {
    pub fn new() -> Self {
        MemoryWal {
            records: Vec::new(),
            next_lsn: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl WalSink for MemoryWal {
    fn append(&mut self, record: &WalRecord) -> Result<Lsn> {
        let lsn = self.next_lsn;
        self.next_lsn += 1;
        self.records.push((lsn, record.clone()));
        Ok(lsn)
    }
}

pub struct MemoryWalCursor<'a> {
    wal: &'a MemoryWal,
    pos: usize,
}

impl<'a> MemoryWalCursor<'a> {
    pub fn new(wal: &'a MemoryWal) -> Self {
        MemoryWalCursor { wal, pos: 0 }
    }
}

impl WalSource for MemoryWalCursor<'_> {
    fn next_record(&mut self, from: Lsn) -> Result<Option<(Lsn, WalRecord)>> {
        while self.pos < self.wal.records.len() {
            let (lsn, record) = &self.wal.records[self.pos];
            self.pos += 1;
            if *lsn >= from {
                return Ok(Some((*lsn, record.clone())));
            }
        }
        Ok(None)
    }
}
