//! Walking a transaction's or a block's undo chain backward.
//!
//! Records within one transaction in one log form a singly linked list
//! via `prevlen` (the byte length of the record immediately before this
//! one); records touching the same `(relfilenode, block)` tuple form a
//! second, independent chain via the Block section's `blkprev`. Both
//! walks stop at the log's discard horizon: a record below it may already
//! be gone from disk.

use anyhow::Result;

use crate::addr::UndoRecPtr;
use crate::log::LogManager;
use crate::page;
use crate::record::UnpackedRecord;

/// Fetches the record at `ptr`, or `None` if it has already been
/// discarded.
pub fn fetch_record(manager: &LogManager, ptr: UndoRecPtr) -> Result<Option<UnpackedRecord>> {
    if manager.is_discarded(ptr) {
        return Ok(None);
    }
    let (record, _end) = page::read_record(manager.base_dir(), ptr.logno(), ptr.offset())?;
    Ok(Some(record))
}

/// Walks a transaction's undo chain backward from `ptr`, calling `visit`
/// with each record until `visit` returns `false`, the chain's start is
/// reached (`prevlen == 0`), or the discard horizon is crossed.
pub fn walk_transaction_chain(
    manager: &LogManager,
    ptr: UndoRecPtr,
    mut visit: impl FnMut(UndoRecPtr, &UnpackedRecord) -> bool,
) -> Result<()> {
    let mut current = Some(ptr);

    while let Some(p) = current {
        let Some(record) = fetch_record(manager, p)? else {
            break;
        };
        if !visit(p, &record) {
            break;
        }
        current = if record.prevlen == 0 {
            None
        } else {
            let prev_offset = p.offset().checked_sub(record.prevlen as u64);
            prev_offset.map(|off| p.with_offset(off))
        };
    }

    Ok(())
}

/// Walks the per-block undo chain backward from `ptr` via the Block
/// section's `blkprev`, same stopping rules as `walk_transaction_chain`.
/// Returns an empty walk immediately if `ptr`'s record has no Block
/// section.
pub fn walk_block_chain(
    manager: &LogManager,
    ptr: UndoRecPtr,
    mut visit: impl FnMut(UndoRecPtr, &UnpackedRecord) -> bool,
) -> Result<()> {
    let mut current = Some(ptr);

    while let Some(p) = current {
        let Some(record) = fetch_record(manager, p)? else {
            break;
        };
        let blkprev = record.block.as_ref().and_then(|b| b.blkprev);
        if !visit(p, &record) {
            break;
        }
        current = blkprev.map(|off| p.with_offset(off as u64));
    }

    Ok(())
}
