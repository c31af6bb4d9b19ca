//! Fixed on-disk sizing constants shared by the log manager, record codec
//! and checkpoint coordinator: the one grab bag of agreed-upon format
//! constants every other module depends on.

/// Size of one block (the unit the external buffer cache pins/evicts).
/// 8 KiB matches a typical database page size.
pub const BLOCK_SIZE: usize = 8192;

/// Number of blocks per backing segment file.
pub const BLOCKS_PER_SEGMENT: usize = 512;

/// Size of a backing segment file, in bytes. `BLOCK_SIZE * BLOCKS_PER_SEGMENT`.
pub const SEGMENT_SIZE: u64 = (BLOCK_SIZE * BLOCKS_PER_SEGMENT) as u64;

/// Bytes at the start of every block reserved for the external buffer
/// cache's own page header. Opaque to this crate: records resume
/// immediately after it on every page but its contents are never read or
/// written here.
pub const PAGE_HEADER_SIZE: usize = 24;

/// Usable bytes per block once the page header is excluded.
pub const BLOCK_PAYLOAD_SIZE: usize = BLOCK_SIZE - PAGE_HEADER_SIZE;

/// Width of the log-number field of an `UndoRecPtr`.
pub const LOG_NUMBER_BITS: u32 = 24;

/// Width of the byte-offset field of an `UndoRecPtr`.
pub const OFFSET_BITS: u32 = 40;

/// One past the highest byte offset addressable within a single log.
pub const MAX_LOG_SIZE: u64 = 1u64 << OFFSET_BITS;

/// One past the highest log number addressable by an `UndoRecPtr`.
pub const MAX_LOG_NUMBER: u32 = 1u32 << LOG_NUMBER_BITS;

/// Largest single record `allocate` will ever be asked to reserve.
/// Must leave room to always be able to extend by at least one segment.
pub const MAX_RECORD_SIZE: u64 = MAX_LOG_SIZE - SEGMENT_SIZE - 1;

/// Logical (payload-only) size of one segment: `BLOCKS_PER_SEGMENT *
/// BLOCK_PAYLOAD_SIZE`. A log's `end` field ("one past the last byte of
/// the highest allocated segment") is expressed in this unit, not
/// `SEGMENT_SIZE` (the segment's physical on-disk size including every
/// block's page header).
pub const SEGMENT_LOGICAL_SIZE: u64 = BLOCKS_PER_SEGMENT as u64 * BLOCK_PAYLOAD_SIZE as u64;

/// `UndoRecPtr` offsets are logical: they address only the usable payload
/// bytes of a log, never the `PAGE_HEADER_SIZE` bytes the external buffer
/// cache reserves at the start of each block. `page.rs` is what translates
/// a logical offset to a physical position within a segment file; these
/// helpers give the pieces of that translation that the log manager also
/// needs (which segment a logical offset falls in, and where segments
/// start) without depending on `page.rs` itself.
/// Index of the block (across the whole log, not just one segment) that
/// contains logical offset `offset`.
#[inline]
pub const fn block_no(offset: u64) -> u64 {
    offset / BLOCK_PAYLOAD_SIZE as u64
}

/// Segment number containing logical offset `offset`.
#[inline]
pub const fn segment_no(offset: u64) -> u64 {
    block_no(offset) / BLOCKS_PER_SEGMENT as u64
}

/// Logical offset of the first byte of the segment containing `offset`.
#[inline]
pub const fn segment_floor(offset: u64) -> u64 {
    segment_no(offset) * BLOCKS_PER_SEGMENT as u64 * BLOCK_PAYLOAD_SIZE as u64
}
