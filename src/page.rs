//! Translates the log manager's logical, header-free byte offsets into
//! physical positions inside segment files, and drives the record codec
//! across however many blocks a record straddles.

use std::path::Path;

use anyhow::Result;

use crate::layout::{BLOCK_SIZE, BLOCKS_PER_SEGMENT, BLOCK_PAYLOAD_SIZE, PAGE_HEADER_SIZE};
use crate::record::{self, RecordDecoder, UnpackedRecord};
use crate::segment;

/// `(segno, block-within-segment, byte offset into that block's payload)`
/// for logical offset `offset`.
fn locate(offset: u64) -> (u64, usize, usize) {
    let block_no = crate::layout::block_no(offset);
    let segno = block_no / BLOCKS_PER_SEGMENT as u64;
    let block_in_seg = (block_no % BLOCKS_PER_SEGMENT as u64) as usize;
    let byte_in_block = (offset % BLOCK_PAYLOAD_SIZE as u64) as usize;
    (segno, block_in_seg, byte_in_block)
}

fn block_bounds(block_in_seg: usize) -> std::ops::Range<usize> {
    let start = block_in_seg * BLOCK_SIZE;
    start..start + BLOCK_SIZE
}

/// Writes `unpacked`'s encoded bytes starting at logical offset `start`,
/// straddling blocks (and segment files) as needed. Returns the logical
/// offset one past the last byte written.
pub fn write_record(base_dir: &Path, logno: u32, start: u64, unpacked: &UnpackedRecord) -> Result<u64> {
    let mut offset = start;
    let mut already_written = 0usize;

    loop {
        let (segno, block_in_seg, byte_in_block) = locate(offset);
        let mut mmap = segment::open_mmap_rw(base_dir, logno, segno)?;
        let block = &mut mmap.as_mut_slice()[block_bounds(block_in_seg)];
        let start_byte = PAGE_HEADER_SIZE + byte_in_block;

        let before = already_written;
        let done = record::insert_record(unpacked, block, start_byte, &mut already_written);
        let consumed = already_written - before;
        mmap.flush(block_bounds(block_in_seg))?;

        offset += consumed as u64;
        if done {
            return Ok(offset);
        }
    }
}

/// Reads a record starting at logical offset `start`, straddling blocks as
/// needed. Returns the decoded record and the logical offset one past its
/// last byte.
pub fn read_record(base_dir: &Path, logno: u32, start: u64) -> Result<(UnpackedRecord, u64)> {
    let mut decoder = RecordDecoder::new();
    let mut offset = start;

    loop {
        let (segno, block_in_seg, byte_in_block) = locate(offset);
        let mmap = segment::open_mmap_ro(base_dir, logno, segno)?;
        let block = &mmap.as_slice()[block_bounds(block_in_seg)];
        let start_byte = PAGE_HEADER_SIZE + byte_in_block;

        let before = decoder.accumulated_len();
        let complete = record::unpack_record(&mut decoder, block, start_byte);
        let consumed = decoder.accumulated_len() - before;
        offset += consumed as u64;

        if complete {
            let unpacked = decoder.finish()?;
            return Ok((unpacked, offset));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::record::{RecordType, UnpackedRecord};
    use tempfile::tempdir;

    #[test]
    fn write_then_read_back_small_record() {
        let dir = tempdir().unwrap();
        segment::create_segment(dir.path(), 0, 0).unwrap();

        let mut rec = UnpackedRecord::new(RecordType::Insert, 1, 1, 1, 1);
        rec.expected_size();

        let end = write_record(dir.path(), 0, 0, &rec).unwrap();
        assert!(end > 0);

        let (decoded, read_end) = read_record(dir.path(), 0, 0).unwrap();
        assert_eq!(read_end, end);
        assert_eq!(decoded.rec_type, rec.rec_type);
        assert_eq!(decoded.relfilenode, rec.relfilenode);
    }

    #[test]
    fn write_then_read_back_record_straddling_a_block() {
        let dir = tempdir().unwrap();
        segment::create_segment(dir.path(), 0, 0).unwrap();

        let mut rec = UnpackedRecord::new(RecordType::Insert, 2, 1, 1, 1);
        rec.payload = Some(crate::record::PayloadSection {
            payload: vec![0x5a; BLOCK_PAYLOAD_SIZE + 500],
            tuple: vec![],
        });
        let size = rec.expected_size();

        let start = 10;
        let end = write_record(dir.path(), 0, start, &rec).unwrap();
        assert_eq!(end - start, size as u64);

        let (decoded, read_end) = read_record(dir.path(), 0, start).unwrap();
        assert_eq!(read_end, end);
        assert_eq!(
            decoded.payload.unwrap().payload.len(),
            BLOCK_PAYLOAD_SIZE + 500
        );
    }
}
