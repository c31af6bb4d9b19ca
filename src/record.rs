//! The undo record codec: `UnpackedRecord` and the variable-layout packed
//! on-disk record format.
//!
//! Sections are packed back-to-back with no padding, gated by bits of the
//! header's `flags` byte, always in the fixed order: header, relation
//! details, block, transaction, payload sizes, payload bytes, tuple bytes.
//! A record never straddles a log, but it can straddle the blocks of a
//! log — `insert_record`/`unpack_record` exist to make that straddling
//! transparent to the caller, one block at a time.

use crate::addr::UndoRecPtr;
use crate::encode;
use crate::error::{Result, UndoError};

pub const HEADER_SIZE: usize = 1 + 1 + 2 + 4 + 4 + 4 + 4;
pub const RELATION_DETAILS_SIZE: usize = 4 + 1;
pub const BLOCK_SIZE_BYTES: usize = 8 + 4 + 2;
pub const TRANSACTION_SIZE: usize = 4 + 8;
pub const PAYLOAD_SIZES_SIZE: usize = 2 + 2;

pub const FLAG_RELATION_DETAILS: u8 = 1 << 0;
pub const FLAG_BLOCK: u8 = 1 << 1;
pub const FLAG_TRANSACTION: u8 = 1 << 2;
pub const FLAG_PAYLOAD: u8 = 1 << 3;

/// Tablespace ID meaning "the default tablespace", and the fork number
/// meaning "the main data fork" — the combination `RelationDetails` may be
/// omitted for.
pub const DEFAULT_TABLESPACE: u32 = 0;
pub const MAIN_FORK: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    Insert = 0,
    MultiInsert = 1,
    Delete = 2,
    InplaceUpdate = 3,
    Update = 4,
    XidLockOnly = 5,
    InvalidXactSlot = 6,
}

impl TryFrom<u8> for RecordType {
    type Error = UndoError;

    fn try_from(b: u8) -> Result<Self> {
        Ok(match b {
            0 => RecordType::Insert,
            1 => RecordType::MultiInsert,
            2 => RecordType::Delete,
            3 => RecordType::InplaceUpdate,
            4 => RecordType::Update,
            5 => RecordType::XidLockOnly,
            6 => RecordType::InvalidXactSlot,
            other => {
                return Err(UndoError::CorruptRecord(format!(
                    "undo record type {other} is not one of the enumerated kinds"
                )));
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationDetails {
    pub tablespace: u32,
    pub fork: u8,
}

impl RelationDetails {
    /// True when this is the omittable default: tablespace is the default
    /// and fork is the main data fork.
    pub fn is_default(&self) -> bool {
        self.tablespace == DEFAULT_TABLESPACE && self.fork == MAIN_FORK
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub block_number: u64,
    /// Byte offset of the previous undo record for this same
    /// `(relfilenode, block)` tuple, in the same log; `None` at chain end.
    pub blkprev: Option<u32>,
    /// Reserved for access-method-specific block state; this crate assigns
    /// it no meaning.
    pub block_attr: u16,
}

/// The Transaction section's forward-chain field. The wire format
/// overloads a single 64-bit value for three states; this enum models
/// them explicitly in memory. Only its `to_raw`/`from_raw` conversions
/// touch the overloaded wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextXactStart {
    /// No later transaction has started in this log yet.
    None,
    /// A later transaction exists but its start in this log isn't known yet.
    Unknown,
    At(UndoRecPtr),
}

impl NextXactStart {
    fn to_raw(self) -> u64 {
        match self {
            NextXactStart::None => 0,
            NextXactStart::Unknown => u64::MAX,
            NextXactStart::At(ptr) => ptr.to_raw(),
        }
    }

    fn from_raw(raw: u64) -> Self {
        match raw {
            0 => NextXactStart::None,
            u64::MAX => NextXactStart::Unknown,
            other => NextXactStart::At(
                UndoRecPtr::from_raw(other).expect("nonzero raw value decodes to a pointer"),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionInfo {
    pub xid_epoch: u32,
    pub next_xact_start: NextXactStart,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadSection {
    pub payload: Vec<u8>,
    pub tuple: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackedRecord {
    pub rec_type: RecordType,
    pub flags: u8,
    pub prevlen: u16,
    pub relfilenode: u32,
    pub prev_xid: u32,
    pub xid: u32,
    pub cid: u32,
    pub relation: Option<RelationDetails>,
    pub block: Option<BlockInfo>,
    pub transaction: Option<TransactionInfo>,
    pub payload: Option<PayloadSection>,
}

impl UnpackedRecord {
    pub fn new(rec_type: RecordType, relfilenode: u32, prev_xid: u32, xid: u32, cid: u32) -> Self {
        UnpackedRecord {
            rec_type,
            flags: 0,
            prevlen: 0,
            relfilenode,
            prev_xid,
            xid,
            cid,
            relation: None,
            block: None,
            transaction: None,
            payload: None,
        }
    }

    /// Recomputes `self.flags` from which optional sections are populated,
    /// and returns the total encoded size in bytes, including the side
    /// effect on `flags`.
    pub fn expected_size(&mut self) -> u32 {
        let mut flags = 0u8;
        let mut size = HEADER_SIZE;

        if let Some(relation) = &self.relation
            && !relation.is_default()
        {
            flags |= FLAG_RELATION_DETAILS;
            size += RELATION_DETAILS_SIZE;
        }
        if self.block.is_some() {
            flags |= FLAG_BLOCK;
            size += BLOCK_SIZE_BYTES;
        }
        if self.transaction.is_some() {
            flags |= FLAG_TRANSACTION;
            size += TRANSACTION_SIZE;
        }
        if let Some(payload) = &self.payload {
            flags |= FLAG_PAYLOAD;
            size += PAYLOAD_SIZES_SIZE + payload.payload.len() + payload.tuple.len();
        }

        self.flags = flags;
        size as u32
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.flags_size_hint()];

        buf[0] = self.rec_type as u8;
        buf[1] = self.flags;
        encode::write_u16(&mut buf[2..4], self.prevlen);
        encode::write_u32(&mut buf[4..8], self.relfilenode);
        encode::write_u32(&mut buf[8..12], self.prev_xid);
        encode::write_u32(&mut buf[12..16], self.xid);
        encode::write_u32(&mut buf[16..20], self.cid);

        let mut off = HEADER_SIZE;

        if self.flags & FLAG_RELATION_DETAILS != 0 {
            let relation = self.relation.expect("RELATION_DETAILS flag implies relation");
            encode::write_u32(&mut buf[off..off + 4], relation.tablespace);
            buf[off + 4] = relation.fork;
            off += RELATION_DETAILS_SIZE;
        }

        if self.flags & FLAG_BLOCK != 0 {
            let block = self.block.expect("BLOCK flag implies block");
            encode::write_u64(&mut buf[off..off + 8], block.block_number);
            encode::write_u32(&mut buf[off + 8..off + 12], block.blkprev.unwrap_or(0));
            encode::write_u16(&mut buf[off + 12..off + 14], block.block_attr);
            off += BLOCK_SIZE_BYTES;
        }

        if self.flags & FLAG_TRANSACTION != 0 {
            let txn = self.transaction.expect("TRANSACTION flag implies transaction");
            encode::write_u32(&mut buf[off..off + 4], txn.xid_epoch);
            encode::write_u64(&mut buf[off + 4..off + 12], txn.next_xact_start.to_raw());
            off += TRANSACTION_SIZE;
        }

        if self.flags & FLAG_PAYLOAD != 0 {
            let payload = self.payload.as_ref().expect("PAYLOAD flag implies payload");
            encode::write_u16(&mut buf[off..off + 2], payload.payload.len() as u16);
            encode::write_u16(&mut buf[off + 2..off + 4], payload.tuple.len() as u16);
            off += PAYLOAD_SIZES_SIZE;
            buf[off..off + payload.payload.len()].copy_from_slice(&payload.payload);
            off += payload.payload.len();
            buf[off..off + payload.tuple.len()].copy_from_slice(&payload.tuple);
            off += payload.tuple.len();
        }

        debug_assert_eq!(off, buf.len());
        buf
    }

    fn flags_size_hint(&self) -> usize {
        let mut size = HEADER_SIZE;
        if self.flags & FLAG_RELATION_DETAILS != 0 {
            size += RELATION_DETAILS_SIZE;
        }
        if self.flags & FLAG_BLOCK != 0 {
            size += BLOCK_SIZE_BYTES;
        }
        if self.flags & FLAG_TRANSACTION != 0 {
            size += TRANSACTION_SIZE;
        }
        if let Some(payload) = &self.payload
            && self.flags & FLAG_PAYLOAD != 0
        {
            size += PAYLOAD_SIZES_SIZE + payload.payload.len() + payload.tuple.len();
        }
        size
    }
}

/// Writes as many bytes of `unpacked`'s serialized form as fit in `page`
/// starting at `start_byte`, picking up wherever `already_written` left
/// off. Returns whether the record is now fully written. The caller loops
/// across successive blocks; on continuation `start_byte` is
/// `PAGE_HEADER_SIZE` (layout.rs) — records resume right after the block
/// header.
pub fn insert_record(
    unpacked: &UnpackedRecord,
    page: &mut [u8],
    start_byte: usize,
    already_written: &mut usize,
) -> bool {
    let encoded = unpacked.encode();
    let remaining_record = encoded.len() - *already_written;
    let remaining_page = page.len() - start_byte;
    let take = remaining_record.min(remaining_page);

    page[start_byte..start_byte + take]
        .copy_from_slice(&encoded[*already_written..*already_written + take]);
    *already_written += take;

    *already_written == encoded.len()
}

/// Symmetric decoder for `insert_record`. Accumulates bytes across
/// successive blocks and parses the record once every gated section
/// (determined by the header's `flags`, read as soon as it's available)
/// has arrived.
#[derive(Debug, Default)]
pub struct RecordDecoder {
    acc: Vec<u8>,
}

impl RecordDecoder {
    pub fn new() -> Self {
        RecordDecoder { acc: Vec::new() }
    }

    /// The smallest `acc.len()` needed before more structure can be
    /// determined; equal to the final record length once every gate has
    /// been resolved.
    fn next_threshold(&self) -> usize {
        if self.acc.len() < HEADER_SIZE {
            return HEADER_SIZE;
        }
        let flags = self.acc[1];
        let mut off = HEADER_SIZE;

        if flags & FLAG_RELATION_DETAILS != 0 {
            off += RELATION_DETAILS_SIZE;
            if self.acc.len() < off {
                return off;
            }
        }
        if flags & FLAG_BLOCK != 0 {
            off += BLOCK_SIZE_BYTES;
            if self.acc.len() < off {
                return off;
            }
        }
        if flags & FLAG_TRANSACTION != 0 {
            off += TRANSACTION_SIZE;
            if self.acc.len() < off {
                return off;
            }
        }
        if flags & FLAG_PAYLOAD != 0 {
            off += PAYLOAD_SIZES_SIZE;
            if self.acc.len() < off {
                return off;
            }
            let sizes_at = off - PAYLOAD_SIZES_SIZE;
            let payload_len = encode::read_u16(&self.acc[sizes_at..sizes_at + 2]) as usize;
            let tuple_len = encode::read_u16(&self.acc[sizes_at + 2..sizes_at + 4]) as usize;
            off += payload_len + tuple_len;
        }

        off
    }

    /// Feeds as many bytes as needed (and available) from `page[start_byte..]`.
    /// Returns the number of bytes consumed from this block.
    fn feed(&mut self, page: &[u8], start_byte: usize) -> usize {
        let avail = &page[start_byte..];
        let mut pos = 0;

        loop {
            let threshold = self.next_threshold();
            if self.acc.len() >= threshold {
                break;
            }
            let need = threshold - self.acc.len();
            let take = need.min(avail.len() - pos);
            if take == 0 {
                break;
            }
            self.acc.extend_from_slice(&avail[pos..pos + take]);
            pos += take;
        }

        pos
    }

    fn is_complete(&self) -> bool {
        self.acc.len() >= HEADER_SIZE && self.next_threshold() <= self.acc.len()
    }

    /// Number of bytes accumulated so far. Callers driving `unpack_record`
    /// across several blocks use the delta between calls to know how far
    /// a logical offset advanced.
    pub fn accumulated_len(&self) -> usize {
        self.acc.len()
    }

    /// Parses the accumulated bytes into an `UnpackedRecord`. Only valid
    /// once `is_complete()` is true.
    pub fn finish(&self) -> Result<UnpackedRecord> {
        debug_assert!(self.is_complete());

        let rec_type = RecordType::try_from(self.acc[0])?;
        let flags = self.acc[1];
        let prevlen = encode::read_u16(&self.acc[2..4]);
        let relfilenode = encode::read_u32(&self.acc[4..8]);
        let prev_xid = encode::read_u32(&self.acc[8..12]);
        let xid = encode::read_u32(&self.acc[12..16]);
        let cid = encode::read_u32(&self.acc[16..20]);

        let mut off = HEADER_SIZE;
        let mut relation = None;
        let mut block = None;
        let mut transaction = None;
        let mut payload = None;

        if flags & FLAG_RELATION_DETAILS != 0 {
            let tablespace = encode::read_u32(&self.acc[off..off + 4]);
            let fork = self.acc[off + 4];
            relation = Some(RelationDetails { tablespace, fork });
            off += RELATION_DETAILS_SIZE;
        }

        if flags & FLAG_BLOCK != 0 {
            let block_number = encode::read_u64(&self.acc[off..off + 8]);
            let blkprev_raw = encode::read_u32(&self.acc[off + 8..off + 12]);
            let block_attr = encode::read_u16(&self.acc[off + 12..off + 14]);
            block = Some(BlockInfo {
                block_number,
                blkprev: if blkprev_raw == 0 { None } else { Some(blkprev_raw) },
                block_attr,
            });
            off += BLOCK_SIZE_BYTES;
        }

        if flags & FLAG_TRANSACTION != 0 {
            let xid_epoch = encode::read_u32(&self.acc[off..off + 4]);
            let next_raw = encode::read_u64(&self.acc[off + 4..off + 12]);
            transaction = Some(TransactionInfo {
                xid_epoch,
                next_xact_start: NextXactStart::from_raw(next_raw),
            });
            off += TRANSACTION_SIZE;
        }

        if flags & FLAG_PAYLOAD != 0 {
            let payload_len = encode::read_u16(&self.acc[off..off + 2]) as usize;
            let tuple_len = encode::read_u16(&self.acc[off + 2..off + 4]) as usize;
            off += PAYLOAD_SIZES_SIZE;

            if off + payload_len + tuple_len > self.acc.len() {
                return Err(UndoError::CorruptRecord(format!(
                    "payload/tuple lengths ({payload_len}+{tuple_len}) exceed record length"
                )));
            }

            let payload_bytes = self.acc[off..off + payload_len].to_vec();
            off += payload_len;
            let tuple_bytes = self.acc[off..off + tuple_len].to_vec();
            off += tuple_len;

            payload = Some(PayloadSection {
                payload: payload_bytes,
                tuple: tuple_bytes,
            });
        }

        Ok(UnpackedRecord {
            rec_type,
            flags,
            prevlen,
            relfilenode,
            prev_xid,
            xid,
            cid,
            relation,
            block,
            transaction,
            payload,
        })
    }
}

/// Feeds one block's worth of bytes into `decoder` starting at `start_byte`.
/// Returns whether the record is now fully decoded; call `decoder.finish()`
/// once it is.
pub fn unpack_record(decoder: &mut RecordDecoder, page: &[u8], start_byte: usize) -> bool {
    decoder.feed(page, start_byte);
    decoder.is_complete()
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_record() -> UnpackedRecord {
        let mut rec = UnpackedRecord::new(RecordType::Insert, 7, 100, 101, 3);
        rec.relation = Some(RelationDetails {
            tablespace: 5,
            fork: 1,
        });
        rec.block = Some(BlockInfo {
            block_number: 42,
            blkprev: Some(1234),
            block_attr: 0,
        });
        rec.transaction = Some(TransactionInfo {
            xid_epoch: 1,
            next_xact_start: NextXactStart::Unknown,
        });
        rec.payload = Some(PayloadSection {
            payload: vec![1, 2, 3, 4, 5],
            tuple: vec![9, 9, 9],
        });
        rec
    }

    #[test]
    fn round_trip_single_page() {
        let mut rec = sample_record();
        let size = rec.expected_size() as usize;

        let mut page = vec![0u8; 4096];
        let mut written = 0;
        let done = insert_record(&rec, &mut page, 100, &mut written);
        assert!(done);
        assert_eq!(written, size);

        let mut decoder = RecordDecoder::new();
        let complete = unpack_record(&mut decoder, &page, 100);
        assert!(complete);

        let decoded = decoder.finish().unwrap();
        assert_eq!(decoded.rec_type, rec.rec_type);
        assert_eq!(decoded.prevlen, rec.prevlen);
        assert_eq!(decoded.relfilenode, rec.relfilenode);
        assert_eq!(decoded.prev_xid, rec.prev_xid);
        assert_eq!(decoded.xid, rec.xid);
        assert_eq!(decoded.cid, rec.cid);
        assert_eq!(decoded.relation, rec.relation);
        assert_eq!(decoded.block, rec.block);
        assert_eq!(decoded.transaction, rec.transaction);
        assert_eq!(decoded.payload, rec.payload);
    }

    #[test]
    fn omits_default_relation_details() {
        let mut rec = UnpackedRecord::new(RecordType::Delete, 7, 1, 2, 3);
        rec.relation = Some(RelationDetails {
            tablespace: DEFAULT_TABLESPACE,
            fork: MAIN_FORK,
        });
        let size = rec.expected_size();
        assert_eq!(rec.flags & FLAG_RELATION_DETAILS, 0);
        assert_eq!(size, HEADER_SIZE as u32);
    }

    /// BLOCK_SIZE=8192, PAGE_HEADER_SIZE=24, a 9000 byte record starting at
    /// page offset 100 straddles two blocks.
    #[test]
    fn cross_page_record_scenario() {
        let mut rec = UnpackedRecord::new(RecordType::Insert, 1, 1, 1, 1);
        rec.payload = Some(PayloadSection {
            payload: vec![0xab; 9000 - HEADER_SIZE - PAYLOAD_SIZES_SIZE],
            tuple: vec![],
        });
        let size = rec.expected_size();
        assert_eq!(size, 9000);

        let mut page0 = vec![0u8; 8192];
        let mut written = 0;
        let done = insert_record(&rec, &mut page0, 100, &mut written);
        assert!(!done);
        assert_eq!(written, 8092);

        let mut page1 = vec![0u8; 8192];
        let done = insert_record(&rec, &mut page1, 24, &mut written);
        assert!(done);
        assert_eq!(written, 9000);

        let mut decoder = RecordDecoder::new();
        let complete = unpack_record(&mut decoder, &page0, 100);
        assert!(!complete);
        let complete = unpack_record(&mut decoder, &page1, 24);
        assert!(complete);

        let decoded = decoder.finish().unwrap();
        assert_eq!(decoded.payload.unwrap().payload.len(), 9000 - HEADER_SIZE - PAYLOAD_SIZES_SIZE);
    }

    #[test]
    fn corrupt_type_is_rejected() {
        let err = RecordType::try_from(0xff).unwrap_err();
        assert!(matches!(err, UndoError::CorruptRecord(_)));
    }
}
