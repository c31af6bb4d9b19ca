use bolero::{check, TypeGenerator};

use undologd::record::{
    BlockInfo, NextXactStart, PayloadSection, RecordDecoder, RecordType, RelationDetails,
    TransactionInfo, UnpackedRecord,
};

/// Everything `insert_record`/`unpack_record` need to build and round-trip
/// an arbitrary `UnpackedRecord`, flattened into fuzzable primitives.
#[derive(Debug, Clone, TypeGenerator)]
struct Fuzz {
    rec_type: u8,
    relfilenode: u32,
    prev_xid: u32,
    xid: u32,
    cid: u32,
    prevlen: u16,
    relation: Option<(u32, u8)>,
    block: Option<(u64, u32, u16)>,
    transaction: Option<(u32, u8, u64)>,
    payload: Option<(Vec<u8>, Vec<u8>)>,
}

fn build(fuzz: &Fuzz) -> UnpackedRecord {
    let rec_type = match fuzz.rec_type % 7 {
        0 => RecordType::Insert,
        1 => RecordType::MultiInsert,
        2 => RecordType::Delete,
        3 => RecordType::InplaceUpdate,
        4 => RecordType::Update,
        5 => RecordType::XidLockOnly,
        _ => RecordType::InvalidXactSlot,
    };

    let mut rec = UnpackedRecord::new(rec_type, fuzz.relfilenode, fuzz.prev_xid, fuzz.xid, fuzz.cid);
    rec.prevlen = fuzz.prevlen;

    rec.relation = fuzz.relation.map(|(tablespace, fork)| RelationDetails { tablespace, fork });
    // A default RelationDetails is indistinguishable on the wire from no
    // RelationDetails at all; normalize it the same way the codec will,
    // so the round-trip comparison below is meaningful.
    if rec.relation.is_some_and(|r| r.is_default()) {
        rec.relation = None;
    }

    rec.block = fuzz.block.map(|(block_number, blkprev, block_attr)| BlockInfo {
        block_number,
        blkprev: if blkprev == 0 { None } else { Some(blkprev) },
        block_attr,
    });

    rec.transaction = fuzz.transaction.map(|(xid_epoch, next_kind, next_ptr_raw)| {
        let next_xact_start = match next_kind % 3 {
            0 => NextXactStart::None,
            1 => NextXactStart::Unknown,
            _ => {
                // keep the raw value within a log/offset pair the address
                // type can actually represent.
                let logno = (next_ptr_raw >> 40) as u32 % undologd::layout::MAX_LOG_NUMBER;
                let offset = next_ptr_raw % undologd::layout::MAX_LOG_SIZE;
                if logno == 0 && offset == 0 {
                    NextXactStart::Unknown
                } else {
                    NextXactStart::At(undologd::addr::UndoRecPtr::new(logno, offset))
                }
            }
        };
        TransactionInfo {
            xid_epoch,
            next_xact_start,
        }
    });

    rec.payload = fuzz.payload.clone().map(|(payload, tuple)| PayloadSection {
        payload: payload.into_iter().take(4096).collect(),
        tuple: tuple.into_iter().take(4096).collect(),
    });

    rec
}

fn main() {
    check!().with_type().for_each(|fuzz: &Fuzz| {
        let mut rec = build(fuzz);
        let size = rec.expected_size() as usize;

        let mut buf = vec![0u8; size];
        let mut written = 0;
        let done = undologd::record::insert_record(&rec, &mut buf, 0, &mut written);
        assert!(done, "single-buffer insert_record must finish in one call");
        assert_eq!(written, size);

        let mut decoder = RecordDecoder::new();
        let complete = undologd::record::unpack_record(&mut decoder, &buf, 0);
        assert!(complete, "single-buffer unpack_record must finish in one call");

        let decoded = decoder.finish().expect("well-formed record must decode");

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
    });
}
