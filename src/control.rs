//! Shared control state for logs: the per-log-slot state machine and the
//! locking discipline that guards it.
//!
//! Every log has exactly one control slot for its lifetime. A coarse
//! allocation lock guards only the free list; once a slot is assigned to a
//! log, all further access to that log's metadata goes through the slot's
//! own lock, so concurrent transactions touching different logs never
//! contend with each other.

use std::sync::Mutex;

use crate::error::{Result, UndoError};
use crate::log::UndoLogMeta;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No log has ever used this slot, or a previous occupant has been
    /// fully discarded and the slot reclaimed.
    Unused,
    /// A transaction is actively writing to this log.
    Attached { xid: u32 },
    /// No transaction currently owns this log, but it still holds undo
    /// records that haven't reached the discard horizon.
    Idle,
    /// The log reached `max_log_size`; it accepts no further writes but
    /// its existing records are still live until fully discarded.
    Exhausted,
    /// Every record in this log has been discarded; the slot is ready to
    /// be reclaimed for a new log.
    FullyDiscarded,
}

struct SlotInner {
    state: SlotState,
    meta: Option<UndoLogMeta>,
}

pub struct ControlSlot {
    logno: u32,
    inner: Mutex<SlotInner>,
}

impl ControlSlot {
    fn new(logno: u32) -> Self {
        ControlSlot {
            logno,
            inner: Mutex::new(SlotInner {
                state: SlotState::Unused,
                meta: None,
            }),
        }
    }

    pub fn logno(&self) -> u32 {
        self.logno
    }

    pub fn state(&self) -> SlotState {
        self.inner.lock().unwrap().state
    }

    pub fn with_meta<R>(&self, f: impl FnOnce(&UndoLogMeta) -> R) -> Option<R> {
        self.inner.lock().unwrap().meta.as_ref().map(f)
    }

    pub fn with_meta_mut<R>(&self, f: impl FnOnce(&mut UndoLogMeta) -> R) -> Option<R> {
        self.inner.lock().unwrap().meta.as_mut().map(f)
    }

    /// Moves an `Unused` slot to `Attached`, installing fresh metadata for
    /// a newly created log.
    pub fn attach_new(&self, xid: u32, meta: UndoLogMeta) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != SlotState::Unused {
            return Err(UndoError::ResourceExhausted(format!(
                "control slot for log {} is not free (state {:?})",
                self.logno, inner.state
            )));
        }
        inner.state = SlotState::Attached { xid };
        inner.meta = Some(meta);
        Ok(())
    }

    /// Moves an `Idle` slot to `Attached`, reusing an existing log for a
    /// new transaction.
    pub fn reattach(&self, xid: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != SlotState::Idle {
            return Err(UndoError::ResourceExhausted(format!(
                "control slot for log {} is not idle (state {:?})",
                self.logno, inner.state
            )));
        }
        inner.state = SlotState::Attached { xid };
        Ok(())
    }

    pub fn detach_to_idle(&self) {
        let mut inner = self.inner.lock().unwrap();
        assert!(
            matches!(inner.state, SlotState::Attached { .. }),
            "detach called on a slot that wasn't attached (log {})",
            self.logno
        );
        inner.state = SlotState::Idle;
    }

    pub fn mark_exhausted(&self) {
        let mut inner = self.inner.lock().unwrap();
        assert!(
            matches!(inner.state, SlotState::Attached { .. } | SlotState::Idle),
            "mark_exhausted called on slot in state {:?} (log {})",
            inner.state,
            self.logno
        );
        inner.state = SlotState::Exhausted;
    }

    pub fn mark_fully_discarded(&self) {
        let mut inner = self.inner.lock().unwrap();
        assert!(
            matches!(inner.state, SlotState::Idle | SlotState::Exhausted),
            "mark_fully_discarded called on slot in state {:?} (log {})",
            inner.state,
            self.logno
        );
        inner.state = SlotState::FullyDiscarded;
    }

    /// Reclaims a `FullyDiscarded` slot back to `Unused`, dropping its
    /// metadata so the slot's log number can be reassigned.
    fn reclaim(&self) {
        let mut inner = self.inner.lock().unwrap();
        assert_eq!(
            inner.state,
            SlotState::FullyDiscarded,
            "reclaim called on slot in state {:?} (log {})",
            inner.state,
            self.logno
        );
        inner.state = SlotState::Unused;
        inner.meta = None;
    }

    /// Installs metadata directly, bypassing the normal state machine.
    /// Used only by checkpoint/recovery startup, which restores slots to
    /// whatever state the checkpoint recorded them in.
    pub fn restore(&self, state: SlotState, meta: UndoLogMeta) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = state;
        inner.meta = Some(meta);
    }
}

/// Owns every control slot and the coarse lock guarding which ones are
/// free. Slots are allocated lazily and never shrink, mirroring a fixed
/// shared-memory array sized for the worst case at startup.
pub struct ControlArray {
    slots: Vec<ControlSlot>,
    free_list: Mutex<Vec<usize>>,
}

impl ControlArray {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity).map(|i| ControlSlot::new(i as u32)).collect();
        let free_list = Mutex::new((0..capacity).rev().collect());
        ControlArray { slots, free_list }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, logno: u32) -> &ControlSlot {
        &self.slots[logno as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &ControlSlot> {
        self.slots.iter()
    }

    /// Takes the next free slot off the allocation free list, without
    /// touching any individual slot's own lock.
    pub fn take_free_slot(&self) -> Result<u32> {
        let mut free = self.free_list.lock().unwrap();
        free.pop()
            .map(|i| i as u32)
            .ok_or_else(|| UndoError::ResourceExhausted("no free control slots".to_string()))
    }

    /// Returns a fully-discarded slot to the free list, so its log number
    /// can be reused.
    pub fn release_slot(&self, logno: u32) {
        self.slots[logno as usize].reclaim();
        self.free_list.lock().unwrap().push(logno as usize);
    }

    /// Used only at startup: marks a slot occupied without consulting the
    /// free list (the checkpoint file, not the free list, is authoritative
    /// about which logs exist).
    pub fn reserve_slot_for_recovery(&self, logno: u32) {
        let mut free = self.free_list.lock().unwrap();
        free.retain(|&i| i as u32 != logno);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::log::Persistence;

    fn sample_meta() -> UndoLogMeta {
        UndoLogMeta {
            tablespace: 0,
            insert: 0,
            end: 0,
            discard: 0,
            last_xact_start: 0,
            xid: 0,
            xid_epoch: 0,
            is_first_rec: true,
            prevlen: 0,
            persistence: Persistence::Permanent,
        }
    }

    #[test]
    fn allocate_attach_detach_discard_reclaim_cycle() {
        let arr = ControlArray::new(4);
        let logno = arr.take_free_slot().unwrap();
        let slot = arr.slot(logno);

        assert_eq!(slot.state(), SlotState::Unused);
        slot.attach_new(100, sample_meta()).unwrap();
        assert_eq!(slot.state(), SlotState::Attached { xid: 100 });

        slot.detach_to_idle();
        assert_eq!(slot.state(), SlotState::Idle);

        slot.reattach(101).unwrap();
        assert_eq!(slot.state(), SlotState::Attached { xid: 101 });

        slot.detach_to_idle();
        slot.mark_exhausted();
        assert_eq!(slot.state(), SlotState::Exhausted);

        slot.mark_fully_discarded();
        assert_eq!(slot.state(), SlotState::FullyDiscarded);

        arr.release_slot(logno);
        assert_eq!(slot.state(), SlotState::Unused);
    }

    #[test]
    fn reattach_on_attached_slot_is_rejected() {
        let arr = ControlArray::new(1);
        let logno = arr.take_free_slot().unwrap();
        let slot = arr.slot(logno);
        slot.attach_new(1, sample_meta()).unwrap();
        assert!(slot.reattach(2).is_err());
    }

    #[test]
    fn exhausted_slot_refuses_allocation() {
        let arr = ControlArray::new(1);
        assert!(arr.take_free_slot().is_ok());
        assert!(arr.take_free_slot().is_err());
    }
}
