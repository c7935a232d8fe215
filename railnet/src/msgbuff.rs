//! Message buffer: a sliding window reconciling unordered arrivals with
//! local posts.
//!
//! Each in-flight message sequence number owns one slot. The first party to
//! touch a slot — the local `send`/`recv` post or the unsolicited arrival of
//! the peer's ctrl/eager message — inserts its element; the other party
//! observes the occupied slot and replaces the element with its own. A slot
//! moves `NotStarted → InProgress → Completed`; once the oldest slots
//! complete, the window advances and the slots are recycled for sequence
//! numbers one wrap ahead.

use crate::wire::SEQ_RANGE;

/// What a slot currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemType {
    /// A local request (pool index).
    Req,
    /// An unsolicited arrival held in a bounce buffer (pool index).
    Buff,
}

/// Slot payload: a pool index tagged with its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elem {
    pub kind: ElemType,
    pub idx: usize,
}

impl Elem {
    pub fn req(idx: usize) -> Self {
        Self {
            kind: ElemType::Req,
            idx,
        }
    }

    pub fn buff(idx: usize) -> Self {
        Self {
            kind: ElemType::Buff,
            idx,
        }
    }
}

/// Progress state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    NotStarted,
    InProgress,
    Completed,
}

/// Outcome of an [`MsgBuff::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    Inserted,
    /// The slot was not `NotStarted`; carries the status the caller raced
    /// against so it can decide between `replace` and reporting a duplicate.
    Occupied(SlotStatus),
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    status: SlotStatus,
    elem: Option<Elem>,
}

const EMPTY_SLOT: Slot = Slot {
    status: SlotStatus::NotStarted,
    elem: None,
};

/// Fixed-capacity sliding window keyed by sequence number.
///
/// The capacity must not exceed half of the sequence space so that a slot can
/// never alias two live sequence numbers.
pub struct MsgBuff {
    slots: Box<[Slot]>,
    capacity: u16,
    seq_mask: u16,
    /// Oldest sequence number that has not completed; start of the window.
    last_incomplete: u16,
}

impl MsgBuff {
    pub fn new(capacity: u16) -> Self {
        assert!(capacity.is_power_of_two());
        assert!(capacity <= SEQ_RANGE / 2);
        Self {
            slots: vec![EMPTY_SLOT; capacity as usize].into_boxed_slice(),
            capacity,
            seq_mask: SEQ_RANGE - 1,
            last_incomplete: 0,
        }
    }

    #[inline]
    fn dist(&self, from: u16, to: u16) -> u16 {
        (to.wrapping_sub(from)) & self.seq_mask
    }

    #[inline]
    fn in_window(&self, seq: u16) -> bool {
        self.dist(self.last_incomplete, seq) < self.capacity
    }

    #[inline]
    fn slot_index(&self, seq: u16) -> usize {
        (seq & (self.capacity - 1)) as usize
    }

    fn status_of(&self, seq: u16) -> SlotStatus {
        if self.in_window(seq) {
            self.slots[self.slot_index(seq)].status
        } else if self.dist(seq, self.last_incomplete) <= SEQ_RANGE / 2 {
            // Behind the window: long since completed and recycled.
            SlotStatus::Completed
        } else {
            // Too far ahead to be representable.
            SlotStatus::NotStarted
        }
    }

    /// Claim the slot for `seq`. Succeeds only on a `NotStarted` slot inside
    /// the window, moving it to `InProgress`.
    pub fn insert(&mut self, seq: u16, elem: Elem) -> InsertResult {
        let status = self.status_of(seq);
        if status != SlotStatus::NotStarted || !self.in_window(seq) {
            return InsertResult::Occupied(status);
        }
        let idx = self.slot_index(seq);
        self.slots[idx] = Slot {
            status: SlotStatus::InProgress,
            elem: Some(elem),
        };
        InsertResult::Inserted
    }

    /// Swap the element of an `InProgress` slot without changing its status.
    pub fn replace(&mut self, seq: u16, elem: Elem) -> Result<(), SlotStatus> {
        let status = self.status_of(seq);
        if !self.in_window(seq) || status != SlotStatus::InProgress {
            return Err(status);
        }
        let idx = self.slot_index(seq);
        self.slots[idx].elem = Some(elem);
        Ok(())
    }

    /// Look up the slot for `seq` without modifying it.
    pub fn retrieve(&self, seq: u16) -> (Option<Elem>, SlotStatus) {
        let status = self.status_of(seq);
        if self.in_window(seq) {
            (self.slots[self.slot_index(seq)].elem, status)
        } else {
            (None, status)
        }
    }

    /// Transition an `InProgress` slot to `Completed` and advance the window
    /// past any completed prefix.
    pub fn complete(&mut self, seq: u16) -> Result<(), SlotStatus> {
        let status = self.status_of(seq);
        if !self.in_window(seq) || status != SlotStatus::InProgress {
            return Err(status);
        }
        let idx = self.slot_index(seq);
        self.slots[idx].status = SlotStatus::Completed;
        self.slots[idx].elem = None;

        while self.slots[self.slot_index(self.last_incomplete)].status == SlotStatus::Completed {
            let idx = self.slot_index(self.last_incomplete);
            self.slots[idx] = EMPTY_SLOT;
            self.last_incomplete = self.last_incomplete.wrapping_add(1) & self.seq_mask;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_then_complete() {
        let mut mb = MsgBuff::new(256);
        assert_eq!(mb.insert(0, Elem::req(5)), InsertResult::Inserted);
        let (elem, status) = mb.retrieve(0);
        assert_eq!(status, SlotStatus::InProgress);
        assert_eq!(elem, Some(Elem::req(5)));
        mb.complete(0).unwrap();
        // Behind the window now; reads as completed.
        assert_eq!(mb.retrieve(0).1, SlotStatus::Completed);
    }

    #[test]
    fn test_race_closure_both_orders() {
        // Arrival first, post second.
        let mut mb = MsgBuff::new(256);
        assert_eq!(mb.insert(3, Elem::buff(9)), InsertResult::Inserted);
        assert_eq!(
            mb.insert(3, Elem::req(1)),
            InsertResult::Occupied(SlotStatus::InProgress)
        );
        mb.replace(3, Elem::req(1)).unwrap();
        assert_eq!(mb.retrieve(3).0, Some(Elem::req(1)));

        // Post first, arrival second.
        let mut mb = MsgBuff::new(256);
        assert_eq!(mb.insert(3, Elem::req(1)), InsertResult::Inserted);
        assert_eq!(
            mb.insert(3, Elem::buff(9)),
            InsertResult::Occupied(SlotStatus::InProgress)
        );
        // The arrival side retrieves the request instead of replacing.
        assert_eq!(mb.retrieve(3).0, Some(Elem::req(1)));
    }

    #[test]
    fn test_replace_requires_in_progress() {
        let mut mb = MsgBuff::new(256);
        assert_eq!(
            mb.replace(0, Elem::req(1)),
            Err(SlotStatus::NotStarted)
        );
        mb.insert(0, Elem::req(1));
        mb.complete(0).unwrap();
        assert_eq!(mb.replace(0, Elem::req(2)), Err(SlotStatus::Completed));
    }

    #[test]
    fn test_window_advance_and_wraparound() {
        let mut mb = MsgBuff::new(256);
        // Fill and complete a full sequence-space lap plus a bit.
        for lap in 0..5u16 {
            for i in 0..256u16 {
                let seq = (lap.wrapping_mul(256).wrapping_add(i)) & (SEQ_RANGE - 1);
                assert_eq!(mb.insert(seq, Elem::req(seq as usize)), InsertResult::Inserted);
                mb.complete(seq).unwrap();
            }
        }
    }

    #[test]
    fn test_out_of_order_completion_holds_window() {
        let mut mb = MsgBuff::new(256);
        mb.insert(0, Elem::req(0));
        mb.insert(1, Elem::req(1));
        mb.complete(1).unwrap();
        // Window start (0) not complete: slot 1 still reads completed,
        // inserting 256 must fail (would alias slot 0).
        assert_eq!(mb.retrieve(1).1, SlotStatus::Completed);
        assert!(matches!(mb.insert(256, Elem::req(2)), InsertResult::Occupied(_)));
        mb.complete(0).unwrap();
        // Both now behind; window advanced past 2 slots.
        assert_eq!(mb.insert(256, Elem::req(2)), InsertResult::Inserted);
    }

    #[test]
    fn test_duplicate_insert_same_side_detectable() {
        let mut mb = MsgBuff::new(256);
        mb.insert(7, Elem::req(1));
        // A duplicate post observes InProgress with a Req element; the caller
        // treats that as a programming error.
        let (elem, status) = mb.retrieve(7);
        assert_eq!(status, SlotStatus::InProgress);
        assert_eq!(elem.unwrap().kind, ElemType::Req);
    }
}
