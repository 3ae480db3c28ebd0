//! Fixed-capacity slot arena with explicit ACTIVE / FREE bookkeeping.
//!
//! The original engine threaded processes through manual prev/next pointer
//! fields; this is the arena rendition: slots live in a fixed vector and
//! are referred to by small indices, the FREE set is an index stack, and
//! the ACTIVE set is an ordered vector of indices (the tick traversal
//! order). An index is in exactly one of the two sets at all times, so the
//! dangling-neighbor bugs of the pointer scheme cannot be expressed.

use rustc_hash::FxHashMap;

use crate::process::{ProcessId, Slot};

/// Bounded slot storage and set membership for the scheduler.
///
/// Capacity is fixed at construction; there is no growth path. Internal
/// invariant violations (double release, access to a FREE slot) are bugs,
/// not runtime conditions, and panic.
pub(crate) struct Pool {
    /// The arena. `None` marks a FREE slot's storage.
    slots: Vec<Option<Slot>>,
    /// FREE set: indices available for reuse, LIFO.
    free: Vec<usize>,
    /// ACTIVE set in traversal order: front is visited first.
    active: Vec<usize>,
    /// Id lookup for the ACTIVE set.
    by_id: FxHashMap<ProcessId, usize>,
}

impl Pool {
    pub fn new(capacity: usize) -> Self {
        Pool {
            // Reversed so that acquire() hands out low indices first.
            free: (0..capacity).rev().collect(),
            slots: (0..capacity).map(|_| None).collect(),
            active: Vec::with_capacity(capacity),
            by_id: FxHashMap::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Take one slot index from FREE. `None` when the pool is exhausted.
    pub fn acquire(&mut self) -> Option<usize> {
        self.free.pop()
    }

    /// Fill an acquired slot and link it into ACTIVE at `pos`.
    pub fn install(&mut self, idx: usize, slot: Slot, pos: usize) {
        debug_assert!(self.slots[idx].is_none(), "install into an occupied slot");
        self.by_id.insert(slot.id, idx);
        self.slots[idx] = Some(slot);
        let pos = pos.min(self.active.len());
        self.active.insert(pos, idx);
    }

    /// Unlink a slot from ACTIVE and return its storage to FREE.
    ///
    /// Double release is a programming error and panics.
    pub fn release(&mut self, idx: usize) {
        let slot = self.slots[idx].take().expect("release of a FREE slot");
        self.by_id.remove(&slot.id);
        let pos = self
            .position_of(idx)
            .expect("released slot missing from ACTIVE order");
        self.active.remove(pos);
        self.free.push(idx);
    }

    pub fn slot(&self, idx: usize) -> &Slot {
        self.slots[idx].as_ref().expect("FREE slot accessed")
    }

    pub fn slot_mut(&mut self, idx: usize) -> &mut Slot {
        self.slots[idx].as_mut().expect("FREE slot accessed")
    }

    pub fn index_of(&self, id: ProcessId) -> Option<usize> {
        self.by_id.get(&id).copied()
    }

    /// Position of a slot index within the ACTIVE order.
    pub fn position_of(&self, idx: usize) -> Option<usize> {
        self.active.iter().position(|&i| i == idx)
    }

    pub fn position_of_id(&self, id: ProcessId) -> Option<usize> {
        self.index_of(id).and_then(|idx| self.position_of(idx))
    }

    /// ACTIVE position of the first slot not yet stamped with `pass`.
    pub fn first_unstamped_position(&self, pass: u64) -> Option<usize> {
        self.active.iter().position(|&idx| self.slot(idx).pass != pass)
    }

    /// Slot index of the first ACTIVE member not yet stamped with `pass`.
    pub fn first_unstamped(&self, pass: u64) -> Option<usize> {
        self.first_unstamped_position(pass).map(|p| self.active[p])
    }

    /// Whether any ACTIVE member after `pos` is not yet stamped with `pass`.
    pub fn any_unstamped_after(&self, pos: usize, pass: u64) -> bool {
        self.active
            .iter()
            .skip(pos + 1)
            .any(|&idx| self.slot(idx).pass != pass)
    }

    pub fn active_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.active.iter().copied()
    }

    /// Move the ACTIVE entry at `from` to position `to`.
    pub fn move_entry(&mut self, from: usize, to: usize) {
        let idx = self.active.remove(from);
        let to = to.min(self.active.len());
        self.active.insert(to, idx);
    }

    /// Move the ACTIVE entry at `pos` to the very end of the order.
    pub fn move_to_back(&mut self, pos: usize) {
        let idx = self.active.remove(pos);
        self.active.push(idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coro::ProcessBody;
    use crate::process::DEFAULT_STACK_SIZE;
    use std::sync::Weak;

    fn dummy_slot(id: u64) -> Slot {
        let body = ProcessBody::new(
            ProcessId::new(id),
            Weak::new(),
            DEFAULT_STACK_SIZE,
            |_ctx, _: ()| {},
            (),
        );
        Slot::new(ProcessId::new(id), body, 1)
    }

    #[test]
    fn acquire_hands_out_low_indices_first() {
        let mut pool = Pool::new(3);
        assert_eq!(pool.acquire(), Some(0));
        assert_eq!(pool.acquire(), Some(1));
        assert_eq!(pool.acquire(), Some(2));
        assert_eq!(pool.acquire(), None);
    }

    #[test]
    fn install_and_release_round_trip() {
        let mut pool = Pool::new(2);
        let idx = pool.acquire().unwrap();
        pool.install(idx, dummy_slot(0), 0);
        assert_eq!(pool.active_len(), 1);
        assert_eq!(pool.index_of(ProcessId::new(0)), Some(idx));

        pool.release(idx);
        assert_eq!(pool.active_len(), 0);
        assert_eq!(pool.index_of(ProcessId::new(0)), None);
        // Storage is reusable.
        assert_eq!(pool.acquire(), Some(idx));
    }

    #[test]
    #[should_panic(expected = "release of a FREE slot")]
    fn double_release_panics() {
        let mut pool = Pool::new(1);
        let idx = pool.acquire().unwrap();
        pool.install(idx, dummy_slot(0), 0);
        pool.release(idx);
        pool.release(idx);
    }

    #[test]
    fn active_order_and_moves() {
        let mut pool = Pool::new(4);
        for id in 0..3u64 {
            let idx = pool.acquire().unwrap();
            // Append each at the back.
            let back = pool.active_len();
            pool.install(idx, dummy_slot(id), back);
        }
        let order: Vec<usize> = pool.active_indices().collect();
        assert_eq!(order, vec![0, 1, 2]);

        pool.move_to_back(0);
        assert_eq!(pool.active_indices().collect::<Vec<_>>(), vec![1, 2, 0]);

        pool.move_entry(2, 0);
        assert_eq!(pool.active_indices().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn unstamped_scan_skips_stamped_slots() {
        let mut pool = Pool::new(3);
        for id in 0..3u64 {
            let idx = pool.acquire().unwrap();
            let back = pool.active_len();
            pool.install(idx, dummy_slot(id), back);
        }
        assert_eq!(pool.first_unstamped(7), Some(0));

        pool.slot_mut(0).pass = 7;
        assert_eq!(pool.first_unstamped(7), Some(1));
        assert!(pool.any_unstamped_after(0, 7));

        pool.slot_mut(1).pass = 7;
        pool.slot_mut(2).pass = 7;
        assert_eq!(pool.first_unstamped(7), None);
        assert!(!pool.any_unstamped_after(0, 7));
    }
}
