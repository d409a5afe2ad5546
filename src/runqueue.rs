//! Per-CPU priority-indexed run queue.
//!
//! One queue slot per real-time priority level, one reserved slot for
//! deadline-class guests, one for fair-class guests and one for the LWK
//! idle task. A two-word bitmap tracks non-empty slots so picking the
//! next task is a find-first-set plus a list head read.
//!
//! Entities are linked through a fixed node pool inside the queue:
//! enqueue hands out an [`RqHandle`] the caller keeps on the task, so
//! enqueue, dequeue and requeue are O(1) and never allocate.

use crate::kwarn_once;
use crate::table::Pid;
use crate::types::{LWK_IDLE_PRIO, MAX_PRIO, MAX_RT_PRIO};
use crate::types::Error;

/// Queue slot layout: internal RT priorities map directly onto slots
/// 0..=98; the three slots after the RT range hold deadline guests,
/// fair guests and the LWK idle task.
pub const RQ_DL_INDEX: usize = (MAX_RT_PRIO - 1) as usize;
pub const RQ_FAIR_INDEX: usize = RQ_DL_INDEX + 1;
pub const RQ_IDLE_INDEX: usize = RQ_FAIR_INDEX + 1;
pub const RQ_NUM_SLOTS: usize = RQ_IDLE_INDEX + 1;

/// Most entities one CPU's queue can hold.
pub const RQ_CAPACITY: usize = 128;

const NIL: u16 = u16::MAX;

/// Convert an internal priority into its queue slot index.
///
/// Deadline guests carry a negative priority, fair guests sit in the
/// nice range and the idle task uses its sentinel. Anything else is a
/// bug somewhere above us; such tasks are parked on the idle slot so
/// they cannot starve real work.
pub fn rq_index(prio: i32) -> usize {
    if (0..MAX_RT_PRIO - 1).contains(&prio) {
        prio as usize
    } else if prio < 0 {
        RQ_DL_INDEX
    } else if (MAX_RT_PRIO..MAX_PRIO).contains(&prio) {
        RQ_FAIR_INDEX
    } else if prio == LWK_IDLE_PRIO {
        RQ_IDLE_INDEX
    } else {
        kwarn_once!("unexpected priority {:#x}", prio);
        RQ_IDLE_INDEX
    }
}

/// Opaque position of an enqueued entity, kept by the owner task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RqHandle(u16);

bitflags::bitflags! {
    /// Per-entity queueing properties fixed at enqueue time.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EnqueueFlags: u8 {
        /// Place at the head of the slot instead of the tail.
        const HEAD = 1 << 0;
        /// Entity runs with round-robin timeslicing.
        const RR = 1 << 1;
        /// Entity is the CPU's LWK idle task.
        const IDLE = 1 << 2;
    }
}

#[derive(Clone, Copy)]
struct Node {
    pid: Pid,
    /// Slot the node is queued on; `NIL` marks a free node.
    slot: u16,
    prev: u16,
    next: u16,
    flags: EnqueueFlags,
}

impl Node {
    const fn free(next: u16) -> Self {
        Self {
            pid: 0,
            slot: NIL,
            prev: NIL,
            next,
            flags: EnqueueFlags::empty(),
        }
    }
}

#[derive(Clone, Copy)]
struct SlotList {
    head: u16,
    tail: u16,
}

impl SlotList {
    const EMPTY: Self = Self {
        head: NIL,
        tail: NIL,
    };
}

/// Bitmap over the queue slots with O(1) first-set lookup.
#[derive(Clone, Copy, Default)]
pub struct PrioBitmap {
    words: [u64; 2],
}

impl PrioBitmap {
    #[inline]
    fn set(&mut self, idx: usize) {
        self.words[idx / 64] |= 1 << (idx % 64);
    }

    #[inline]
    fn clear(&mut self, idx: usize) {
        self.words[idx / 64] &= !(1 << (idx % 64));
    }

    #[inline]
    pub fn is_set(&self, idx: usize) -> bool {
        (self.words[idx / 64] >> (idx % 64)) & 1 != 0
    }

    /// Lowest set slot index.
    #[inline]
    pub fn first_set(&self) -> Option<usize> {
        for (i, &w) in self.words.iter().enumerate() {
            if w != 0 {
                return Some(i * 64 + w.trailing_zeros() as usize);
            }
        }
        None
    }
}

/// The per-CPU LWK run queue.
pub struct LwkRunQueue {
    bitmap: PrioBitmap,
    slots: [SlotList; RQ_NUM_SLOTS],
    nodes: [Node; RQ_CAPACITY],
    free_head: u16,
    /// Runnable entities, LWK idle excluded.
    nr_running: u32,
    /// Runnable entities with round-robin timeslicing.
    rr_nr_running: u32,
    /// Task last handed out by pick-first.
    current: Option<Pid>,
}

impl Default for LwkRunQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl LwkRunQueue {
    pub fn new() -> Self {
        let mut nodes = [Node::free(NIL); RQ_CAPACITY];
        for (i, n) in nodes.iter_mut().enumerate() {
            n.next = if i + 1 < RQ_CAPACITY {
                (i + 1) as u16
            } else {
                NIL
            };
        }
        Self {
            bitmap: PrioBitmap::default(),
            slots: [SlotList::EMPTY; RQ_NUM_SLOTS],
            nodes,
            free_head: 0,
            nr_running: 0,
            rr_nr_running: 0,
            current: None,
        }
    }

    #[inline]
    pub fn nr_running(&self) -> u32 {
        self.nr_running
    }

    #[inline]
    pub fn rr_nr_running(&self) -> u32 {
        self.rr_nr_running
    }

    #[inline]
    pub fn current(&self) -> Option<Pid> {
        self.current
    }

    #[inline]
    pub fn set_current(&mut self, pid: Option<Pid>) {
        self.current = pid;
    }

    #[inline]
    pub fn bitmap(&self) -> &PrioBitmap {
        &self.bitmap
    }

    fn alloc_node(&mut self) -> Option<u16> {
        let idx = self.free_head;
        if idx == NIL {
            return None;
        }
        self.free_head = self.nodes[idx as usize].next;
        Some(idx)
    }

    fn release_node(&mut self, idx: u16) {
        self.nodes[idx as usize] = Node::free(self.free_head);
        self.free_head = idx;
    }

    /// Place `pid` on the queue slot for `qindex`.
    pub fn enqueue(
        &mut self,
        pid: Pid,
        qindex: usize,
        flags: EnqueueFlags,
    ) -> Result<RqHandle, Error> {
        debug_assert!(qindex < RQ_NUM_SLOTS);
        let idx = self.alloc_node().ok_or(Error::AllocFail)?;
        {
            let node = &mut self.nodes[idx as usize];
            node.pid = pid;
            node.slot = qindex as u16;
            node.flags = flags;
            node.prev = NIL;
            node.next = NIL;
        }
        self.link(idx, qindex, flags.contains(EnqueueFlags::HEAD));
        self.bitmap.set(qindex);

        if !flags.contains(EnqueueFlags::IDLE) {
            self.nr_running += 1;
            if flags.contains(EnqueueFlags::RR) {
                self.rr_nr_running += 1;
            }
        }
        Ok(RqHandle(idx))
    }

    /// Remove the entity behind `handle` and return its pid.
    ///
    /// The caller is responsible for never dequeueing the LWK idle
    /// entity; the adapter guards that case.
    pub fn dequeue(&mut self, handle: RqHandle) -> Result<Pid, Error> {
        let idx = handle.0;
        let node = self.nodes[idx as usize];
        if node.slot == NIL {
            return Err(Error::NoSuchTask);
        }
        self.unlink(idx);
        let slot = node.slot as usize;
        if self.slots[slot].head == NIL {
            if !self.bitmap.is_set(slot) {
                panic!("run queue corruption: populated slot {} unmarked", slot);
            }
            self.bitmap.clear(slot);
        }
        if !node.flags.contains(EnqueueFlags::IDLE) {
            self.nr_running -= 1;
            if node.flags.contains(EnqueueFlags::RR) {
                self.rr_nr_running -= 1;
            }
        }
        self.release_node(idx);
        Ok(node.pid)
    }

    fn unlink(&mut self, idx: u16) {
        let node = self.nodes[idx as usize];
        let slot = node.slot as usize;
        if node.prev != NIL {
            self.nodes[node.prev as usize].next = node.next;
        } else {
            self.slots[slot].head = node.next;
        }
        if node.next != NIL {
            self.nodes[node.next as usize].prev = node.prev;
        } else {
            self.slots[slot].tail = node.prev;
        }
    }

    fn link(&mut self, idx: u16, slot: usize, head: bool) {
        let (old_head, old_tail) = (self.slots[slot].head, self.slots[slot].tail);
        if head {
            self.nodes[idx as usize].next = old_head;
            if old_head != NIL {
                self.nodes[old_head as usize].prev = idx;
            } else {
                self.slots[slot].tail = idx;
            }
            self.slots[slot].head = idx;
        } else {
            self.nodes[idx as usize].prev = old_tail;
            if old_tail != NIL {
                self.nodes[old_tail as usize].next = idx;
            } else {
                self.slots[slot].head = idx;
            }
            self.slots[slot].tail = idx;
        }
    }

    /// Rotate the entity within its current slot.
    pub fn requeue(&mut self, handle: RqHandle, head: bool) -> Result<(), Error> {
        let idx = handle.0;
        let node = self.nodes[idx as usize];
        if node.slot == NIL {
            return Err(Error::NoSuchTask);
        }
        let slot = node.slot as usize;
        self.unlink(idx);
        {
            let node = &mut self.nodes[idx as usize];
            node.prev = NIL;
            node.next = NIL;
        }
        self.link(idx, slot, head);
        Ok(())
    }

    /// First entity of the lowest-indexed non-empty slot, if any.
    pub fn pick_first(&self) -> Option<(usize, Pid)> {
        let idx = self.bitmap.first_set()?;
        let head = self.slots[idx].head;
        if head == NIL {
            panic!("run queue corruption: marked slot {} empty", idx);
        }
        Some((idx, self.nodes[head as usize].pid))
    }

    /// Slot index the handle is queued on.
    pub fn slot_of(&self, handle: RqHandle) -> Option<usize> {
        let node = &self.nodes[handle.0 as usize];
        if node.slot == NIL {
            None
        } else {
            Some(node.slot as usize)
        }
    }

    /// True when the entity is alone on its priority slot.
    pub fn is_singular(&self, handle: RqHandle) -> bool {
        let node = &self.nodes[handle.0 as usize];
        node.slot != NIL && node.prev == NIL && node.next == NIL
    }

    /// Entities queued on one slot, front to back. Test support.
    pub fn slot_pids(&self, qindex: usize) -> impl Iterator<Item = Pid> + '_ {
        let mut cur = self.slots[qindex].head;
        core::iter::from_fn(move || {
            if cur == NIL {
                return None;
            }
            let node = &self.nodes[cur as usize];
            cur = node.next;
            Some(node.pid)
        })
    }

    /// Verify the bitmap mirrors slot occupancy exactly.
    pub fn assert_consistent(&self) {
        for (i, list) in self.slots.iter().enumerate() {
            let occupied = list.head != NIL;
            assert_eq!(
                occupied,
                self.bitmap.is_set(i),
                "slot {} occupancy disagrees with bitmap",
                i
            );
            if occupied {
                assert_eq!(self.nodes[list.head as usize].prev, NIL);
                assert_eq!(self.nodes[list.tail as usize].next, NIL);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LWK_DEFAULT_PRIO, LWK_HIGH_PRIO};

    #[test]
    fn index_mapping_covers_all_bands() {
        assert_eq!(rq_index(0), 0);
        assert_eq!(rq_index(98), 98);
        assert_eq!(rq_index(-1), RQ_DL_INDEX);
        assert_eq!(rq_index(120), RQ_FAIR_INDEX);
        assert_eq!(rq_index(LWK_IDLE_PRIO), RQ_IDLE_INDEX);
        assert_eq!(rq_index(MAX_RT_PRIO - 1), RQ_IDLE_INDEX);
    }

    #[test]
    fn enqueue_dequeue_round_trip() {
        let mut rq = LwkRunQueue::new();
        let h = rq
            .enqueue(7, rq_index(LWK_DEFAULT_PRIO), EnqueueFlags::empty())
            .unwrap();
        assert_eq!(rq.nr_running(), 1);
        assert_eq!(rq.pick_first(), Some((LWK_DEFAULT_PRIO as usize, 7)));
        assert!(rq.is_singular(h));
        assert_eq!(rq.dequeue(h).unwrap(), 7);
        assert_eq!(rq.nr_running(), 0);
        assert_eq!(rq.pick_first(), None);
        rq.assert_consistent();
    }

    #[test]
    fn head_and_tail_ordering() {
        let mut rq = LwkRunQueue::new();
        let slot = rq_index(LWK_DEFAULT_PRIO);
        rq.enqueue(1, slot, EnqueueFlags::empty()).unwrap();
        rq.enqueue(2, slot, EnqueueFlags::empty()).unwrap();
        rq.enqueue(3, slot, EnqueueFlags::HEAD).unwrap();
        let order: std::vec::Vec<Pid> = rq.slot_pids(slot).collect();
        assert_eq!(order, std::vec![3, 1, 2]);
    }

    #[test]
    fn lower_index_wins_pick() {
        let mut rq = LwkRunQueue::new();
        rq.enqueue(10, rq_index(LWK_DEFAULT_PRIO), EnqueueFlags::empty())
            .unwrap();
        rq.enqueue(11, rq_index(LWK_HIGH_PRIO), EnqueueFlags::empty())
            .unwrap();
        assert_eq!(rq.pick_first(), Some((LWK_HIGH_PRIO as usize, 11)));
    }

    #[test]
    fn requeue_rotates_within_slot() {
        let mut rq = LwkRunQueue::new();
        let slot = rq_index(LWK_DEFAULT_PRIO);
        let h1 = rq.enqueue(1, slot, EnqueueFlags::empty()).unwrap();
        rq.enqueue(2, slot, EnqueueFlags::empty()).unwrap();
        rq.requeue(h1, false).unwrap();
        let order: std::vec::Vec<Pid> = rq.slot_pids(slot).collect();
        assert_eq!(order, std::vec![2, 1]);
        assert!(!rq.is_singular(h1));
    }

    #[test]
    fn idle_entity_not_counted() {
        let mut rq = LwkRunQueue::new();
        rq.enqueue(99, RQ_IDLE_INDEX, EnqueueFlags::IDLE).unwrap();
        assert_eq!(rq.nr_running(), 0);
        assert_eq!(rq.pick_first(), Some((RQ_IDLE_INDEX, 99)));
    }

    #[test]
    fn pool_exhaustion_reports_alloc_fail() {
        let mut rq = LwkRunQueue::new();
        for pid in 0..RQ_CAPACITY as Pid {
            rq.enqueue(pid, 0, EnqueueFlags::empty()).unwrap();
        }
        assert_eq!(
            rq.enqueue(9999, 0, EnqueueFlags::empty()),
            Err(Error::AllocFail)
        );
    }

    #[test]
    fn rr_counter_tracks_rr_entities() {
        let mut rq = LwkRunQueue::new();
        let h = rq.enqueue(5, 3, EnqueueFlags::RR).unwrap();
        rq.enqueue(6, 3, EnqueueFlags::empty()).unwrap();
        assert_eq!(rq.rr_nr_running(), 1);
        rq.dequeue(h).unwrap();
        assert_eq!(rq.rr_nr_running(), 0);
        assert_eq!(rq.nr_running(), 1);
    }
}
