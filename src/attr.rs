//! Clone-attribute staging.
//!
//! User space describes the next thread creation's desired placement
//! and behaviour with a structured record; the validated form is staged
//! on the calling task and consumed exactly once by the fork hook.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicI32, Ordering};

use crate::cpuset::{NodeSet, MAX_NODES};
use crate::ktrace;
use crate::sched::LwkSched;
use crate::table::Pid;
use crate::types::Error;

bitflags::bitflags! {
    /// Control bits of the clone-attribute record.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CloneFlags: u32 {
        /// Wipe any previously staged hints.
        const CLEAR = 1 << 0;
        /// The next clone creates a utility thread.
        const UTIL = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Behaviour bits of the clone-attribute record.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Behavior: u32 {
        /// Reserve the chosen CPU exclusively for this thread's pid.
        const EXCL = 1 << 0;
        /// Run above every other LWK thread.
        const HIGH_PRIO = 1 << 1;
        /// Run below every other LWK thread.
        const LOW_PRIO = 1 << 2;
        /// Thread does not yield; force round-robin timeslicing.
        const NON_COOP = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Placement bits of the clone-attribute record.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Placement: u32 {
        const SAME_L1 = 1 << 0;
        const SAME_L2 = 1 << 1;
        const SAME_L3 = 1 << 2;
        const DIFF_L1 = 1 << 3;
        const DIFF_L2 = 1 << 4;
        const DIFF_L3 = 1 << 5;
        const SAME_DOMAIN = 1 << 6;
        const DIFF_DOMAIN = 1 << 7;
        /// Place within the supplied NUMA node set.
        const USE_NODE_SET = 1 << 8;
        /// Only LWK CPUs are acceptable.
        const LWK_CPU = 1 << 9;
        /// Only host CPUs are acceptable.
        const HOST_CPU = 1 << 10;
        /// Thread fields fabric interrupts; forces host placement.
        const FABRIC_INT = 1 << 11;
    }
}

impl Placement {
    /// Bits that select one topology relationship; at most one may be set.
    pub const SAMEDIFF: Placement = Placement::SAME_L1
        .union(Placement::SAME_L2)
        .union(Placement::SAME_L3)
        .union(Placement::DIFF_L1)
        .union(Placement::DIFF_L2)
        .union(Placement::DIFF_L3)
        .union(Placement::SAME_DOMAIN)
        .union(Placement::DIFF_DOMAIN);

    pub const CONFLICTS: Placement = Placement::SAMEDIFF.union(Placement::USE_NODE_SET);
}

/// The record user space hands to the set-clone-attributes call.
#[derive(Clone, Copy, Debug)]
pub struct CloneAttr {
    /// Interface structure size, for user/kernel mismatch detection.
    pub size: u32,
    pub flags: CloneFlags,
    pub behavior: Behavior,
    pub placement: Placement,
}

impl CloneAttr {
    /// A correctly sized record with nothing requested.
    pub fn sized() -> Self {
        Self {
            size: core::mem::size_of::<CloneAttr>() as u32,
            flags: CloneFlags::empty(),
            behavior: Behavior::empty(),
            placement: Placement::empty(),
        }
    }
}

/// Placement/behaviour outcome codes written back to user space.
pub const CLONE_RESULT_NONE: i32 = 0;
pub const CLONE_RESULT_REQUESTED: i32 = 1;
pub const CLONE_RESULT_ACCEPTED: i32 = 2;
pub const CLONE_RESULT_REJECTED: i32 = 3;

/// Result cell shared with user space; written as the hints are staged
/// and again when the cloned thread has been placed.
#[derive(Debug, Default)]
pub struct CloneResult {
    placement: AtomicI32,
    behavior: AtomicI32,
}

impl CloneResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn placement(&self) -> i32 {
        self.placement.load(Ordering::Acquire)
    }

    pub fn behavior(&self) -> i32 {
        self.behavior.load(Ordering::Acquire)
    }

    pub(crate) fn store(&self, placement: i32, behavior: i32) {
        self.placement.store(placement, Ordering::Release);
        self.behavior.store(behavior, Ordering::Release);
    }
}

/// Staged hints, consumed by the next fork of the staging task.
#[derive(Clone, Debug, Default)]
pub struct CloneHints {
    pub flags: CloneFlags,
    pub behavior: Behavior,
    pub location: Placement,
    pub nodes: NodeSet,
    pub key: u64,
    pub result: Option<Arc<CloneResult>>,
}

/// Hints that were actually accepted at placement time. Push
/// rebalancing consults these when relocating a utility thread.
#[derive(Clone, Debug, Default)]
pub struct ActiveHints {
    pub behavior: Behavior,
    pub location: Placement,
    pub nodes: NodeSet,
    pub key: u64,
}

/// True when the behaviour word only contains bits the core understands.
pub fn acceptable_behavior(b: Behavior) -> bool {
    Behavior::from_bits(b.bits()).is_some()
}

/// Detect conflicting placement directives.
fn placement_conflict(place: Placement, behavior: Behavior, location_key: u64) -> bool {
    if (place & Placement::CONFLICTS).bits().count_ones() > 1 {
        return true;
    }
    // Exclusive placement on a host CPU can never be honored.
    if behavior.contains(Behavior::EXCL) && place.contains(Placement::HOST_CPU) {
        return true;
    }
    // A location key and an explicit memory domain are mutually exclusive.
    if location_key != 0 && place.contains(Placement::USE_NODE_SET) {
        return true;
    }
    false
}

/// Copy a node mask from user-supplied words, Linux bitmap convention:
/// `max_node` counts one past the highest usable bit.
pub fn get_nodes(max_node: usize, nmask: Option<&[u64]>) -> Result<NodeSet, Error> {
    const PAGE_BITS: usize = 4096 * 8;

    let max_node = max_node.saturating_sub(1);
    if max_node == 0 || nmask.is_none() {
        return Ok(NodeSet::new());
    }
    if max_node > PAGE_BITS {
        return Err(Error::ConfigInvalid);
    }
    let words = nmask.unwrap();
    let mut nlongs = (max_node + 63) / 64;
    let mut endmask: u64 = if max_node % 64 == 0 {
        !0
    } else {
        (1u64 << (max_node % 64)) - 1
    };

    // When the caller specified more nodes than supported, the excess
    // part must be all zero.
    let supported_longs = (MAX_NODES + 63) / 64;
    if nlongs > supported_longs {
        for k in supported_longs..nlongs {
            let t = *words.get(k).ok_or(Error::UserFault)?;
            if k == nlongs - 1 {
                if t & endmask != 0 {
                    return Err(Error::ConfigInvalid);
                }
            } else if t != 0 {
                return Err(Error::ConfigInvalid);
            }
        }
        nlongs = supported_longs;
        endmask = !0;
    }

    let mut bits = *words.first().ok_or(Error::UserFault)?;
    if nlongs == 1 {
        bits &= endmask;
    }
    Ok(NodeSet::from_bits(bits))
}

impl LwkSched {
    /// Stage clone attributes on the calling task.
    ///
    /// Validates the record, writes "requested" into the result cell
    /// and stores the hints for the next fork. A CLEAR flag wipes any
    /// previously staged hints instead.
    pub fn set_clone_attr(
        &self,
        caller: Pid,
        attr: &CloneAttr,
        max_node: usize,
        user_nodes: Option<&[u64]>,
        result: Option<Arc<CloneResult>>,
        location_key: u64,
    ) -> Result<(), Error> {
        if attr.size != core::mem::size_of::<CloneAttr>() as u32 {
            // Interface structure size mismatch between user and kernel.
            return Err(Error::ConfigInvalid);
        }

        let nodes = get_nodes(max_node, user_nodes)?;

        let mut tasks = self.tasks.lock();
        let task = tasks.get_mut(caller).ok_or(Error::NoSuchTask)?;

        if attr.flags.contains(CloneFlags::CLEAR) {
            ktrace!("pid={} clone attributes cleared", caller);
            task.lwk.clone_hints = None;
            return Ok(());
        }

        let mut place = attr.placement;
        if placement_conflict(place, attr.behavior, location_key) {
            return Err(Error::AttrConflict);
        }
        if place.contains(Placement::USE_NODE_SET) && nodes.is_empty() {
            return Err(Error::ConfigInvalid);
        }
        if attr.behavior.contains(Behavior::HIGH_PRIO) && attr.behavior.contains(Behavior::LOW_PRIO)
        {
            return Err(Error::AttrConflict);
        }
        if place.contains(Placement::FABRIC_INT) {
            // Fabric interrupts must land on host CPUs.
            place |= Placement::HOST_CPU;
        }
        if place.contains(Placement::LWK_CPU) && place.contains(Placement::HOST_CPU) {
            return Err(Error::AttrConflict);
        }

        if let Some(cell) = result.as_deref() {
            cell.store(
                if place.is_empty() {
                    CLONE_RESULT_NONE
                } else {
                    CLONE_RESULT_REQUESTED
                },
                if attr.behavior.is_empty() {
                    CLONE_RESULT_NONE
                } else {
                    CLONE_RESULT_REQUESTED
                },
            );
        }

        task.lwk.clone_hints = Some(CloneHints {
            flags: attr.flags,
            behavior: attr.behavior,
            location: place,
            nodes,
            key: location_key,
            result,
        });
        ktrace!(
            "pid={} clone attributes staged behavior={:#x} placement={:#x}",
            caller,
            attr.behavior.bits(),
            place.bits()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samediff_bits_conflict_pairwise() {
        assert!(placement_conflict(
            Placement::SAME_L1 | Placement::SAME_L2,
            Behavior::empty(),
            0
        ));
        assert!(placement_conflict(
            Placement::SAME_L3 | Placement::USE_NODE_SET,
            Behavior::empty(),
            0
        ));
        assert!(!placement_conflict(
            Placement::SAME_L2,
            Behavior::empty(),
            0
        ));
    }

    #[test]
    fn exclusive_on_host_conflicts() {
        assert!(placement_conflict(
            Placement::HOST_CPU,
            Behavior::EXCL,
            0
        ));
        assert!(!placement_conflict(Placement::LWK_CPU, Behavior::EXCL, 0));
    }

    #[test]
    fn key_excludes_node_set() {
        assert!(placement_conflict(
            Placement::USE_NODE_SET,
            Behavior::empty(),
            77
        ));
    }

    #[test]
    fn node_mask_trailing_bits_validated() {
        // One word, 8 usable bits.
        let set = get_nodes(9, Some(&[0x81])).unwrap();
        assert!(set.is_set(0));
        assert!(set.is_set(7));
        // Bits past max_node are masked off.
        let set = get_nodes(5, Some(&[0xf0f])).unwrap();
        assert!(set.is_set(0));
        assert!(!set.is_set(8));
        // Excess words must be zero.
        assert_eq!(
            get_nodes(130, Some(&[1, 0, 1])),
            Err(Error::ConfigInvalid)
        );
        assert!(get_nodes(130, Some(&[1, 0, 0])).is_ok());
        // Short buffer is a fault.
        assert_eq!(get_nodes(130, Some(&[1])), Err(Error::UserFault));
    }

    #[test]
    fn unknown_behavior_bits_unacceptable() {
        assert!(acceptable_behavior(Behavior::empty()));
        assert!(acceptable_behavior(Behavior::HIGH_PRIO | Behavior::EXCL));
        assert!(!acceptable_behavior(Behavior::from_bits_retain(1 << 30)));
    }
}
