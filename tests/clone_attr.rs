//! Validation and staging semantics of the set-clone-attributes call.

mod common;

use std::sync::Arc;

use common::{Harness, MAIN_PID};
use lwksched::attr::{
    Behavior, CloneAttr, CloneFlags, CloneResult, Placement, CLONE_RESULT_NONE,
    CLONE_RESULT_REQUESTED,
};
use lwksched::task::ThreadType;
use lwksched::types::Error;

fn harness() -> Harness {
    Harness::flat(8, &[0, 1, 2, 3], &[4, 5])
}

#[test]
fn conflicting_priority_bits_rejected() {
    let h = harness();
    let mut attr = CloneAttr::sized();
    attr.behavior = Behavior::HIGH_PRIO | Behavior::LOW_PRIO;
    assert_eq!(
        h.sched.set_clone_attr(MAIN_PID, &attr, 0, None, None, 0),
        Err(Error::AttrConflict)
    );
    // No hints recorded.
    assert!(h
        .sched
        .with_task(MAIN_PID, |t| t.lwk.clone_hints.is_none())
        .unwrap());
}

#[test]
fn size_mismatch_rejected() {
    let h = harness();
    let mut attr = CloneAttr::sized();
    attr.size += 4;
    assert_eq!(
        h.sched.set_clone_attr(MAIN_PID, &attr, 0, None, None, 0),
        Err(Error::ConfigInvalid)
    );
}

#[test]
fn multiple_placement_bits_rejected() {
    let h = harness();
    let mut attr = CloneAttr::sized();
    attr.placement = Placement::SAME_L1 | Placement::SAME_L3;
    assert_eq!(
        h.sched.set_clone_attr(MAIN_PID, &attr, 0, None, None, 0),
        Err(Error::AttrConflict)
    );
}

#[test]
fn exclusive_on_host_cpu_rejected() {
    let h = harness();
    let mut attr = CloneAttr::sized();
    attr.behavior = Behavior::EXCL;
    attr.placement = Placement::HOST_CPU;
    assert_eq!(
        h.sched.set_clone_attr(MAIN_PID, &attr, 0, None, None, 0),
        Err(Error::AttrConflict)
    );
}

#[test]
fn lwk_and_host_cpu_together_rejected() {
    let h = harness();
    let mut attr = CloneAttr::sized();
    attr.placement = Placement::LWK_CPU | Placement::HOST_CPU;
    assert_eq!(
        h.sched.set_clone_attr(MAIN_PID, &attr, 0, None, None, 0),
        Err(Error::AttrConflict)
    );
}

#[test]
fn fabric_interrupt_forces_host_placement() {
    let h = harness();
    let mut attr = CloneAttr::sized();
    attr.flags = CloneFlags::UTIL;
    attr.placement = Placement::FABRIC_INT;
    h.sched
        .set_clone_attr(MAIN_PID, &attr, 0, None, None, 0)
        .unwrap();
    let staged = h
        .sched
        .with_task(MAIN_PID, |t| t.lwk.clone_hints.clone())
        .unwrap()
        .unwrap();
    assert!(staged.location.contains(Placement::HOST_CPU));
}

#[test]
fn node_set_requires_nonempty_mask() {
    let h = harness();
    let mut attr = CloneAttr::sized();
    attr.placement = Placement::USE_NODE_SET;
    assert_eq!(
        h.sched.set_clone_attr(MAIN_PID, &attr, 65, Some(&[0]), None, 0),
        Err(Error::ConfigInvalid)
    );
    assert!(h
        .sched
        .set_clone_attr(MAIN_PID, &attr, 65, Some(&[1]), None, 0)
        .is_ok());
}

#[test]
fn key_and_node_set_are_mutually_exclusive() {
    let h = harness();
    let mut attr = CloneAttr::sized();
    attr.placement = Placement::USE_NODE_SET;
    assert_eq!(
        h.sched
            .set_clone_attr(MAIN_PID, &attr, 65, Some(&[1]), None, 0xbeef),
        Err(Error::AttrConflict)
    );
}

#[test]
fn requested_is_written_at_staging_time() {
    let h = harness();
    let result = Arc::new(CloneResult::new());
    let mut attr = CloneAttr::sized();
    attr.placement = Placement::SAME_L2;
    attr.behavior = Behavior::empty();
    h.sched
        .set_clone_attr(MAIN_PID, &attr, 0, None, Some(result.clone()), 0)
        .unwrap();
    assert_eq!(result.placement(), CLONE_RESULT_REQUESTED);
    assert_eq!(result.behavior(), CLONE_RESULT_NONE);
}

#[test]
fn clear_flag_wipes_staged_hints() {
    let h = harness();
    let mut attr = CloneAttr::sized();
    attr.flags = CloneFlags::UTIL;
    h.sched
        .set_clone_attr(MAIN_PID, &attr, 0, None, None, 0)
        .unwrap();
    assert!(h
        .sched
        .with_task(MAIN_PID, |t| t.lwk.clone_hints.is_some())
        .unwrap());

    let mut clear = CloneAttr::sized();
    clear.flags = CloneFlags::CLEAR;
    // A CLEAR request ignores otherwise-invalid bits.
    clear.behavior = Behavior::HIGH_PRIO | Behavior::LOW_PRIO;
    h.sched
        .set_clone_attr(MAIN_PID, &clear, 0, None, None, 0)
        .unwrap();
    assert!(h
        .sched
        .with_task(MAIN_PID, |t| t.lwk.clone_hints.is_none())
        .unwrap());
}

/// Staged hints drive exactly one fork; the next clone reverts to
/// compute placement.
#[test]
fn hints_are_consumed_exactly_once() {
    let mut h = harness();
    let mut attr = CloneAttr::sized();
    attr.flags = CloneFlags::UTIL;
    h.sched
        .set_clone_attr(MAIN_PID, &attr, 0, None, None, 0)
        .unwrap();

    let (first, _) = h.fork_thread(MAIN_PID);
    assert_eq!(h.thread_type(first), ThreadType::Utility);
    assert!(h
        .sched
        .with_task(MAIN_PID, |t| t.lwk.clone_hints.is_none())
        .unwrap());

    let (second, _) = h.fork_thread(MAIN_PID);
    assert_eq!(h.thread_type(second), ThreadType::Normal);
}

#[test]
fn unknown_caller_is_reported() {
    let h = harness();
    let attr = CloneAttr::sized();
    assert_eq!(
        h.sched.set_clone_attr(424242, &attr, 0, None, None, 0),
        Err(Error::NoSuchTask)
    );
}
