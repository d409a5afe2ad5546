//! Utility-thread placement: topology hints, grouping keys, behaviour
//! bits and the host spill-over path.

mod common;

use std::sync::Arc;

use common::{Harness, MAIN_PID};
use lwksched::attr::{
    Behavior, CloneAttr, CloneFlags, CloneResult, Placement, CLONE_RESULT_ACCEPTED,
    CLONE_RESULT_REJECTED,
};
use lwksched::task::{SchedClass, ThreadType};
use lwksched::topology::Topology;
use lwksched::types::{LWK_HIGH_PRIO, LWK_LOW_PRIO};

fn util_attr(placement: Placement, behavior: Behavior) -> CloneAttr {
    let mut attr = CloneAttr::sized();
    attr.flags = CloneFlags::UTIL;
    attr.behavior = behavior;
    attr.placement = placement;
    attr
}

/// Same-L2 placement lands the utility thread next to the caller's
/// committed home and reports ACCEPTED.
#[test]
fn same_l2_placement_accepted() {
    // CPUs 0,1 share one L2; CPUs 2,3 share another.
    let topology = Topology::symmetric(4, 2, 4, 4);
    let mut h = Harness::with_topology(topology, &[0, 1, 2, 3], &[]);

    // Commit the main thread to CPU 0 the way the launch migration
    // would.
    h.sched.set_task_cpu(MAIN_PID, 0);
    assert_eq!(h.cpu_home(MAIN_PID), Some(0));

    let result = Arc::new(CloneResult::new());
    let attr = util_attr(Placement::SAME_L2, Behavior::empty());
    h.sched
        .set_clone_attr(MAIN_PID, &attr, 0, None, Some(result.clone()), 0)
        .unwrap();

    let (pid, cpu) = h.fork_thread(MAIN_PID);
    assert_eq!(cpu, 1, "CPU 1 is the free CPU sharing L2 with CPU 0");
    assert_eq!(h.utility_commits(1), 1);
    assert_eq!(h.thread_type(pid), ThreadType::Utility);
    assert_eq!(result.placement(), CLONE_RESULT_ACCEPTED);
    // An empty behaviour word is acceptable, so it reads ACCEPTED too.
    assert_eq!(result.behavior(), CLONE_RESULT_ACCEPTED);
}

/// An unsatisfiable placement relaxes down the ladder, still places
/// the thread and reports REJECTED.
#[test]
fn unsatisfiable_placement_relaxes_and_rejects() {
    // One domain, one L2/L3: nothing "different" exists.
    let topology = Topology::symmetric(8, 8, 8, 8);
    let mut h = Harness::with_topology(topology, &[0, 1, 2, 3], &[4, 5]);
    h.sched.set_task_cpu(MAIN_PID, 0);

    let result = Arc::new(CloneResult::new());
    let attr = util_attr(Placement::DIFF_DOMAIN, Behavior::empty());
    h.sched
        .set_clone_attr(MAIN_PID, &attr, 0, None, Some(result.clone()), 0)
        .unwrap();

    let (pid, _) = h.fork_thread(MAIN_PID);
    // Placed somewhere despite the impossible request.
    assert!(h.cpu_home(pid).is_some());
    assert_eq!(result.placement(), CLONE_RESULT_REJECTED);
    // Relaxed placements are not recorded as active hints.
    let active = h
        .sched
        .with_task(pid, |t| t.lwk.active_hints.location)
        .unwrap();
    assert!(active.is_empty());
}

/// Two concurrent forks with the same new grouping key create exactly
/// one registry entry and anchor consistently.
#[test]
fn concurrent_keyed_forks_share_one_anchor() {
    const KEY: u64 = 0x5eed;
    let topology = Topology::symmetric(8, 2, 8, 8);
    let mut h = Harness::with_topology(topology, &[0, 1, 2, 3], &[4, 5]);

    // Two worker threads act as the forking parents.
    let (p1, _) = h.fork_thread(MAIN_PID);
    let (p2, _) = h.fork_thread(MAIN_PID);
    let attr = util_attr(Placement::SAME_L2, Behavior::empty());
    h.sched
        .set_clone_attr(p1, &attr, 0, None, None, KEY)
        .unwrap();
    h.sched
        .set_clone_attr(p2, &attr, 0, None, None, KEY)
        .unwrap();

    let sched = h.sched.clone();
    let c1 = 5001;
    let c2 = 5002;
    let t1 = {
        let sched = sched.clone();
        std::thread::spawn(move || {
            sched.task_fork(p1, c1, true).unwrap();
            sched.wake_new_task(c1).unwrap();
        })
    };
    let t2 = {
        let sched = sched.clone();
        std::thread::spawn(move || {
            sched.task_fork(p2, c2, true).unwrap();
            sched.wake_new_task(c2).unwrap();
        })
    };
    t1.join().unwrap();
    t2.join().unwrap();

    let entries = h.sched.util_group_snapshot();
    let live: Vec<_> = entries.iter().filter(|e| e.key != 0).collect();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].key, KEY);
    assert_eq!(live[0].refcount, 2);

    // Both children adopted the same anchor attribute.
    let anchor_l2 = live[0].topology.l2c_id;
    for pid in [c1, c2] {
        let home = h.sched.with_task(pid, |t| t.lwk.cpu_home).unwrap().unwrap();
        assert_eq!(h.sched.cpu(home).topology().l2c_id, anchor_l2);
        assert_eq!(
            h.sched.with_task(pid, |t| t.lwk.active_hints.key).unwrap(),
            KEY
        );
    }
}

/// High/low behaviour bits move the thread into the dedicated LWK
/// priority bands; NON_COOP forces round-robin.
#[test]
fn behaviour_bits_adjust_priority_and_policy() {
    let mut h = Harness::flat(8, &[0, 1, 2, 3], &[4]);

    let attr = util_attr(Placement::empty(), Behavior::HIGH_PRIO);
    h.sched
        .set_clone_attr(MAIN_PID, &attr, 0, None, None, 0)
        .unwrap();
    let (hi, _) = h.fork_thread(MAIN_PID);
    assert_eq!(h.sched.with_task(hi, |t| t.prio).unwrap(), LWK_HIGH_PRIO);

    let attr = util_attr(Placement::empty(), Behavior::LOW_PRIO | Behavior::NON_COOP);
    h.sched
        .set_clone_attr(MAIN_PID, &attr, 0, None, None, 0)
        .unwrap();
    let (lo, _) = h.fork_thread(MAIN_PID);
    assert_eq!(h.sched.with_task(lo, |t| t.prio).unwrap(), LWK_LOW_PRIO);
    assert_eq!(
        h.sched
            .with_task(lo, |t| t.policy)
            .unwrap(),
        lwksched::SchedPolicy::Rr
    );
}

/// With every LWK CPU at its utility threshold, placement spills onto
/// the shared host pool and hands the thread to the host scheduler.
#[test]
fn utility_threads_spill_to_host_pool() {
    let mut h = Harness::flat(8, &[0, 1], &[4, 5]);

    let attr = util_attr(Placement::empty(), Behavior::empty());
    let mut lwk_placed = Vec::new();
    for _ in 0..2 {
        h.sched
            .set_clone_attr(MAIN_PID, &attr, 0, None, None, 0)
            .unwrap();
        lwk_placed.push(h.fork_thread(MAIN_PID));
    }
    // Tail-first over the sequence.
    assert_eq!(lwk_placed[0].1, 1);
    assert_eq!(lwk_placed[1].1, 0);

    // Third one exceeds max_util_threads_per_cpu = 1 everywhere.
    h.sched
        .set_clone_attr(MAIN_PID, &attr, 0, None, None, 0)
        .unwrap();
    let pid = h.alloc_pid();
    h.sched.task_fork(MAIN_PID, pid, true).unwrap();
    assert_eq!(h.class_of(pid), SchedClass::Fair);
    assert_eq!(h.thread_type(pid), ThreadType::Utility);
    // Wide affinity across the whole pool, committed on the first.
    assert!(h.allowed_of(pid).is_set(4));
    assert!(h.allowed_of(pid).is_set(5));
    assert_eq!(h.cpu_home(pid), Some(4));
    assert_eq!(h.utility_commits(4), 1);
    // Host-handed threads run at nice -10.
    assert_eq!(h.sched.with_task(pid, |t| t.nice).unwrap(), -10);
    // Not moveable: it already lives on the host side.
    assert!(!h.proc.util_list.lock().contains(&pid));
}

/// One-CPU-per-utility-thread mode pins the spilled thread to a single
/// host CPU at the lowest utility commit level.
#[test]
fn one_cpu_per_util_pins_single_host_cpu() {
    let mut h = Harness::custom(
        Topology::flat(8),
        &[0],
        &[4, 5],
        lwksched::idle::IdleCaps::disabled(),
        |proc| {
            proc.set_option("one-cpu-per-util", None).unwrap();
        },
    );

    let attr = util_attr(Placement::empty(), Behavior::empty());
    // Fill the only LWK CPU, then spill twice; the host CPUs are
    // picked one at a time by commit level.
    let mut homes = Vec::new();
    for _ in 0..3 {
        h.sched
            .set_clone_attr(MAIN_PID, &attr, 0, None, None, 0)
            .unwrap();
        let pid = h.alloc_pid();
        h.sched.task_fork(MAIN_PID, pid, true).unwrap();
        homes.push((pid, h.cpu_home(pid).unwrap()));
    }
    assert_eq!(homes[0].1, 0);
    assert_eq!(homes[1].1, 4);
    assert_eq!(homes[2].1, 5);
    for (pid, _) in &homes[1..] {
        assert_eq!(h.allowed_of(*pid).weight(), 1);
    }
    assert_eq!(h.utility_commits(4), 1);
    assert_eq!(h.utility_commits(5), 1);
}
