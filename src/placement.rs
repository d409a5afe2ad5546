//! Placement engine.
//!
//! Policy layer above the commit accounting and topology facts. All
//! searches walk the process's LWK CPU sequence; utility threads walk
//! it in reverse so worker threads keep the head order. When a
//! requested topology match cannot be satisfied it widens along the
//! relaxation ladder until FirstAvailable, which always succeeds on a
//! non-empty allowed set.

use alloc::sync::Arc;

use crate::attr::{
    acceptable_behavior, Behavior, CloneHints, Placement, CLONE_RESULT_ACCEPTED,
    CLONE_RESULT_REJECTED,
};
use crate::cpuset::{CpuSet, NodeSet};
use crate::groups::UtilGroups;
use crate::percpu::{commit_task, uncommit_task};
use crate::process::LwkProcess;
use crate::sched::LwkSched;
use crate::table::{Pid, TaskTable};
use crate::task::{Task, ThreadType};
use crate::types::{CommitScope, CpusPerUtil, Error, MatchType, SearchOrder, COMMIT_MAX};
use crate::{ktrace, kwarn};

/// Bound on the utility-placement retry loop.
const UTIL_PLACEMENT_RETRIES: usize = 100;

/// Snapshot of the task fields every search needs, taken so the
/// candidate walk runs without holding the task borrow.
pub(crate) struct PlaceCtx {
    pub pid: Pid,
    pub allowed: CpuSet,
    pub proc: Arc<LwkProcess>,
}

impl PlaceCtx {
    pub fn of(task: &Task) -> Option<Self> {
        Some(Self {
            pid: task.pid,
            allowed: task.cpus_allowed,
            proc: task.lwk_process.clone()?,
        })
    }
}

/// Does `topo` satisfy the match request?
pub(crate) fn location_match(
    t: MatchType,
    id: i32,
    topo: &crate::topology::CpuTopology,
    nodes: Option<&NodeSet>,
) -> bool {
    match t {
        MatchType::FirstAvail => true,
        MatchType::SameDomain => id == topo.numa_id,
        MatchType::SameCore => id == topo.core_id,
        MatchType::SameL1 => id == topo.l1c_id,
        MatchType::SameL2 => id == topo.l2c_id,
        MatchType::SameL3 => id == topo.l3c_id,
        MatchType::OtherDomain => id != topo.numa_id,
        MatchType::OtherCore => id != topo.core_id,
        MatchType::OtherL1 => id != topo.l1c_id,
        MatchType::OtherL2 => id != topo.l2c_id,
        MatchType::OtherL3 => id != topo.l3c_id,
        MatchType::InNodeSet => {
            topo.numa_id >= 0 && nodes.map_or(false, |n| n.is_set(topo.numa_id as usize))
        }
    }
}

/// Widen a match request one step: Same-X grows towards the next
/// larger domain, Other-X narrows, both end at FirstAvailable.
pub(crate) fn relax_match(current: MatchType) -> MatchType {
    match current {
        MatchType::SameL1 => MatchType::SameL2,
        MatchType::SameL2 => MatchType::SameL3,
        MatchType::SameL3 => MatchType::SameDomain,
        MatchType::SameDomain => MatchType::FirstAvail,
        MatchType::OtherDomain => MatchType::OtherL3,
        MatchType::OtherL3 => MatchType::OtherL2,
        MatchType::OtherL2 => MatchType::OtherL1,
        MatchType::OtherL1 => MatchType::FirstAvail,
        _ => MatchType::FirstAvail,
    }
}

/// After the first CPU of a wide-affinity utility mask is chosen,
/// tighten the request so the remaining CPUs share that CPU's topology
/// attribute. A pending keyed group adopts the chosen CPU as anchor.
fn match_adjust(
    topo: &crate::topology::CpuTopology,
    mtype: &mut MatchType,
    id: &mut i32,
    first_keyed: bool,
) {
    if first_keyed {
        match *mtype {
            MatchType::SameDomain => *id = topo.numa_id,
            MatchType::SameL3 => *id = topo.l3c_id,
            MatchType::SameL2 => *id = topo.l2c_id,
            MatchType::SameL1 => *id = topo.l1c_id,
            MatchType::SameCore => *id = topo.core_id,
            _ => {}
        }
    }
    match *mtype {
        MatchType::OtherDomain => {
            *mtype = MatchType::SameDomain;
            *id = topo.numa_id;
        }
        MatchType::OtherL3 => {
            *mtype = MatchType::SameL3;
            *id = topo.l3c_id;
        }
        MatchType::OtherL2 => {
            *mtype = MatchType::SameL2;
            *id = topo.l2c_id;
        }
        MatchType::OtherL1 => {
            *mtype = MatchType::SameL1;
            *id = topo.l1c_id;
        }
        MatchType::OtherCore => {
            *mtype = MatchType::SameCore;
            *id = topo.core_id;
        }
        _ => {}
    }
}

impl LwkSched {
    /// Attempt to find a CPU within the commit level limit, matching
    /// the requested affinity and topology.
    ///
    /// Walks the process's LWK CPU sequence from one end, one commit
    /// level at a time. A CPU reserved exclusively by a different pid
    /// is skipped outright.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn find_cpu_candidate(
        &self,
        ctx: &PlaceCtx,
        commit_level_limit: i32,
        order: SearchOrder,
        matchtype: MatchType,
        id: i32,
        nodes: Option<&NodeSet>,
        range: i32,
        scope: CommitScope,
        exclusive: Pid,
    ) -> Option<usize> {
        let seq = &ctx.proc.lwkcpus_sequence;
        let total = seq.len();
        let fpath = ctx.allowed == ctx.proc.lwkcpus;
        let slots = if range < 0 {
            total
        } else {
            (range as usize).min(total)
        };
        if slots == 0 {
            return None;
        }

        let mut commitment: i64 = 0;
        while commitment <= commit_level_limit as i64 {
            let mut matched = false;
            let mut deepest_eligible: i64 = -1;

            for n in 0..slots {
                let cpu = match order {
                    SearchOrder::Reverse => seq[total - 1 - n],
                    SearchOrder::Forward => seq[n],
                };
                let mcpu = &self.cpus[cpu];

                // Is the CPU occupied by an exclusive thread?
                let excl_pid = mcpu.exclusive_owner();
                if excl_pid != 0 && exclusive != excl_pid {
                    continue;
                }
                if !location_match(matchtype, id, &mcpu.topology, nodes) {
                    continue;
                }
                matched = true;
                if fpath || ctx.allowed.is_set(cpu) {
                    let commits = mcpu.commits_in_scope(scope) as i64;
                    if commits > deepest_eligible {
                        deepest_eligible = commits;
                    }
                    if commits == commitment {
                        let prev_pid = if exclusive != 0 {
                            mcpu.try_reserve_exclusive(exclusive)
                        } else {
                            0
                        };
                        if prev_pid == 0 || prev_pid == exclusive {
                            ktrace!(
                                "select pid={} cpu={} commits={} match={:?}",
                                ctx.pid,
                                cpu,
                                commits,
                                matchtype
                            );
                            return Some(cpu);
                        }
                    }
                }
            }
            if !matched || commitment >= deepest_eligible {
                break;
            }
            commitment += 1;
        }
        // No CPU at the requested commitment range and topology.
        ktrace!(
            "select pid={} unavailable limit={} match={:?}",
            ctx.pid,
            commit_level_limit,
            matchtype
        );
        None
    }

    /// Compute-thread placement.
    ///
    /// Preference order: an entirely uncommitted CPU, then a CPU with
    /// no other compute thread (sharing with a utility thread beats
    /// sharing with compute), then the least committed CPU up to
    /// `commit_level_limit`.
    pub(crate) fn select_cpu_candidate(&self, ctx: &PlaceCtx, commit_level_limit: i32) -> Option<usize> {
        let cpu = self.find_cpu_candidate(
            ctx,
            0,
            SearchOrder::Forward,
            MatchType::FirstAvail,
            0,
            None,
            -1,
            CommitScope::AllCommits,
            0,
        );
        if cpu.is_some() || commit_level_limit == 0 {
            return cpu;
        }
        let cpu = self.find_cpu_candidate(
            ctx,
            0,
            SearchOrder::Forward,
            MatchType::FirstAvail,
            0,
            None,
            -1,
            CommitScope::OnlyComputeCommits,
            0,
        );
        if cpu.is_some() {
            return cpu;
        }
        self.find_cpu_candidate(
            ctx,
            commit_level_limit,
            SearchOrder::Forward,
            MatchType::FirstAvail,
            0,
            None,
            -1,
            CommitScope::AllCommits,
            0,
        )
    }

    /// Deterministic home for the process's initial thread: the first
    /// CPU of the sequence, when it is allowed and has no compute
    /// commit. This keeps OMP-style topology probes repeatable.
    pub(crate) fn select_main_thread_home(&self, task: &Task) -> Option<usize> {
        if task.pid != task.tgid {
            return None;
        }
        let proc = task.lwk_process.as_ref()?;
        let first_cpu = *proc.lwkcpus_sequence.first()?;
        if !task.cpus_allowed.is_set(first_cpu) {
            return None;
        }
        let (compute, _) = self.cpus[first_cpu].read_commits();
        if compute != 0 {
            return None;
        }
        ktrace!("main thread home pid={} cpu={}", task.pid, first_cpu);
        Some(first_cpu)
    }

    /// Search the process's shared utility-CPU pool on the host side.
    ///
    /// Returns the allowed mask to install and the selected CPU. In
    /// One-CPU-per-thread mode the mask holds the single matching CPU
    /// with the lowest utility commit level; in Multiple mode every
    /// matching CPU is included, tightened after the first match so
    /// later CPUs share its topology attribute.
    pub(crate) fn select_host_utility_cpus(
        &self,
        proc: &LwkProcess,
        mtype: MatchType,
        id: i32,
        nodes: Option<&NodeSet>,
        first_keyed: bool,
    ) -> (CpuSet, Option<usize>) {
        let utilcpus = proc.utilcpus();
        let mut cpus = CpuSet::new();

        match proc.allowed_cpus_per_util() {
            CpusPerUtil::One => {
                let mt = if first_keyed {
                    MatchType::FirstAvail
                } else {
                    mtype
                };
                // Lowest commit level wins, ties by pool order.
                let mut lowest: Option<i32> = None;
                for cpu in utilcpus.iter().filter(|&c| c < self.cpus.len()) {
                    let mcpu = &self.cpus[cpu];
                    if !location_match(mt, id, &mcpu.topology, nodes) {
                        continue;
                    }
                    let commits = mcpu.commits_in_scope(CommitScope::OnlyUtilityCommits);
                    if lowest.map_or(true, |l| commits < l) {
                        lowest = Some(commits);
                    }
                }
                let Some(lowest) = lowest else {
                    return (cpus, None);
                };
                for cpu in utilcpus.iter().filter(|&c| c < self.cpus.len()) {
                    let mcpu = &self.cpus[cpu];
                    if !location_match(mt, id, &mcpu.topology, nodes) {
                        continue;
                    }
                    if mcpu.commits_in_scope(CommitScope::OnlyUtilityCommits) == lowest {
                        cpus.set(cpu);
                        return (cpus, Some(cpu));
                    }
                }
                (cpus, None)
            }
            CpusPerUtil::Multiple => {
                let mut first = None;
                let mut adjusted = false;
                let mut fk = first_keyed;
                let (mut mt, mut id) = (mtype, id);
                for cpu in utilcpus.iter().filter(|&c| c < self.cpus.len()) {
                    let topo = self.cpus[cpu].topology;
                    if location_match(if fk { MatchType::FirstAvail } else { mt }, id, &topo, nodes)
                    {
                        cpus.set(cpu);
                        if first.is_none() {
                            first = Some(cpu);
                        }
                        // Tighten the match for the remaining CPUs of
                        // this thread's mask.
                        if !adjusted {
                            match_adjust(&topo, &mut mt, &mut id, fk);
                            adjusted = true;
                        }
                    }
                    fk = false;
                }
                (cpus, first)
            }
        }
    }

    /// Utility-thread placement, driven by the staged clone hints.
    ///
    /// `child` is not yet in the task table; `parent_home` is the
    /// caller's committed LWK CPU, anchoring topology requests that
    /// carry no grouping key.
    pub(crate) fn place_utility_thread(
        &self,
        child: &mut Task,
        parent_home: Option<usize>,
        hints: &CloneHints,
    ) -> Result<(), Error> {
        let Some(proc) = child.lwk_process.clone() else {
            return Err(Error::PlacementUnsatisfiable);
        };
        let ctx = PlaceCtx::of(child).ok_or(Error::PlacementUnsatisfiable)?;

        // Resolve the topology anchor. A keyed request either adopts
        // the group's remembered anchor or keeps the registry locked
        // until this thread has been placed and the entry written.
        let mut pending = None;
        let anchor = if hints.key != 0 {
            let mut guard = self.util_groups.lock();
            match UtilGroups::find_and_get(&mut guard, hints.key) {
                Some(topology) => {
                    child.lwk.active_hints.key = hints.key;
                    Some(topology)
                }
                None => {
                    pending = Some(guard);
                    None
                }
            }
        } else {
            // The caller may be running on a host syscall CPU, so its
            // committed LWK home anchors the match, not its current CPU.
            match parent_home {
                Some(cpu) => Some(self.cpus[cpu].topology),
                None => {
                    kwarn!("expected a valid cpu home placing utility thread");
                    proc.lwkcpus
                        .first_set()
                        .map(|cpu| self.cpus[cpu].topology)
                }
            }
        };

        let mut matchtype = MatchType::FirstAvail;
        let mut loc_id = -1;
        let mut node_mask: Option<NodeSet> = None;
        let loc = hints.location;
        if loc.contains(Placement::SAME_L1) {
            matchtype = MatchType::SameL1;
            loc_id = anchor.map_or(-1, |t| t.l1c_id);
        } else if loc.contains(Placement::SAME_L2) {
            matchtype = MatchType::SameL2;
            loc_id = anchor.map_or(-1, |t| t.l2c_id);
        } else if loc.contains(Placement::SAME_L3) {
            matchtype = MatchType::SameL3;
            loc_id = anchor.map_or(-1, |t| t.l3c_id);
        } else if loc.contains(Placement::DIFF_L1) {
            matchtype = MatchType::OtherL1;
            loc_id = anchor.map_or(-1, |t| t.l1c_id);
        } else if loc.contains(Placement::DIFF_L2) {
            matchtype = MatchType::OtherL2;
            loc_id = anchor.map_or(-1, |t| t.l2c_id);
        } else if loc.contains(Placement::DIFF_L3) {
            matchtype = MatchType::OtherL3;
            loc_id = anchor.map_or(-1, |t| t.l3c_id);
        } else if loc.contains(Placement::SAME_DOMAIN) {
            matchtype = MatchType::SameDomain;
            loc_id = anchor.map_or(-1, |t| t.numa_id);
        } else if loc.contains(Placement::DIFF_DOMAIN) {
            matchtype = MatchType::OtherDomain;
            loc_id = anchor.map_or(-1, |t| t.numa_id);
        } else if loc.contains(Placement::USE_NODE_SET) {
            matchtype = MatchType::InNodeSet;
            node_mask = Some(hints.nodes);
        }

        // Exclusive use of a CPU forbids overcommitment. Otherwise a
        // specific placement outranks the commit threshold.
        let mut exclusive_pid: Pid = 0;
        let mut allowed_commit_level;
        if hints.behavior.contains(Behavior::EXCL) {
            allowed_commit_level = 0;
            exclusive_pid = child.pid;
        } else if !loc.is_empty()
            || proc.max_util_threads_per_cpu.load(core::sync::atomic::Ordering::Relaxed) < 0
        {
            allowed_commit_level = COMMIT_MAX;
        } else {
            allowed_commit_level =
                proc.max_util_threads_per_cpu.load(core::sync::atomic::Ordering::Relaxed) - 1;
        }

        let commit_type = if exclusive_pid != 0 {
            CommitScope::AllCommits
        } else {
            proc.overcommit_behavior()
        };
        let range = proc
            .max_cpus_for_util
            .load(core::sync::atomic::Ordering::Relaxed);

        // Try to honor the location against the LWK CPUs and the shared
        // utility pool, relaxing the match and then the commit level
        // until something gives. The iteration bound keeps an
        // unexpected condition from wedging the kernel.
        let mut util_cpu = None;
        let mut on_host = false;
        let mut placement_honored = true;
        let mut new_mask = CpuSet::new();
        for _ in 0..UTIL_PLACEMENT_RETRIES {
            if !loc.contains(Placement::HOST_CPU) {
                let mt = if pending.is_some() {
                    MatchType::FirstAvail
                } else {
                    matchtype
                };
                if let Some(cpu) = self.find_cpu_candidate(
                    &ctx,
                    allowed_commit_level,
                    SearchOrder::Reverse,
                    mt,
                    loc_id,
                    node_mask.as_ref(),
                    range,
                    commit_type,
                    exclusive_pid,
                ) {
                    on_host = false;
                    new_mask.clear_all();
                    new_mask.set(cpu);
                    adjust_util_behavior(child, hints.behavior);
                    util_cpu = Some(cpu);
                    break;
                }
            }
            if !loc.contains(Placement::LWK_CPU) {
                let (mask, first) = self.select_host_utility_cpus(
                    &proc,
                    matchtype,
                    loc_id,
                    node_mask.as_ref(),
                    pending.is_some(),
                );
                if let Some(cpu) = first {
                    // The thread will share a host CPU with host tasks,
                    // so it must play by host rules from here on.
                    on_host = true;
                    new_mask = mask;
                    move_to_host_scheduler(child, hints.behavior);
                    util_cpu = Some(cpu);
                    break;
                }
            }
            if matchtype == MatchType::FirstAvail {
                if !loc.contains(Placement::LWK_CPU) || allowed_commit_level == COMMIT_MAX {
                    // FirstAvail with host CPUs permitted should always
                    // find something; bail out and surface the warning.
                    util_cpu = None;
                    break;
                }
                if exclusive_pid != 0 {
                    placement_honored = false;
                }
                allowed_commit_level += 1;
            } else {
                matchtype = relax_match(matchtype);
                placement_honored = false;
            }
        }

        let Some(cpu) = util_cpu else {
            drop(pending);
            kwarn!("utility cpu selection failure for pid={}", child.pid);
            return Err(Error::PlacementUnsatisfiable);
        };

        child.cpus_allowed = new_mask;
        child.nr_cpus_allowed = new_mask.weight();
        child.cpu = cpu;
        child.lwk.thread_type = ThreadType::Utility;

        // If we are responsible for storing the group key, do it now
        // and release the registry.
        if let Some(mut guard) = pending.take() {
            if UtilGroups::store(&mut guard, hints.key, self.cpus[cpu].topology) {
                child.lwk.active_hints.key = hints.key;
            } else {
                placement_honored = false;
            }
        }

        // A moveable utility thread chains onto the front of the
        // process list; the list lock spans the commit so pushing
        // cannot observe a linked-but-uncommitted thread.
        if !on_host && !hints.behavior.contains(Behavior::EXCL) && loc.is_empty() {
            let mut list = proc.util_list.lock();
            commit_task(&self.cpus[cpu], child);
            list.push_front(child.pid);
            child.lwk.on_util_list = true;
        } else {
            commit_task(&self.cpus[cpu], child);
        }

        let placement_result = if placement_honored {
            child.lwk.active_hints.location = loc;
            child.lwk.active_hints.nodes = hints.nodes;
            CLONE_RESULT_ACCEPTED
        } else {
            child.lwk.active_hints.location = Placement::empty();
            CLONE_RESULT_REJECTED
        };
        let behavior_result = if acceptable_behavior(hints.behavior) {
            child.lwk.active_hints.behavior = hints.behavior;
            CLONE_RESULT_ACCEPTED
        } else {
            child.lwk.active_hints.behavior = Behavior::empty();
            CLONE_RESULT_REJECTED
        };
        if let Some(cell) = hints.result.as_deref() {
            cell.store(placement_result, behavior_result);
        }
        ktrace!(
            "utility thread pid={} assigned cpu={} mask_weight={} honored={}",
            child.pid,
            cpu,
            new_mask.weight(),
            placement_honored
        );
        Ok(())
    }

    /// Push moveable utility threads off to host CPUs until an LWK CPU
    /// is free for a new compute thread or the list runs dry.
    ///
    /// Only the NodeSet hint is re-consulted when relocating; all other
    /// placement hints applied at creation time are not.
    pub(crate) fn push_utility_threads(&self, tasks: &mut TaskTable, ctx: &PlaceCtx) {
        // Any uncommitted CPUs remaining?
        if self
            .find_cpu_candidate(
                ctx,
                0,
                SearchOrder::Forward,
                MatchType::FirstAvail,
                0,
                None,
                -1,
                CommitScope::AllCommits,
                0,
            )
            .is_some()
        {
            return;
        }

        let proc = ctx.proc.clone();
        let mut list = proc.util_list.lock();
        while let Some(util_pid) = list.pop_front() {
            let Some(util) = tasks.get_mut(util_pid) else {
                continue;
            };
            util.lwk.on_util_list = false;

            // A domain mask from the original request is honored
            // regardless of commit level; everything else lands on the
            // least committed host CPU.
            let mut matchtype = MatchType::FirstAvail;
            let mut nodes: Option<NodeSet> = None;
            if util.lwk.active_hints.location.contains(Placement::USE_NODE_SET) {
                matchtype = MatchType::InNodeSet;
                nodes = Some(util.lwk.active_hints.nodes);
            }

            let mut target = None;
            let mut new_mask = CpuSet::new();
            loop {
                let (mask, first) =
                    self.select_host_utility_cpus(&proc, matchtype, 0, nodes.as_ref(), false);
                if let Some(cpu) = first {
                    new_mask = mask;
                    target = Some(cpu);
                    break;
                }
                if matchtype == MatchType::FirstAvail {
                    kwarn!("unexpected condition searching for a host cpu to push to");
                    break;
                }
                matchtype = relax_match(matchtype);
            }

            if let Some(cpu) = target {
                let from_cpu = util.lwk.cpu_home;
                self.push_to_host_scheduler(util);
                uncommit_task(&self.cpus, util);
                commit_task(&self.cpus[cpu], util);
                util.cpus_allowed = new_mask;
                util.nr_cpus_allowed = new_mask.weight();
                util.cpu = cpu;
                if let Some(from) = from_cpu {
                    self.cpus[from]
                        .stats
                        .pushed
                        .fetch_add(1, core::sync::atomic::Ordering::Relaxed);
                }
                ktrace!(
                    "pushed utility pid={} from={:?} to={}",
                    util_pid,
                    from_cpu,
                    cpu
                );
            }

            // Stop as soon as an LWK CPU is free.
            if self
                .find_cpu_candidate(
                    ctx,
                    0,
                    SearchOrder::Forward,
                    MatchType::FirstAvail,
                    0,
                    None,
                    -1,
                    CommitScope::AllCommits,
                    0,
                )
                .is_some()
            {
                break;
            }
        }
    }
}

/// Apply behaviour hints to an LWK-scheduled utility thread.
///
/// A high-priority thread outranks every other LWK thread on its CPU;
/// a low-priority one runs under them. A non-cooperative thread is
/// forcibly time-sliced so it cannot starve its slot.
pub(crate) fn adjust_util_behavior(task: &mut Task, behavior: Behavior) {
    use crate::types::{LWK_HIGH_PRIO, LWK_LOW_PRIO};

    if behavior.contains(Behavior::HIGH_PRIO) {
        task.prio = LWK_HIGH_PRIO;
        task.normal_prio = LWK_HIGH_PRIO;
    } else if behavior.contains(Behavior::LOW_PRIO) {
        task.prio = LWK_LOW_PRIO;
        task.normal_prio = LWK_LOW_PRIO;
    }
    if behavior.contains(Behavior::NON_COOP) {
        task.policy = crate::types::SchedPolicy::Rr;
    }
}

/// Reassign a task to the host's fair class. All subsequent scheduling
/// of the task is outside this core's control.
pub(crate) fn move_to_host_scheduler(task: &mut Task, behavior: Behavior) {
    let nice = if behavior.contains(Behavior::HIGH_PRIO) {
        -20
    } else if behavior.contains(Behavior::LOW_PRIO) {
        19
    } else {
        -10
    };
    task.policy = crate::types::SchedPolicy::Normal;
    task.set_nice(nice);
    task.rt_priority = 0;
    task.prio = task.static_prio;
    task.normal_prio = task.static_prio;
    task.class = crate::task::SchedClass::Fair;
    task.lwk.assimilated = false;
}
