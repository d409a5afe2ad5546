//! Task control block and the LWK scheduling entity.
//!
//! The entity rides on every task the core touches: LWK threads of the
//! owning process, assimilated guests and the per-CPU idle tasks.

use alloc::string::String;
use alloc::sync::Arc;

use crate::attr::{ActiveHints, CloneHints};
use crate::cpuset::CpuSet;
use crate::process::LwkProcess;
use crate::runqueue::RqHandle;
use crate::table::Pid;
use crate::types::{nice_to_prio, nice_to_weight, nice_to_wmult, SchedPolicy, LWK_TIMESLICE};

/// Scheduling class currently owning a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedClass {
    /// This scheduler.
    Lwk,
    /// Host fair class.
    Fair,
    /// Host real-time class.
    Rt,
    /// Host deadline class.
    Deadline,
    /// Host stop class; never assimilated.
    Stop,
    /// Host idle class; never assimilated.
    Idle,
}

/// Role of an LWK-scheduled task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadType {
    /// Compute thread meant to monopolise a CPU.
    Normal,
    /// Utility thread meant to share a CPU.
    Utility,
    /// Foreign task assimilated while visiting an LWK CPU.
    Guest,
    /// The CPU's LWK idle task.
    Idle,
}

/// Where an entity currently sits on a run queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RqLink {
    pub cpu: usize,
    pub handle: RqHandle,
}

/// Per-task LWK scheduling state.
#[derive(Clone, Debug, Default)]
pub struct LwkEntity {
    /// Queue position while runnable.
    pub rq: Option<RqLink>,
    /// CPU this task's commit is accounted against.
    pub cpu_home: Option<usize>,
    pub thread_type: ThreadType,
    /// True while the task's scheduling class points at the LWK adapter.
    pub assimilated: bool,
    /// Snapshot for give-back.
    pub orig_class: Option<SchedClass>,
    pub orig_policy: SchedPolicy,
    /// Remaining and reload timeslice, in ticks.
    pub time_slice: u32,
    pub orig_time_slice: u32,
    /// Hints staged for the next clone; consumed exactly once by fork.
    pub clone_hints: Option<CloneHints>,
    /// Hints that were actually applied at placement time.
    pub active_hints: ActiveHints,
    /// True while linked on the process's moveable-utility list.
    pub on_util_list: bool,
    pub move_syscalls_disable: bool,
    /// Tick accounting for the running task.
    pub exec_start: u64,
    pub sum_exec_ticks: u64,
}

impl Default for ThreadType {
    fn default() -> Self {
        ThreadType::Normal
    }
}

/// A task as the scheduler core sees it.
#[derive(Clone, Debug)]
pub struct Task {
    pub pid: Pid,
    pub tgid: Pid,
    pub comm: String,
    pub policy: SchedPolicy,
    /// Internal priority; drives the queue slot index.
    pub prio: i32,
    pub normal_prio: i32,
    pub static_prio: i32,
    /// External real-time priority surfaced to user space.
    pub rt_priority: u32,
    pub nice: i8,
    /// Fair-class weight tables, written on transfer to the host.
    pub load_weight: u64,
    pub load_inv_weight: u32,
    pub class: SchedClass,
    pub cpus_allowed: CpuSet,
    pub nr_cpus_allowed: u32,
    /// CPU the task last ran on.
    pub cpu: usize,
    pub lwk: LwkEntity,
    pub lwk_process: Option<Arc<LwkProcess>>,
}

impl Task {
    pub fn new(
        pid: Pid,
        tgid: Pid,
        comm: &str,
        class: SchedClass,
        policy: SchedPolicy,
        prio: i32,
        cpus_allowed: CpuSet,
    ) -> Self {
        Self {
            pid,
            tgid,
            comm: String::from(comm),
            policy,
            prio,
            normal_prio: prio,
            static_prio: nice_to_prio(0),
            rt_priority: 0,
            nice: 0,
            load_weight: nice_to_weight(0),
            load_inv_weight: nice_to_wmult(0),
            class,
            nr_cpus_allowed: cpus_allowed.weight(),
            cpus_allowed,
            cpu: cpus_allowed.first_set().unwrap_or(0),
            lwk: LwkEntity {
                time_slice: LWK_TIMESLICE,
                orig_time_slice: LWK_TIMESLICE,
                ..LwkEntity::default()
            },
            lwk_process: None,
        }
    }

    /// Child control block as the fork hook first sees it: parent
    /// priority, type Normal, no CPU home, no queue position.
    pub fn fork_from(parent: &Task, child_pid: Pid, same_thread_group: bool) -> Self {
        let mut child = parent.clone();
        child.pid = child_pid;
        if !same_thread_group {
            child.tgid = child_pid;
        }
        child.lwk.rq = None;
        child.lwk.cpu_home = None;
        child.lwk.thread_type = ThreadType::Normal;
        child.lwk.clone_hints = None;
        child.lwk.active_hints = ActiveHints::default();
        child.lwk.on_util_list = false;
        child.lwk.exec_start = 0;
        child.lwk.sum_exec_ticks = 0;
        child.prio = parent.prio;
        child.normal_prio = parent.prio;
        child
    }

    /// True while the task is on some LWK run queue.
    #[inline]
    pub fn on_rq(&self) -> bool {
        self.lwk.rq.is_some()
    }

    /// Install a nice value together with the fair-class weights.
    pub fn set_nice(&mut self, nice: i8) {
        self.nice = nice;
        self.static_prio = nice_to_prio(nice);
        self.load_weight = nice_to_weight(nice);
        self.load_inv_weight = nice_to_wmult(nice);
    }
}

impl Default for SchedPolicy {
    fn default() -> Self {
        SchedPolicy::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LWK_DEFAULT_PRIO;

    #[test]
    fn fork_resets_entity_state() {
        let mut parent = Task::new(
            10,
            10,
            "app",
            SchedClass::Lwk,
            SchedPolicy::Fifo,
            LWK_DEFAULT_PRIO,
            CpuSet::from_cpus(&[0, 1]),
        );
        parent.lwk.cpu_home = Some(1);
        parent.lwk.thread_type = ThreadType::Utility;
        let child = Task::fork_from(&parent, 11, true);
        assert_eq!(child.tgid, 10);
        assert_eq!(child.lwk.cpu_home, None);
        assert_eq!(child.lwk.thread_type, ThreadType::Normal);
        assert_eq!(child.prio, parent.prio);
        let proc_fork = Task::fork_from(&parent, 12, false);
        assert_eq!(proc_fork.tgid, 12);
    }

    #[test]
    fn set_nice_writes_weight_tables() {
        let mut t = Task::new(
            1,
            1,
            "t",
            SchedClass::Fair,
            SchedPolicy::Normal,
            nice_to_prio(0),
            CpuSet::from_cpus(&[0]),
        );
        t.set_nice(-20);
        assert_eq!(t.static_prio, nice_to_prio(-20));
        assert_eq!(t.load_weight, 88761);
    }
}
