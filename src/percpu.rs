//! Per-CPU scheduler state.
//!
//! One descriptor per present CPU: the LWK run queue, the commit
//! counters driving placement, the exclusive-reservation slot, the
//! low-power hint words and statistics. Cache-line aligned to prevent
//! false sharing between CPUs.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Mutex;

use crate::ktrace;
use crate::runqueue::LwkRunQueue;
use crate::stats::{update_max32, CpuStats};
use crate::table::Pid;
use crate::task::{Task, ThreadType};
use crate::topology::CpuTopology;
use crate::types::{CommitScope, COMMIT_MAX};

#[derive(Clone, Copy, Default)]
struct Commits {
    compute: i32,
    utility: i32,
}

/// Per-CPU scheduler descriptor.
#[repr(align(64))]
pub struct LwkCpu {
    pub(crate) id: usize,
    pub(crate) topology: CpuTopology,
    /// True while this CPU is ceded to the LWK scheduler.
    lwk: AtomicBool,
    /// tgid of the process owning this CPU; 0 when none.
    owner: AtomicU64,
    /// pid holding an exclusive reservation; 0 when free.
    exclusive_pid: AtomicU64,
    commits: Mutex<Commits>,
    pub(crate) rq: Mutex<LwkRunQueue>,
    need_resched: AtomicBool,
    /// pid of this CPU's LWK idle task; 0 before it exists.
    pub(crate) idle_pid: AtomicU64,
    /// Tick counter local to this CPU.
    pub(crate) local_tick: AtomicU64,
    /// Low-power hint words fixed at construction.
    pub(crate) shallow_sleep_mwait: u32,
    pub(crate) deep_sleep_mwait: u32,
    pub(crate) stats: CpuStats,
}

impl LwkCpu {
    pub fn new(id: usize, topology: CpuTopology, shallow: u32, deep: u32) -> Self {
        Self {
            id,
            topology,
            lwk: AtomicBool::new(false),
            owner: AtomicU64::new(0),
            exclusive_pid: AtomicU64::new(0),
            commits: Mutex::new(Commits::default()),
            rq: Mutex::new(LwkRunQueue::new()),
            need_resched: AtomicBool::new(false),
            idle_pid: AtomicU64::new(0),
            local_tick: AtomicU64::new(0),
            shallow_sleep_mwait: shallow,
            deep_sleep_mwait: deep,
            stats: CpuStats::default(),
        }
    }

    #[inline]
    pub fn topology(&self) -> &CpuTopology {
        &self.topology
    }

    #[inline]
    pub fn is_lwk(&self) -> bool {
        self.lwk.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_lwk(&self, on: bool) {
        self.lwk.store(on, Ordering::Release);
    }

    #[inline]
    pub fn owner(&self) -> Pid {
        self.owner.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_owner(&self, tgid: Pid) {
        self.owner.store(tgid, Ordering::Release);
    }

    #[inline]
    pub fn need_resched(&self) -> bool {
        self.need_resched.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_need_resched(&self) {
        self.need_resched.store(true, Ordering::Release);
    }

    #[inline]
    pub fn clear_need_resched(&self) -> bool {
        self.need_resched.swap(false, Ordering::AcqRel)
    }

    #[inline]
    pub fn idle_pid(&self) -> Option<Pid> {
        match self.idle_pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Racy read of the exclusive-reservation slot, for candidate
    /// filtering during placement.
    #[inline]
    pub fn exclusive_owner(&self) -> Pid {
        self.exclusive_pid.load(Ordering::Acquire)
    }

    /// Atomically claim the CPU for `pid`. Returns the previous owner;
    /// 0 means the claim succeeded.
    pub(crate) fn try_reserve_exclusive(&self, pid: Pid) -> Pid {
        self.exclusive_pid
            .compare_exchange(0, pid, Ordering::AcqRel, Ordering::Acquire)
            .unwrap_or_else(|prev| prev)
    }

    pub(crate) fn clear_exclusive(&self) {
        self.exclusive_pid.store(0, Ordering::Release);
    }

    /// Commit counters, read atomically with respect to a concurrent
    /// commit on the same CPU.
    pub fn read_commits(&self) -> (i32, i32) {
        let c = self.commits.lock();
        (c.compute, c.utility)
    }

    /// Counter value under the given search scope.
    pub(crate) fn commits_in_scope(&self, scope: CommitScope) -> i32 {
        let c = self.commits.lock();
        match scope {
            CommitScope::OnlyComputeCommits => c.compute,
            CommitScope::OnlyUtilityCommits => c.utility,
            CommitScope::AllCommits => c.compute + c.utility,
        }
    }

    /// True when more than one thread is accounted against this CPU.
    pub fn is_overcommitted(&self) -> bool {
        let (compute, utility) = self.read_commits();
        compute + utility > 1
    }

    pub(crate) fn reset_commits(&self) {
        let mut c = self.commits.lock();
        c.compute = 0;
        c.utility = 0;
    }

    fn commit_one(&self, ttype: ThreadType) {
        let mut c = self.commits.lock();
        match ttype {
            ThreadType::Normal => {
                if c.compute < COMMIT_MAX {
                    c.compute += 1;
                    update_max32(&self.stats.max_compute_level, c.compute as u32);
                } else {
                    self.stats.commit_overflow.fetch_add(1, Ordering::Relaxed);
                    crate::kwarn_once!("compute commits saturated on cpu {}", self.id);
                }
            }
            ThreadType::Utility => {
                if c.utility < COMMIT_MAX {
                    c.utility += 1;
                    update_max32(&self.stats.max_util_level, c.utility as u32);
                } else {
                    self.stats.commit_overflow.fetch_add(1, Ordering::Relaxed);
                    crate::kwarn_once!("utility commits saturated on cpu {}", self.id);
                }
            }
            _ => {}
        }
    }

    fn uncommit_one(&self, ttype: ThreadType) {
        let mut c = self.commits.lock();
        let counter = match ttype {
            ThreadType::Normal => Some(&mut c.compute),
            ThreadType::Utility => Some(&mut c.utility),
            _ => None,
        };
        if let Some(counter) = counter {
            if *counter > 0 {
                *counter -= 1;
            } else {
                // Never propagate; count it and move on.
                self.stats.commit_underflow.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Account `task` against `cpu` and record the new home.
pub(crate) fn commit_task(cpu: &LwkCpu, task: &mut Task) {
    cpu.commit_one(task.lwk.thread_type);
    task.lwk.cpu_home = Some(cpu.id);
    let (compute, utility) = cpu.read_commits();
    ktrace!(
        "commit pid={} cpu={} compute={} utility={}",
        task.pid,
        cpu.id,
        compute,
        utility
    );
}

/// Release the commit recorded in the task's CPU home, if any.
pub(crate) fn uncommit_task(cpus: &[LwkCpu], task: &mut Task) {
    let Some(home) = task.lwk.cpu_home.take() else {
        return;
    };
    let cpu = &cpus[home];
    cpu.uncommit_one(task.lwk.thread_type);
    let (compute, utility) = cpu.read_commits();
    ktrace!(
        "uncommit pid={} cpu={} compute={} utility={}",
        task.pid,
        home,
        compute,
        utility
    );
}
