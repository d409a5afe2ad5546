//! Scheduler core assembly and lifecycles.
//!
//! [`LwkSched`] ties the per-CPU descriptors, the task table and the
//! utility-group registry together. The kernel embeds exactly one
//! instance; tests construct their own with synthetic topologies.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{fence, AtomicU64, Ordering};
use spin::Mutex;

use crate::cpuset::CpuSet;
use crate::groups::UtilGroups;
use crate::idle::IdleCaps;
use crate::percpu::{uncommit_task, LwkCpu};
use crate::process::LwkProcess;
use crate::stats::StatsSnapshot;
use crate::table::{Pid, TaskTable};
use crate::task::Task;
use crate::topology::Topology;
use crate::types::Error;
use crate::{kinfo, kwarn};

/// The scheduler core.
pub struct LwkSched {
    pub(crate) cpus: Box<[LwkCpu]>,
    pub(crate) tasks: Mutex<TaskTable>,
    pub(crate) util_groups: UtilGroups,
    /// pid allocator for internally created idle tasks.
    next_pid: AtomicU64,
}

impl LwkSched {
    /// Build the core from host-supplied topology facts and low-power
    /// capabilities.
    pub fn new(topology: &Topology, caps: IdleCaps) -> Self {
        let mut cpus = Vec::with_capacity(topology.num_cpus());
        for cpu in 0..topology.num_cpus() {
            cpus.push(LwkCpu::new(cpu, *topology.cpu(cpu), caps.shallow, caps.deep));
        }
        caps.log();
        Self {
            cpus: cpus.into_boxed_slice(),
            tasks: Mutex::new(TaskTable::new()),
            util_groups: UtilGroups::new(),
            next_pid: AtomicU64::new(1 << 20),
        }
    }

    pub fn num_cpus(&self) -> usize {
        self.cpus.len()
    }

    /// Per-CPU descriptor, for hosts and tests that read state.
    pub fn cpu(&self, cpu: usize) -> &LwkCpu {
        &self.cpus[cpu]
    }

    pub fn is_lwk_cpu(&self, cpu: usize) -> bool {
        self.cpus[cpu].is_lwk()
    }

    pub fn read_commits(&self, cpu: usize) -> (i32, i32) {
        self.cpus[cpu].read_commits()
    }

    pub fn cpu_stats(&self, cpu: usize) -> StatsSnapshot {
        self.cpus[cpu].stats.snapshot()
    }

    /// Runnable entities on a CPU, the LWK idle entity excluded.
    pub fn rq_nr_running(&self, cpu: usize) -> u32 {
        self.cpus[cpu].rq.lock().nr_running()
    }

    /// Verify the CPU's queue bitmap mirrors slot occupancy. Panics on
    /// corruption; diagnostics support.
    pub fn rq_assert_consistent(&self, cpu: usize) {
        self.cpus[cpu].rq.lock().assert_consistent();
    }

    /// Copy of the utility-group registry.
    pub fn util_group_snapshot(
        &self,
    ) -> [crate::groups::GroupEntry; crate::groups::UTIL_GROUP_LIMIT] {
        self.util_groups.snapshot()
    }

    /// Inspect a task under the table lock.
    pub fn with_task<R>(&self, pid: Pid, f: impl FnOnce(&Task) -> R) -> Option<R> {
        let tasks = self.tasks.lock();
        tasks.get(pid).map(f)
    }

    pub(crate) fn alloc_pid(&self) -> Pid {
        self.next_pid.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a task the host created. The caller wires the process
    /// record beforehand when the task belongs to an LWK process.
    pub fn create_task(&self, task: Task) -> Result<(), Error> {
        self.tasks.lock().insert(task)
    }

    /// Mark the CPUs in `mask` as LWK CPUs. The barrier pairs with the
    /// reads in the idle loop.
    pub fn activate_lwk(&self, mask: &CpuSet) {
        for cpu in mask.iter() {
            if cpu < self.cpus.len() {
                self.cpus[cpu].set_lwk(true);
            }
        }
        fence(Ordering::SeqCst);
        kinfo!("activated {} LWK CPUs", mask.weight());
    }

    /// Return CPUs to the host. Cooperative: the flag flips first, a
    /// full barrier publishes it, then each idle task is kicked so it
    /// observes the change and exits its loop. The host joins the idle
    /// threads and finally calls [`LwkSched::reap_idle`].
    pub fn deactivate_lwk(&self, mask: &CpuSet) {
        for cpu in mask.iter() {
            if cpu < self.cpus.len() {
                self.cpus[cpu].set_lwk(false);
            }
        }
        fence(Ordering::SeqCst);
        for cpu in mask.iter() {
            if cpu < self.cpus.len() {
                self.wake_if_idle(cpu);
            }
        }
    }

    /// Drop the idle task bookkeeping after its thread has exited.
    pub fn reap_idle(&self, cpu: usize) {
        let mcpu = &self.cpus[cpu];
        if let Some(pid) = mcpu.idle_pid() {
            let mut tasks = self.tasks.lock();
            if let Some(task) = tasks.get(pid) {
                if let Some(link) = task.lwk.rq {
                    self.cpus[link.cpu].rq.lock().dequeue(link.handle).ok();
                }
            }
            tasks.remove(pid);
            mcpu.idle_pid.store(0, Ordering::Release);
            let mut rq = mcpu.rq.lock();
            if rq.current() == Some(pid) {
                rq.set_current(None);
            }
        }
    }

    /// Create the per-process scheduler record.
    pub fn process_init(
        &self,
        tgid: Pid,
        lwkcpus: CpuSet,
        sequence: &[usize],
        utilcpus: CpuSet,
    ) -> Result<Arc<LwkProcess>, Error> {
        if sequence.iter().any(|&c| c >= self.cpus.len()) {
            return Err(Error::ConfigInvalid);
        }
        if sequence.len() != lwkcpus.weight() as usize {
            return Err(Error::ConfigInvalid);
        }
        Ok(Arc::new(LwkProcess::new(tgid, lwkcpus, sequence, utilcpus)))
    }

    /// Prepare the scheduler for a process that has reserved its LWK
    /// CPUs: fresh commits, fresh statistics, published ownership and a
    /// ready idle task per CPU.
    pub fn process_start(&self, main_pid: Pid) -> Result<(), Error> {
        let proc = {
            let tasks = self.tasks.lock();
            let task = tasks.get(main_pid).ok_or(Error::NoSuchTask)?;
            let proc = task.lwk_process.clone().ok_or(Error::ConfigInvalid)?;
            // Save the allowed set the process arrived with; a later
            // full-process fork restores it.
            proc.save_original_cpus_allowed(task.cpus_allowed);
            proc
        };

        for cpu in proc.lwkcpus.iter() {
            let mcpu = &self.cpus[cpu];
            mcpu.reset_commits();
            mcpu.clear_exclusive();
            mcpu.stats.prepare_launch();
            mcpu.set_owner(proc.tgid);
        }
        // Idle tasks must observe the new owner.
        fence(Ordering::SeqCst);
        for cpu in proc.lwkcpus.iter() {
            self.prepare_idle(cpu);
        }
        Ok(())
    }

    /// Scheduler cleanup as one thread of an LWK process exits.
    pub fn thread_exit(&self, pid: Pid) -> Result<(), Error> {
        let mut tasks = self.tasks.lock();
        let Some(mut task) = tasks.remove(pid) else {
            return Err(Error::NoSuchTask);
        };
        if let Some(link) = task.lwk.rq.take() {
            let mut rq = self.cpus[link.cpu].rq.lock();
            rq.dequeue(link.handle).ok();
            if rq.current() == Some(pid) {
                rq.set_current(None);
            }
        }
        uncommit_task(&self.cpus, &mut task);
        if task.lwk.active_hints.key != 0 {
            self.util_groups.put(task.lwk.active_hints.key);
        }
        if task.lwk.on_util_list {
            if let Some(proc) = task.lwk_process.as_ref() {
                proc.util_list.lock().retain(|&p| p != pid);
            }
        }
        Ok(())
    }

    /// Scheduler cleanup as the whole process exits: the utility pool
    /// dissolves, the LWK CPUs drop to their deep low-power state and
    /// the end-of-job statistics are emitted.
    pub fn process_exit(&self, proc: &Arc<LwkProcess>) {
        proc.clear_utilcpus();

        for cpu in proc.lwkcpus.iter() {
            self.cpus[cpu].set_owner(0);
        }
        // Idle tasks must see the owner change before the kick.
        fence(Ordering::SeqCst);
        for cpu in proc.lwkcpus.iter() {
            self.wake_if_idle(cpu);
        }

        self.summarize_stats(proc);
    }

    fn summarize_stats(&self, proc: &Arc<LwkProcess>) {
        let detail_level = proc.sched_stats.load(Ordering::Relaxed);
        if detail_level <= 0 {
            return;
        }
        let mut pstats = StatsSnapshot::default();
        let mut cpus = 0;
        for cpu in proc.lwkcpus.iter() {
            let snap = self.cpus[cpu].stats.snapshot();
            snap.log_cpu_line(proc.tgid, cpu, detail_level);
            pstats.accumulate(&snap);
            cpus += 1;
        }
        pstats.log_process_line(
            proc.tgid,
            proc.threads_created.load(Ordering::Relaxed) + 1,
            cpus,
            detail_level,
        );
        if detail_level > 1 {
            self.util_groups.log_live_entries();
        }
    }

    /// Final teardown log when the LWK side shuts down for good.
    pub fn sched_exit(&self) {
        let mut guests: u64 = 0;
        let mut givebacks: u64 = 0;
        for cpu in self.cpus.iter() {
            let snap = cpu.stats.snapshot();
            guests += snap.guests;
            givebacks += snap.givebacks;
        }
        kinfo!("giving back {} of {} assimilated tasks", givebacks, guests);
        if givebacks > guests {
            kwarn!("more give-backs than assimilations recorded");
        }
    }
}
