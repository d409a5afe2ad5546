//! Scheduler-class adapter.
//!
//! The hook surface the host core scheduler drives: enqueue, dequeue,
//! yield, pick-next, tick, priority change, fork, select-task-rq and
//! affinity updates, plus the assimilation protocol that takes over
//! arbitrary tasks arriving on an LWK CPU and gives them back when they
//! leave.

use core::sync::atomic::Ordering;

use crate::attr::Behavior;
use crate::percpu::{commit_task, uncommit_task};
use crate::placement::{move_to_host_scheduler, PlaceCtx};
use crate::runqueue::{rq_index, EnqueueFlags};
use crate::sched::LwkSched;
use crate::stats::update_max32;
use crate::table::{Pid, TaskTable};
use crate::task::{SchedClass, Task, ThreadType};
use crate::types::{
    Error, SchedPolicy, COMMIT_MAX, LWK_DEFAULT_PRIO, LWK_DEFAULT_USER_PRIO, LWK_TIMESLICE,
};
use crate::{ktrace, kwarn, kwarn_once};

/// Why a CPU is being selected for a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectReason {
    /// The task is waking up.
    Wake,
    /// The task was just forked.
    Fork,
    /// Any other migration.
    Other,
}

/// Kernel thread names expected to visit LWK CPUs.
const EXPECTED_GUESTS: [&str; 3] = ["ksoftirqd", "cpuhp", "lwk_idle"];

impl LwkSched {
    /// Resistance is futile. A task enqueued on an LWK CPU is taken
    /// over by this scheduler:
    ///
    /// - an already-assimilated LWK task on an LWK CPU is left alone,
    /// - an assimilated guest landing on a host CPU is given back to
    ///   its original class,
    /// - a thread of an LWK process is converted to an LWK thread,
    /// - stop/idle-class tasks are never touched,
    /// - other host tasks become guests (or the LWK idle task).
    pub(crate) fn assimilate_task_locked(&self, tasks: &mut TaskTable, cpu: usize, pid: Pid) {
        let mcpu = &self.cpus[cpu];
        let Some(task) = tasks.get_mut(pid) else {
            return;
        };

        if task.lwk.assimilated {
            if mcpu.is_lwk() {
                return;
            }
            if task.lwk.thread_type == ThreadType::Guest {
                // LWK CPUs are being returned, or an affinitized
                // kthread moved back out. Give it back.
                task.class = task.lwk.orig_class.take().unwrap_or(SchedClass::Fair);
                task.policy = task.lwk.orig_policy;
                task.lwk.assimilated = false;
                mcpu.stats.givebacks.fetch_add(1, Ordering::Relaxed);
                ktrace!("giveback pid={} on cpu={}", pid, cpu);
            }
        }
        if !mcpu.is_lwk() {
            return;
        }
        if task.lwk.assimilated {
            return;
        }

        // A new LWK process thread launched onto an LWK CPU for the
        // first time.
        if let Some(proc) = task.lwk_process.clone() {
            let rr = proc.enable_rr.load(Ordering::Relaxed);
            task.policy = if rr != 0 {
                SchedPolicy::Rr
            } else {
                SchedPolicy::Fifo
            };
            task.prio = LWK_DEFAULT_PRIO;
            task.normal_prio = LWK_DEFAULT_PRIO;
            task.rt_priority = LWK_DEFAULT_USER_PRIO;
            task.class = SchedClass::Lwk;
            task.lwk.assimilated = true;
            task.lwk.thread_type = ThreadType::Normal;
            let slice = if rr != 0 { rr } else { LWK_TIMESLICE };
            task.lwk.time_slice = slice;
            task.lwk.orig_time_slice = slice;
            task.lwk.move_syscalls_disable = proc.move_syscalls_disable.load(Ordering::Relaxed);
            ktrace!("assimilated launch pid={} on cpu={}", pid, cpu);
            return;
        }

        // Stop and idle class tasks run on their own queues.
        if matches!(task.class, SchedClass::Stop | SchedClass::Idle) {
            return;
        }

        if !EXPECTED_GUESTS
            .iter()
            .any(|name| task.comm.starts_with(name))
        {
            kwarn!(
                "unexpected assimilation of task '{}' on cpu {}",
                task.comm,
                cpu
            );
        }
        task.lwk.orig_class = Some(task.class);
        task.lwk.orig_policy = task.policy;

        match task.class {
            SchedClass::Deadline | SchedClass::Rt | SchedClass::Fair => {
                task.lwk.assimilated = true;
            }
            _ => {
                kwarn_once!("unrecognized scheduling class, task '{}' left alone", task.comm);
            }
        }
        if task.lwk.assimilated {
            task.class = SchedClass::Lwk;
            task.lwk.time_slice = LWK_TIMESLICE;
            task.lwk.orig_time_slice = LWK_TIMESLICE;
            if Some(pid) == mcpu.idle_pid() {
                task.lwk.thread_type = ThreadType::Idle;
                ktrace!("assimilated idle pid={} on cpu={}", pid, cpu);
            } else {
                task.lwk.thread_type = ThreadType::Guest;
                mcpu.stats.guests.fetch_add(1, Ordering::Relaxed);
                ktrace!("assimilated guest pid={} on cpu={}", pid, cpu);
            }
        }
    }

    pub(crate) fn enqueue_task_locked(
        &self,
        tasks: &mut TaskTable,
        cpu: usize,
        pid: Pid,
        head: bool,
    ) -> Result<bool, Error> {
        self.assimilate_task_locked(tasks, cpu, pid);
        let task = tasks.get_mut(pid).ok_or(Error::NoSuchTask)?;
        if task.class != SchedClass::Lwk {
            return Ok(false);
        }
        if task.on_rq() {
            kwarn_once!("pid={} enqueued while already on a run queue", pid);
            return Ok(true);
        }
        let qindex = rq_index(task.prio);
        let mut flags = EnqueueFlags::empty();
        if head {
            flags |= EnqueueFlags::HEAD;
        }
        if task.policy == SchedPolicy::Rr {
            flags |= EnqueueFlags::RR;
        }
        if task.lwk.thread_type == ThreadType::Idle {
            flags |= EnqueueFlags::IDLE;
        }
        let mcpu = &self.cpus[cpu];
        let handle = mcpu.rq.lock().enqueue(pid, qindex, flags)?;
        task.lwk.rq = Some(crate::task::RqLink { cpu, handle });
        task.cpu = cpu;
        update_max32(&mcpu.stats.max_running, mcpu.rq.lock().nr_running());
        Ok(true)
    }

    /// Host-facing enqueue hook. Returns whether this scheduler took
    /// the task; `false` leaves it with its own class.
    pub fn enqueue_task(&self, cpu: usize, pid: Pid, head: bool) -> Result<bool, Error> {
        let mut tasks = self.tasks.lock();
        self.enqueue_task_locked(&mut tasks, cpu, pid, head)
    }

    pub(crate) fn dequeue_task_locked(&self, tasks: &mut TaskTable, pid: Pid) -> Result<(), Error> {
        let task = tasks.get_mut(pid).ok_or(Error::NoSuchTask)?;
        // The LWK idle entity is never dequeued.
        if task.lwk.thread_type == ThreadType::Idle {
            return Ok(());
        }
        let Some(link) = task.lwk.rq.take() else {
            return Ok(());
        };
        let now = self.cpus[link.cpu].local_tick.load(Ordering::Relaxed);
        update_curr(task, now);
        self.cpus[link.cpu].rq.lock().dequeue(link.handle)?;
        Ok(())
    }

    /// Host-facing dequeue hook (task blocks or leaves the CPU).
    pub fn dequeue_task(&self, pid: Pid) -> Result<(), Error> {
        let mut tasks = self.tasks.lock();
        self.dequeue_task_locked(&mut tasks, pid)
    }

    /// Yield hook: rotate the running task to the tail of its slot.
    /// No priority demotion.
    pub fn yield_task(&self, cpu: usize) {
        let tasks = self.tasks.lock();
        let mcpu = &self.cpus[cpu];
        let Some(pid) = mcpu.rq.lock().current() else {
            return;
        };
        let Some(task) = tasks.get(pid) else {
            return;
        };
        if let Some(link) = task.lwk.rq {
            mcpu.rq.lock().requeue(link.handle, false).ok();
        }
    }

    /// Fast-path yield: returns immediately when the caller is alone
    /// at its priority on its LWK CPU, otherwise rotates and asks for
    /// a reschedule.
    pub fn sched_yield(&self, cpu: usize) -> i64 {
        let mcpu = &self.cpus[cpu];
        {
            let tasks = self.tasks.lock();
            let rq = mcpu.rq.lock();
            if mcpu.is_lwk() {
                if let Some(pid) = rq.current() {
                    if let Some(link) = tasks.get(pid).and_then(|t| t.lwk.rq) {
                        if rq.is_singular(link.handle) {
                            return 0;
                        }
                    }
                }
            }
        }
        self.yield_task(cpu);
        mcpu.set_need_resched();
        0
    }

    /// Preemption check: a newly runnable task preempts the current
    /// one iff its queue index is strictly lower.
    pub(crate) fn check_preempt_curr_locked(&self, tasks: &TaskTable, cpu: usize, pid: Pid) {
        let mcpu = &self.cpus[cpu];
        let Some(task) = tasks.get(pid) else {
            return;
        };
        match mcpu.rq.lock().current() {
            None => mcpu.set_need_resched(),
            Some(curr_pid) => {
                if let Some(curr) = tasks.get(curr_pid) {
                    if rq_index(task.prio) < rq_index(curr.prio) {
                        mcpu.set_need_resched();
                    }
                }
            }
        }
    }

    pub fn check_preempt_curr(&self, cpu: usize, pid: Pid) {
        let tasks = self.tasks.lock();
        self.check_preempt_curr_locked(&tasks, cpu, pid);
    }

    /// Pick-next hook: first entity of the lowest non-empty slot, or
    /// none so the host continues its own class walk.
    pub fn pick_next_task(&self, cpu: usize) -> Option<Pid> {
        let mut tasks = self.tasks.lock();
        self.pick_next_locked(&mut tasks, cpu)
    }

    pub(crate) fn pick_next_locked(&self, tasks: &mut TaskTable, cpu: usize) -> Option<Pid> {
        let mcpu = &self.cpus[cpu];
        let now = mcpu.local_tick.load(Ordering::Relaxed);

        if let Some(prev_pid) = mcpu.rq.lock().current() {
            if let Some(prev) = tasks.get_mut(prev_pid) {
                update_curr(prev, now);
            }
        }

        let picked = mcpu.rq.lock().pick_first();
        let Some((_, pid)) = picked else {
            mcpu.rq.lock().set_current(None);
            return None;
        };
        if let Some(task) = tasks.get_mut(pid) {
            match task.lwk.thread_type {
                ThreadType::Idle => {}
                ThreadType::Guest => {
                    task.lwk.exec_start = now;
                    mcpu.stats.guest_dispatch.fetch_add(1, Ordering::Relaxed);
                }
                _ => task.lwk.exec_start = now,
            }
        }
        mcpu.rq.lock().set_current(Some(pid));
        Some(pid)
    }

    /// Clear the reschedule request and pick the next task.
    pub fn schedule(&self, cpu: usize) -> Option<Pid> {
        self.cpus[cpu].clear_need_resched();
        self.pick_next_task(cpu)
    }

    /// Task currently dispatched on a CPU.
    pub fn current_task(&self, cpu: usize) -> Option<Pid> {
        self.cpus[cpu].rq.lock().current()
    }

    /// Timer tick: runtime accounting plus round-robin timeslicing for
    /// tasks whose process enabled it.
    pub fn timer_tick(&self, cpu: usize) {
        let mcpu = &self.cpus[cpu];
        let now = mcpu.local_tick.fetch_add(1, Ordering::Relaxed) + 1;
        if mcpu.is_lwk() {
            mcpu.stats.timer_pop.fetch_add(1, Ordering::Relaxed);
        }

        let mut tasks = self.tasks.lock();
        let Some(pid) = mcpu.rq.lock().current() else {
            return;
        };
        let Some(task) = tasks.get_mut(pid) else {
            return;
        };
        if task.class != SchedClass::Lwk {
            return;
        }
        update_curr(task, now);

        // Timesliced LWK tasks carry the RR policy; everything else on
        // an LWK CPU runs to block.
        if mcpu.is_lwk() && task.policy != SchedPolicy::Rr {
            return;
        }
        task.lwk.time_slice = task.lwk.time_slice.saturating_sub(1);
        if task.lwk.time_slice != 0 {
            return;
        }
        task.lwk.time_slice = task.lwk.orig_time_slice;

        // Requeue to the end of the slot if we are not alone on it.
        if let Some(link) = task.lwk.rq {
            let mut rq = mcpu.rq.lock();
            if !rq.is_singular(link.handle) {
                rq.requeue(link.handle, false).ok();
                drop(rq);
                mcpu.set_need_resched();
            }
        }
    }

    /// Round-robin interval reported for a task, in ticks.
    pub fn get_rr_interval(&self, pid: Pid) -> u64 {
        self.with_task(pid, |t| {
            if t.policy == SchedPolicy::Rr {
                t.lwk.orig_time_slice as u64
            } else {
                0
            }
        })
        .unwrap_or(0)
    }

    /// Priority-changed hook.
    pub fn prio_changed(&self, cpu: usize, pid: Pid, oldprio: i32) {
        let tasks = self.tasks.lock();
        let mcpu = &self.cpus[cpu];
        let Some(task) = tasks.get(pid) else {
            return;
        };
        if !task.on_rq() {
            return;
        }
        match mcpu.rq.lock().current() {
            Some(curr_pid) if curr_pid == pid => {
                // Reschedule on drop of priority.
                if rq_index(oldprio) < rq_index(task.prio) {
                    mcpu.set_need_resched();
                }
            }
            Some(curr_pid) => {
                if let Some(curr) = tasks.get(curr_pid) {
                    if rq_index(task.prio) < rq_index(curr.prio) {
                        mcpu.set_need_resched();
                    }
                }
            }
            None => mcpu.set_need_resched(),
        }
    }

    /// Change a queued task's priority the way the host core does it:
    /// dequeue, update, enqueue, notify.
    pub fn set_task_prio(&self, pid: Pid, prio: i32) -> Result<(), Error> {
        let mut tasks = self.tasks.lock();
        let task = tasks.get_mut(pid).ok_or(Error::NoSuchTask)?;
        let oldprio = task.prio;
        let link = task.lwk.rq;
        let cpu = task.cpu;
        if let Some(link) = link {
            self.dequeue_task_locked(&mut tasks, pid)?;
            let task = tasks.get_mut(pid).ok_or(Error::NoSuchTask)?;
            task.prio = prio;
            task.normal_prio = prio;
            self.enqueue_task_locked(&mut tasks, link.cpu, pid, false)?;
        } else {
            task.prio = prio;
            task.normal_prio = prio;
        }
        drop(tasks);
        self.prio_changed(cpu, pid, oldprio);
        Ok(())
    }

    /// Switched-to hook: reschedule when the queue-index ordering now
    /// favours the task.
    pub fn switched_to(&self, cpu: usize, pid: Pid) {
        let tasks = self.tasks.lock();
        let mcpu = &self.cpus[cpu];
        let Some(task) = tasks.get(pid) else {
            return;
        };
        if !task.on_rq() {
            return;
        }
        match mcpu.rq.lock().current() {
            Some(curr_pid) if curr_pid != pid => {
                if let Some(curr) = tasks.get(curr_pid) {
                    if rq_index(task.prio) < rq_index(curr.prio) {
                        mcpu.set_need_resched();
                    }
                }
            }
            _ => {}
        }
    }

    /// Switched-from hook. Placement at creation time is
    /// authoritative; nothing is pulled after a class change.
    pub fn switched_from(&self, _cpu: usize, _pid: Pid) {}

    /// set-cpus-allowed hook: copy the mask and its weight.
    pub fn set_cpus_allowed(&self, pid: Pid, mask: &crate::cpuset::CpuSet) -> Result<(), Error> {
        let mut tasks = self.tasks.lock();
        let task = tasks.get_mut(pid).ok_or(Error::NoSuchTask)?;
        task.cpus_allowed = *mask;
        task.nr_cpus_allowed = mask.weight();
        Ok(())
    }

    /// select-task-rq hook.
    pub(crate) fn select_task_rq_locked(
        &self,
        tasks: &TaskTable,
        pid: Pid,
        cpu: usize,
        reason: SelectReason,
    ) -> usize {
        let Some(task) = tasks.get(pid) else {
            return cpu;
        };
        let Some(ctx) = PlaceCtx::of(task) else {
            return cpu;
        };
        let mut ncpu = cpu;

        match reason {
            SelectReason::Wake => {
                if let Some(home) = task.lwk.cpu_home {
                    if task.cpus_allowed.is_set(home) {
                        ncpu = home;
                    }
                }
            }
            SelectReason::Fork => {
                // Clone operation: find the best candidate.
                let picked = self.select_cpu_candidate(&ctx, COMMIT_MAX).unwrap_or(cpu);
                ktrace!("clone cpu assign pid={} cpu={}", pid, picked);
                return picked;
            }
            SelectReason::Other => {}
        }

        // Waking on the LWK side?
        if task.cpus_allowed.intersects(&ctx.proc.lwkcpus) {
            if task.cpus_allowed.is_set(ncpu) {
                if ncpu < self.cpus.len() && self.cpus[ncpu].is_overcommitted() {
                    // Look for a better candidate.
                    if let Some(better) = self.select_cpu_candidate(&ctx, 0) {
                        ncpu = better;
                    }
                }
            } else {
                ncpu = self.select_cpu_candidate(&ctx, COMMIT_MAX).unwrap_or(ncpu);
            }
        }
        ncpu
    }

    pub fn select_task_rq(&self, pid: Pid, cpu: usize, reason: SelectReason) -> usize {
        let tasks = self.tasks.lock();
        self.select_task_rq_locked(&tasks, pid, cpu, reason)
    }

    /// Commit migration when the host moves a task between CPUs: an
    /// LWK process task landing on an LWK CPU it is not yet accounted
    /// against releases its previous commit and takes a new one.
    pub(crate) fn set_task_cpu_locked(&self, tasks: &mut TaskTable, pid: Pid, new_cpu: usize) {
        let Some(task) = tasks.get_mut(pid) else {
            return;
        };
        if new_cpu < self.cpus.len()
            && self.cpus[new_cpu].is_lwk()
            && task.lwk_process.is_some()
            && task.lwk.cpu_home != Some(new_cpu)
        {
            uncommit_task(&self.cpus, task);
            commit_task(&self.cpus[new_cpu], task);
        }
        task.cpu = new_cpu;
    }

    pub fn set_task_cpu(&self, pid: Pid, new_cpu: usize) {
        let mut tasks = self.tasks.lock();
        self.set_task_cpu_locked(&mut tasks, pid, new_cpu);
    }

    /// Syscall migration accounting hook for the host's syscall
    /// shipping machinery.
    pub fn note_syscall_migration(&self, cpu: usize) {
        self.cpus[cpu].stats.sysc_migr.fetch_add(1, Ordering::Relaxed);
    }

    /// Launch-time CPU selection: a not-yet-assimilated LWK process
    /// task waking after its affinity moved into the LWK world.
    fn select_launch_cpu_locked(&self, tasks: &TaskTable, pid: Pid, cpu: usize) -> usize {
        let Some(task) = tasks.get(pid) else {
            return cpu;
        };
        let Some(ctx) = PlaceCtx::of(task) else {
            return cpu;
        };
        if !task.cpus_allowed.is_set(cpu) && task.cpus_allowed.is_subset_of(&ctx.proc.lwkcpus) {
            return self.select_cpu_candidate(&ctx, COMMIT_MAX).unwrap_or(cpu);
        }
        cpu
    }

    /// CPU a host-scheduled task wakes on: its current CPU when still
    /// allowed, otherwise the first allowed host CPU. LWK CPUs are
    /// avoided; the host does not schedule onto them.
    fn host_wake_cpu(&self, task: &Task) -> usize {
        let cur = task.cpu;
        let is_lwk = |c: usize| c < self.cpus.len() && self.cpus[c].is_lwk();
        if task.cpus_allowed.is_set(cur) && !is_lwk(cur) {
            return cur;
        }
        task.cpus_allowed
            .iter()
            .find(|&c| !is_lwk(c))
            .or_else(|| task.cpus_allowed.first_set())
            .unwrap_or(cur)
    }

    /// Wake a blocked task: route it, migrate commits, enqueue and run
    /// the preemption check. Returns the chosen CPU.
    pub fn wake_task(&self, pid: Pid) -> Result<usize, Error> {
        let mut tasks = self.tasks.lock();
        let task = tasks.get(pid).ok_or(Error::NoSuchTask)?;
        if task.on_rq() {
            return Ok(task.cpu);
        }
        let cur_cpu = task.cpu;
        let target = if task.class == SchedClass::Lwk {
            self.select_task_rq_locked(&tasks, pid, cur_cpu, SelectReason::Wake)
        } else if task.lwk_process.is_some() && !task.lwk.assimilated {
            // A new LWK process being launched onto its CPUs.
            self.select_launch_cpu_locked(&tasks, pid, cur_cpu)
        } else {
            self.host_wake_cpu(task)
        };
        self.set_task_cpu_locked(&mut tasks, pid, target);
        self.enqueue_task_locked(&mut tasks, target, pid, false)?;
        self.check_preempt_curr_locked(&tasks, target, pid);
        Ok(target)
    }

    /// First wake of a forked task.
    pub fn wake_new_task(&self, pid: Pid) -> Result<usize, Error> {
        let mut tasks = self.tasks.lock();
        let task = tasks.get(pid).ok_or(Error::NoSuchTask)?;
        let cur_cpu = task.cpu;
        let target = if task.class == SchedClass::Lwk {
            self.select_task_rq_locked(&tasks, pid, cur_cpu, SelectReason::Fork)
        } else {
            self.host_wake_cpu(task)
        };
        self.set_task_cpu_locked(&mut tasks, pid, target);
        self.enqueue_task_locked(&mut tasks, target, pid, false)?;
        self.check_preempt_curr_locked(&tasks, target, pid);
        Ok(target)
    }

    /// Fork hook. The child control block is created here; placement
    /// happens now for utility threads and at the first wake for
    /// compute threads.
    pub fn task_fork(&self, parent_pid: Pid, child_pid: Pid, same_thread_group: bool) -> Result<(), Error> {
        let mut tasks = self.tasks.lock();
        let parent = tasks.get_mut(parent_pid).ok_or(Error::NoSuchTask)?;
        let hints = parent.lwk.clone_hints.take().unwrap_or_default();
        let parent_home = parent.lwk.cpu_home;
        let mut child = crate::task::Task::fork_from(parent, child_pid, same_thread_group);
        let proc = child.lwk_process.clone();

        match (same_thread_group, proc) {
            (true, Some(proc)) => {
                let thread_count = proc.threads_created.fetch_add(1, Ordering::SeqCst) + 1;
                let expected_util = proc.num_util_threads.load(Ordering::Relaxed);
                if thread_count > expected_util
                    && !hints.flags.contains(crate::attr::CloneFlags::UTIL)
                {
                    // A worker thread within the LWK process: give it
                    // the full LWK CPU set and make room so it can run
                    // alone on a CPU.
                    child.cpus_allowed = proc.lwkcpus;
                    child.nr_cpus_allowed = proc.lwkcpus.weight();
                    if let Some(ctx) = PlaceCtx::of(&child) {
                        self.push_utility_threads(&mut tasks, &ctx);
                    }
                } else {
                    // A placement failure degrades to the inherited
                    // mask; the thread is still created.
                    self.place_utility_thread(&mut child, parent_home, &hints).ok();
                }
            }
            (false, proc) => {
                // A fork of a full process: default host scheduling,
                // pre-LWK affinity restored.
                move_to_host_scheduler(&mut child, Behavior::empty());
                if let Some(proc) = proc {
                    let orig = proc.original_cpus_allowed();
                    child.cpus_allowed = orig;
                    child.nr_cpus_allowed = orig.weight();
                    child.lwk_process = None;
                }
            }
            (true, None) => {}
        }
        tasks.insert(child)
    }

    /// Remove a task from its queue and hand it to the host fair
    /// class, as when a utility thread is pushed off an LWK CPU.
    pub(crate) fn push_to_host_scheduler(&self, task: &mut Task) {
        if let Some(link) = task.lwk.rq.take() {
            let mut rq = self.cpus[link.cpu].rq.lock();
            rq.dequeue(link.handle).ok();
            if rq.current() == Some(task.pid) {
                rq.set_current(None);
            }
            self.cpus[link.cpu].set_need_resched();
        }
        move_to_host_scheduler(task, task.lwk.active_hints.behavior);
    }

    /// setaffinity surface: honours the process's disable knob, copies
    /// the mask and migrates the task when its CPU fell out of it.
    pub fn sys_setaffinity(&self, pid: Pid, mask: &crate::cpuset::CpuSet) -> i64 {
        let mut tasks = self.tasks.lock();
        let Some(task) = tasks.get(pid) else {
            return Error::NoSuchTask.errno();
        };
        if let Some(proc) = task.lwk_process.as_ref() {
            if let Some(errno) = proc.setaffinity_errno() {
                return -(errno as i64);
            }
        }
        if mask.is_empty() {
            return Error::ConfigInvalid.errno();
        }
        let stat_cpu = task.lwk.cpu_home.unwrap_or(task.cpu);
        if stat_cpu < self.cpus.len() {
            self.cpus[stat_cpu]
                .stats
                .setaffinity
                .fetch_add(1, Ordering::Relaxed);
        }

        let was_lwk_class = task.class == SchedClass::Lwk;
        let has_proc = task.lwk_process.is_some();
        let cur_cpu = task.cpu;
        {
            let task = tasks.get_mut(pid).unwrap();
            task.cpus_allowed = *mask;
            task.nr_cpus_allowed = mask.weight();
        }

        if was_lwk_class || has_proc {
            let ncpu = self.select_next_cpu_locked(&tasks, pid, mask);
            if ncpu != cur_cpu {
                let queued = tasks.get(pid).map(|t| t.on_rq()).unwrap_or(false);
                if queued {
                    self.dequeue_task_locked(&mut tasks, pid).ok();
                }
                self.set_task_cpu_locked(&mut tasks, pid, ncpu);
                if queued {
                    if self.enqueue_task_locked(&mut tasks, ncpu, pid, false).is_ok() {
                        self.check_preempt_curr_locked(&tasks, ncpu, pid);
                    }
                }
            }
        }
        0
    }

    /// Choose a CPU when the allowed mask changed under a task.
    pub(crate) fn select_next_cpu_locked(
        &self,
        tasks: &TaskTable,
        pid: Pid,
        new_mask: &crate::cpuset::CpuSet,
    ) -> usize {
        let Some(task) = tasks.get(pid) else {
            return 0;
        };
        // The initial thread returns to its original CPU when the mask
        // opens back up; this keeps OMP topology probes deterministic.
        if let Some(cpu) = self.select_main_thread_home(task) {
            return cpu;
        }
        if new_mask.is_set(task.cpu) {
            return task.cpu;
        }
        if let Some(home) = task.lwk.cpu_home {
            if new_mask.is_set(home) {
                return home;
            }
        }
        if let Some(ctx) = PlaceCtx::of(task) {
            if new_mask.is_subset_of(&ctx.proc.lwkcpus) {
                if let Some(cpu) = self.select_cpu_candidate(&ctx, COMMIT_MAX) {
                    return cpu;
                }
            }
        }
        new_mask.first_set().unwrap_or(task.cpu)
    }
}

/// Update the running task's runtime statistics.
fn update_curr(task: &mut Task, now: u64) {
    if task.class != SchedClass::Lwk || task.lwk.thread_type == ThreadType::Idle {
        return;
    }
    let delta = now.saturating_sub(task.lwk.exec_start);
    if delta == 0 {
        return;
    }
    task.lwk.sum_exec_ticks += delta;
    task.lwk.exec_start = now;
}
