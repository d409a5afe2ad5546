//! Shared fixtures for the scheduler integration tests.
//!
//! Builds small synthetic machines: a handful of LWK CPUs owned by one
//! process plus a few host CPUs for utility spill-over.

#![allow(dead_code)]

use std::sync::Arc;

use lwksched::cpuset::CpuSet;
use lwksched::idle::IdleCaps;
use lwksched::task::{SchedClass, Task};
use lwksched::topology::Topology;
use lwksched::types::SchedPolicy;
use lwksched::{LwkProcess, LwkSched, Pid};

/// A machine with a configured LWK process ready to fork threads.
pub struct Harness {
    pub sched: Arc<LwkSched>,
    pub proc: Arc<LwkProcess>,
    pub main_pid: Pid,
    pub lwkcpus: Vec<usize>,
    pub utilcpus: Vec<usize>,
    next_pid: Pid,
}

pub const MAIN_PID: Pid = 1000;

impl Harness {
    /// Fully parameterised machine: topology, low-power caps and a
    /// pre-launch hook for process options.
    pub fn custom(
        topology: Topology,
        lwkcpus: &[usize],
        utilcpus: &[usize],
        caps: IdleCaps,
        configure: impl FnOnce(&LwkProcess),
    ) -> Self {
        let sched = Arc::new(LwkSched::new(&topology, caps));
        let lwk_set = CpuSet::from_cpus(lwkcpus);
        let util_set = CpuSet::from_cpus(utilcpus);
        sched.activate_lwk(&lwk_set);

        let proc = sched
            .process_init(MAIN_PID, lwk_set, lwkcpus, util_set)
            .expect("process record");
        configure(&proc);

        let mut harness = Self {
            sched,
            proc,
            main_pid: MAIN_PID,
            lwkcpus: lwkcpus.to_vec(),
            utilcpus: utilcpus.to_vec(),
            next_pid: MAIN_PID + 1,
        };
        harness.spawn_main();
        harness
    }

    /// `lwkcpus` become LWK CPUs in the given sequence order;
    /// `utilcpus` stay with the host as the shared utility pool.
    pub fn with_topology(topology: Topology, lwkcpus: &[usize], utilcpus: &[usize]) -> Self {
        Self::custom(topology, lwkcpus, utilcpus, IdleCaps::disabled(), |_| {})
    }

    /// Flat machine: `n` CPUs, no topology structure.
    pub fn flat(n: usize, lwkcpus: &[usize], utilcpus: &[usize]) -> Self {
        Self::with_topology(Topology::flat(n), lwkcpus, utilcpus)
    }

    fn spawn_main(&mut self) {
        // The main thread arrives from the host side with its original
        // affinity. Launch narrows the mask to the LWK CPUs and the
        // first enqueue on an LWK CPU assimilates it. No CPU commit is
        // taken here, so scenarios start from clean counters; tests
        // that want the committed-main layout run the setaffinity flow
        // themselves.
        let first_lwk = self.lwkcpus[0];
        let all = CpuSet::first_n(self.sched.num_cpus());
        let mut task = Task::new(
            self.main_pid,
            self.main_pid,
            "app",
            SchedClass::Fair,
            SchedPolicy::Normal,
            120,
            all,
        );
        task.cpu = first_lwk;
        task.lwk_process = Some(self.proc.clone());
        self.sched.create_task(task).expect("main task");
        self.sched.process_start(self.main_pid).expect("launch");
        self.sched
            .set_cpus_allowed(self.main_pid, &self.proc.lwkcpus)
            .expect("narrow mask");
        let taken = self
            .sched
            .enqueue_task(first_lwk, self.main_pid, false)
            .expect("main enqueue");
        assert!(taken, "main thread must be assimilated");
    }

    pub fn alloc_pid(&mut self) -> Pid {
        let pid = self.next_pid;
        self.next_pid += 1;
        pid
    }

    /// Fork a thread of the LWK process and wake it; returns (pid, cpu).
    pub fn fork_thread(&mut self, parent: Pid) -> (Pid, usize) {
        let pid = self.alloc_pid();
        self.sched.task_fork(parent, pid, true).expect("fork");
        let cpu = self.sched.wake_new_task(pid).expect("wake");
        (pid, cpu)
    }

    pub fn compute_commits(&self, cpu: usize) -> i32 {
        self.sched.read_commits(cpu).0
    }

    pub fn utility_commits(&self, cpu: usize) -> i32 {
        self.sched.read_commits(cpu).1
    }

    pub fn cpu_home(&self, pid: Pid) -> Option<usize> {
        self.sched.with_task(pid, |t| t.lwk.cpu_home).unwrap()
    }

    pub fn thread_type(&self, pid: Pid) -> lwksched::ThreadType {
        self.sched.with_task(pid, |t| t.lwk.thread_type).unwrap()
    }

    pub fn class_of(&self, pid: Pid) -> SchedClass {
        self.sched.with_task(pid, |t| t.class).unwrap()
    }

    pub fn allowed_of(&self, pid: Pid) -> CpuSet {
        self.sched.with_task(pid, |t| t.cpus_allowed).unwrap()
    }
}

/// Register a plain host task (no LWK process attached).
pub fn spawn_host_task(
    sched: &LwkSched,
    pid: Pid,
    comm: &str,
    class: SchedClass,
    policy: SchedPolicy,
    prio: i32,
    cpus: &[usize],
) {
    let task = Task::new(
        pid,
        pid,
        comm,
        class,
        policy,
        prio,
        CpuSet::from_cpus(cpus),
    );
    sched.create_task(task).expect("host task");
}
