//! Per-CPU scheduler statistics.
//!
//! Counters are relaxed atomics so the dispatch path never takes a lock
//! for accounting; maxima use a guarded compare-and-store.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::kinfo;

/// Statistics kept on every CPU descriptor.
#[derive(Default)]
pub struct CpuStats {
    /// Deepest observed compute-commit level.
    pub max_compute_level: AtomicU32,
    /// Deepest observed utility-commit level.
    pub max_util_level: AtomicU32,
    /// Most entities concurrently runnable (LWK idle excluded).
    pub max_running: AtomicU32,
    /// Dispatches of assimilated guest tasks.
    pub guest_dispatch: AtomicU64,
    /// Timer ticks taken while this CPU was an LWK CPU.
    pub timer_pop: AtomicU64,
    /// Syscall migrations off this CPU.
    pub sysc_migr: AtomicU64,
    /// setaffinity calls handled for tasks homed here.
    pub setaffinity: AtomicU64,
    /// Utility threads pushed off this CPU to make room for compute.
    pub pushed: AtomicU64,
    /// Tasks assimilated as guests on this CPU.
    pub guests: AtomicU64,
    /// Guests restored to their original scheduling class.
    pub givebacks: AtomicU64,
    /// Commit decrements that found a zero counter.
    pub commit_underflow: AtomicU64,
    /// Commit increments refused at the saturation bound.
    pub commit_overflow: AtomicU64,
}

/// Raise a maximum statistic if `val` exceeds it.
#[inline]
pub fn update_max32(stat: &AtomicU32, val: u32) {
    if val > stat.load(Ordering::Relaxed) {
        stat.store(val, Ordering::Relaxed);
    }
}

impl CpuStats {
    /// Reset per-launch counters. Guest and give-back totals span
    /// process lifetimes and are left unchanged.
    pub fn prepare_launch(&self) {
        self.max_compute_level.store(0, Ordering::Relaxed);
        self.max_util_level.store(0, Ordering::Relaxed);
        self.max_running.store(0, Ordering::Relaxed);
        self.guest_dispatch.store(0, Ordering::Relaxed);
        self.timer_pop.store(0, Ordering::Relaxed);
        self.sysc_migr.store(0, Ordering::Relaxed);
        self.setaffinity.store(0, Ordering::Relaxed);
        self.pushed.store(0, Ordering::Relaxed);
        self.commit_underflow.store(0, Ordering::Relaxed);
        self.commit_overflow.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            max_compute_level: self.max_compute_level.load(Ordering::Relaxed),
            max_util_level: self.max_util_level.load(Ordering::Relaxed),
            max_running: self.max_running.load(Ordering::Relaxed),
            guest_dispatch: self.guest_dispatch.load(Ordering::Relaxed),
            timer_pop: self.timer_pop.load(Ordering::Relaxed),
            sysc_migr: self.sysc_migr.load(Ordering::Relaxed),
            setaffinity: self.setaffinity.load(Ordering::Relaxed),
            pushed: self.pushed.load(Ordering::Relaxed),
            guests: self.guests.load(Ordering::Relaxed),
            givebacks: self.givebacks.load(Ordering::Relaxed),
            commit_underflow: self.commit_underflow.load(Ordering::Relaxed),
            commit_overflow: self.commit_overflow.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of the counters, for summaries and tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub max_compute_level: u32,
    pub max_util_level: u32,
    pub max_running: u32,
    pub guest_dispatch: u64,
    pub timer_pop: u64,
    pub sysc_migr: u64,
    pub setaffinity: u64,
    pub pushed: u64,
    pub guests: u64,
    pub givebacks: u64,
    pub commit_underflow: u64,
    pub commit_overflow: u64,
}

impl StatsSnapshot {
    /// Fold one CPU's counters into a process-wide summary.
    pub fn accumulate(&mut self, cpu: &StatsSnapshot) {
        if cpu.max_compute_level == 0 {
            return;
        }
        if cpu.max_compute_level > self.max_compute_level {
            self.max_compute_level = cpu.max_compute_level;
        }
        if cpu.max_util_level > self.max_util_level {
            self.max_util_level = cpu.max_util_level;
        }
        if cpu.max_running > self.max_running {
            self.max_running = cpu.max_running;
        }
        self.guest_dispatch += cpu.guest_dispatch;
        self.timer_pop += cpu.timer_pop;
        self.sysc_migr += cpu.sysc_migr;
        self.setaffinity += cpu.setaffinity;
        self.pushed += cpu.pushed;
    }

    /// Emit the per-CPU detail line of the end-of-job summary.
    pub fn log_cpu_line(&self, tgid: u64, cpu: usize, detail_level: i32) {
        if ((detail_level == 1) && (self.max_compute_level > 1)) || (detail_level > 2) {
            kinfo!(
                "PID={} cpuid={:2} max_compute={} max_util={} max_running={} guest_dispatch={} timer_pop={} setaffinity={} sysc_migr={} pushed={}",
                tgid,
                cpu,
                self.max_compute_level,
                self.max_util_level,
                self.max_running,
                self.guest_dispatch,
                self.timer_pop,
                self.setaffinity,
                self.sysc_migr,
                self.pushed
            );
        }
    }

    /// Emit the process-wide line of the end-of-job summary.
    pub fn log_process_line(&self, tgid: u64, threads: u32, cpus: usize, detail_level: i32) {
        if ((detail_level == 1) && (self.max_compute_level > 1)) || (detail_level > 1) {
            kinfo!(
                "PID={} threads={} cpus={:2} max_compute={} max_util={} max_running={} guest_dispatch={} timer_pop={} setaffinity={} sysc_migr={} pushed={}",
                tgid,
                threads,
                cpus,
                self.max_compute_level,
                self.max_util_level,
                self.max_running,
                self.guest_dispatch,
                self.timer_pop,
                self.setaffinity,
                self.sysc_migr,
                self.pushed
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_max_only_raises() {
        let m = AtomicU32::new(3);
        update_max32(&m, 2);
        assert_eq!(m.load(Ordering::Relaxed), 3);
        update_max32(&m, 7);
        assert_eq!(m.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn prepare_launch_keeps_guest_totals() {
        let s = CpuStats::default();
        s.guests.store(4, Ordering::Relaxed);
        s.givebacks.store(2, Ordering::Relaxed);
        s.pushed.store(9, Ordering::Relaxed);
        s.prepare_launch();
        let snap = s.snapshot();
        assert_eq!(snap.guests, 4);
        assert_eq!(snap.givebacks, 2);
        assert_eq!(snap.pushed, 0);
    }

    #[test]
    fn accumulate_skips_idle_cpus() {
        let mut total = StatsSnapshot::default();
        let mut used = StatsSnapshot::default();
        used.max_compute_level = 2;
        used.pushed = 1;
        let unused = StatsSnapshot {
            pushed: 5,
            ..StatsSnapshot::default()
        };
        total.accumulate(&used);
        total.accumulate(&unused);
        assert_eq!(total.max_compute_level, 2);
        assert_eq!(total.pushed, 1);
    }
}
