//! LWK process record and the boot/yod configuration channel.
//!
//! One record per process that owns LWK CPUs. Policy knobs arrive as
//! name/value option strings before launch; scalar knobs are atomics so
//! the hot paths read them without a lock.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU8, Ordering};
use spin::Mutex;

use crate::cpuset::CpuSet;
use crate::kerror;
use crate::table::Pid;
use crate::types::{msecs_to_ticks, CommitScope, CpusPerUtil, Error};

/// Per-process scheduler state and policy knobs.
pub struct LwkProcess {
    /// Owning thread-group id.
    pub tgid: Pid,
    /// CPUs ceded to this process.
    pub lwkcpus: CpuSet,
    /// Ordered assignment preference over the LWK CPUs. Utility
    /// threads allocate from the tail so workers keep the head order.
    pub lwkcpus_sequence: Vec<usize>,
    /// Host CPUs usable for utility threads.
    utilcpus: Mutex<CpuSet>,
    /// Allowed-CPU set the process had before moving to LWK CPUs.
    original_cpus_allowed: Mutex<CpuSet>,
    /// Moveable utility threads currently on LWK CPUs, most recently
    /// placed first.
    pub util_list: Mutex<VecDeque<Pid>>,
    /// Threads created by this process so far.
    pub threads_created: AtomicU32,
    /// Number of leading clones expected to be utility threads.
    pub num_util_threads: AtomicU32,
    pub move_syscalls_disable: AtomicBool,
    /// Round-robin timeslice in ticks; 0 disables timeslicing.
    pub enable_rr: AtomicU32,
    /// Errno+1 to fail setaffinity with; 0 leaves setaffinity enabled.
    disable_setaffinity: AtomicI32,
    /// End-of-job statistics verbosity.
    pub sched_stats: AtomicI32,
    /// Range of the utility CPU search; -1 means the whole sequence.
    pub max_cpus_for_util: AtomicI32,
    /// Commit threshold for utility placement without explicit location.
    pub max_util_threads_per_cpu: AtomicI32,
    overcommit_behavior: AtomicU8,
    allowed_cpus_per_util: AtomicU8,
}

impl LwkProcess {
    pub fn new(tgid: Pid, lwkcpus: CpuSet, sequence: &[usize], utilcpus: CpuSet) -> Self {
        Self {
            tgid,
            lwkcpus,
            lwkcpus_sequence: sequence.to_vec(),
            utilcpus: Mutex::new(utilcpus),
            original_cpus_allowed: Mutex::new(CpuSet::new()),
            util_list: Mutex::new(VecDeque::new()),
            threads_created: AtomicU32::new(0),
            num_util_threads: AtomicU32::new(0),
            move_syscalls_disable: AtomicBool::new(false),
            enable_rr: AtomicU32::new(0),
            disable_setaffinity: AtomicI32::new(0),
            sched_stats: AtomicI32::new(0),
            max_cpus_for_util: AtomicI32::new(-1),
            max_util_threads_per_cpu: AtomicI32::new(1),
            overcommit_behavior: AtomicU8::new(CommitScope::OnlyUtilityCommits as u8),
            allowed_cpus_per_util: AtomicU8::new(CpusPerUtil::Multiple as u8),
        }
    }

    pub fn num_lwkcpus(&self) -> usize {
        self.lwkcpus_sequence.len()
    }

    pub fn utilcpus(&self) -> CpuSet {
        *self.utilcpus.lock()
    }

    pub fn clear_utilcpus(&self) {
        self.utilcpus.lock().clear_all();
    }

    pub fn original_cpus_allowed(&self) -> CpuSet {
        *self.original_cpus_allowed.lock()
    }

    pub fn save_original_cpus_allowed(&self, mask: CpuSet) {
        *self.original_cpus_allowed.lock() = mask;
    }

    pub fn overcommit_behavior(&self) -> CommitScope {
        match self.overcommit_behavior.load(Ordering::Relaxed) {
            1 => CommitScope::OnlyComputeCommits,
            2 => CommitScope::OnlyUtilityCommits,
            _ => CommitScope::AllCommits,
        }
    }

    pub fn allowed_cpus_per_util(&self) -> CpusPerUtil {
        if self.allowed_cpus_per_util.load(Ordering::Relaxed) == CpusPerUtil::One as u8 {
            CpusPerUtil::One
        } else {
            CpusPerUtil::Multiple
        }
    }

    /// Errno the setaffinity surface should fail with, if configured.
    pub fn setaffinity_errno(&self) -> Option<i32> {
        let v = self.disable_setaffinity.load(Ordering::Relaxed);
        if v > 0 {
            Some(v - 1)
        } else {
            None
        }
    }

    /// Apply one option from the boot/yod channel.
    ///
    /// Unknown keys are rejected; invalid values surface
    /// [`Error::ConfigInvalid`] and leave the previous setting intact.
    pub fn set_option(&self, name: &str, val: Option<&str>) -> Result<(), Error> {
        match name {
            "move-syscalls-disable" => {
                self.move_syscalls_disable.store(true, Ordering::Relaxed);
                Ok(())
            }
            "lwksched-enable-rr" => self.opt_enable_rr(val),
            "lwksched-disable-setaffinity" => self.opt_disable_setaffinity(val),
            "lwksched-stats" => self.opt_stats(val),
            "util-threshold" => self.opt_util_threshold(val),
            "overcommit-behavior" => self.opt_overcommit_behavior(val),
            "one-cpu-per-util" => {
                self.allowed_cpus_per_util
                    .store(CpusPerUtil::One as u8, Ordering::Relaxed);
                Ok(())
            }
            _ => {
                kerror!("(!) Unknown scheduler option '{}'", name);
                Err(Error::ConfigInvalid)
            }
        }
    }

    fn opt_enable_rr(&self, val: Option<&str>) -> Result<(), Error> {
        let min_msecs = (1000 / crate::types::TICK_HZ).max(1);
        let msecs: u64 = val
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| self.log_invalid("lwksched-enable-rr", val))?;
        // A zero value means no rr time-slicing.
        if msecs == 0 {
            return Ok(());
        }
        if msecs < min_msecs {
            return Err(self.log_invalid("lwksched-enable-rr", val));
        }
        self.enable_rr
            .store(msecs_to_ticks(msecs) as u32, Ordering::Relaxed);
        Ok(())
    }

    fn opt_disable_setaffinity(&self, val: Option<&str>) -> Result<(), Error> {
        let errno: i32 = val
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| self.log_invalid("lwksched-disable-setaffinity", val))?;
        if errno < 0 {
            return Err(self.log_invalid("lwksched-disable-setaffinity", val));
        }
        self.disable_setaffinity.store(errno + 1, Ordering::Relaxed);
        Ok(())
    }

    fn opt_stats(&self, val: Option<&str>) -> Result<(), Error> {
        let level: i32 = val
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| self.log_invalid("lwksched-stats", val))?;
        if level < 0 {
            return Err(self.log_invalid("lwksched-stats", val));
        }
        self.sched_stats.store(level, Ordering::Relaxed);
        Ok(())
    }

    /// "max_cpus:max_threads_per_cpu"
    fn opt_util_threshold(&self, val: Option<&str>) -> Result<(), Error> {
        let v = val.ok_or_else(|| self.log_invalid("util-threshold", val))?;
        let (cpus_str, threads_str) = v
            .split_once(':')
            .ok_or_else(|| self.log_invalid("util-threshold", val))?;
        let max_cpus: i32 = cpus_str
            .parse()
            .map_err(|_| self.log_invalid("util-threshold", val))?;
        let max_threads: i32 = threads_str
            .parse()
            .map_err(|_| self.log_invalid("util-threshold", val))?;
        self.max_cpus_for_util.store(max_cpus, Ordering::Relaxed);
        self.max_util_threads_per_cpu
            .store(max_threads, Ordering::Relaxed);
        Ok(())
    }

    fn opt_overcommit_behavior(&self, val: Option<&str>) -> Result<(), Error> {
        let v: i32 = val
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| self.log_invalid("overcommit-behavior", val))?;
        let scope = CommitScope::from_config(v)
            .ok_or_else(|| self.log_invalid("overcommit-behavior", val))?;
        self.overcommit_behavior
            .store(scope as u8, Ordering::Relaxed);
        Ok(())
    }

    fn log_invalid(&self, opt: &str, val: Option<&str>) -> Error {
        kerror!("(!) Illegal value ({:?}) for option '{}'", val, opt);
        Error::ConfigInvalid
    }
}

impl core::fmt::Debug for LwkProcess {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LwkProcess")
            .field("tgid", &self.tgid)
            .field("lwkcpus", &self.lwkcpus)
            .field("threads_created", &self.threads_created)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proc() -> LwkProcess {
        LwkProcess::new(100, CpuSet::from_cpus(&[0, 1]), &[0, 1], CpuSet::new())
    }

    #[test]
    fn defaults_match_process_init() {
        let p = proc();
        assert_eq!(p.max_cpus_for_util.load(Ordering::Relaxed), -1);
        assert_eq!(p.max_util_threads_per_cpu.load(Ordering::Relaxed), 1);
        assert_eq!(p.overcommit_behavior(), CommitScope::OnlyUtilityCommits);
        assert_eq!(p.allowed_cpus_per_util(), CpusPerUtil::Multiple);
        assert_eq!(p.enable_rr.load(Ordering::Relaxed), 0);
        assert_eq!(p.setaffinity_errno(), None);
    }

    #[test]
    fn enable_rr_validates_range() {
        let p = proc();
        assert_eq!(
            p.set_option("lwksched-enable-rr", None),
            Err(Error::ConfigInvalid)
        );
        assert_eq!(
            p.set_option("lwksched-enable-rr", Some("nope")),
            Err(Error::ConfigInvalid)
        );
        // Zero keeps timeslicing off without an error.
        assert!(p.set_option("lwksched-enable-rr", Some("0")).is_ok());
        assert_eq!(p.enable_rr.load(Ordering::Relaxed), 0);
        assert!(p.set_option("lwksched-enable-rr", Some("100")).is_ok());
        assert_eq!(
            p.enable_rr.load(Ordering::Relaxed) as u64,
            msecs_to_ticks(100)
        );
    }

    #[test]
    fn disable_setaffinity_stores_errno() {
        let p = proc();
        assert!(p
            .set_option("lwksched-disable-setaffinity", Some("22"))
            .is_ok());
        assert_eq!(p.setaffinity_errno(), Some(22));
        assert_eq!(
            p.set_option("lwksched-disable-setaffinity", Some("-1")),
            Err(Error::ConfigInvalid)
        );
    }

    #[test]
    fn util_threshold_parses_pair() {
        let p = proc();
        assert!(p.set_option("util-threshold", Some("4:2")).is_ok());
        assert_eq!(p.max_cpus_for_util.load(Ordering::Relaxed), 4);
        assert_eq!(p.max_util_threads_per_cpu.load(Ordering::Relaxed), 2);
        assert_eq!(
            p.set_option("util-threshold", Some("42")),
            Err(Error::ConfigInvalid)
        );
    }

    #[test]
    fn overcommit_behavior_accepts_known_values() {
        let p = proc();
        assert!(p.set_option("overcommit-behavior", Some("0")).is_ok());
        assert_eq!(p.overcommit_behavior(), CommitScope::AllCommits);
        assert_eq!(
            p.set_option("overcommit-behavior", Some("3")),
            Err(Error::ConfigInvalid)
        );
    }

    #[test]
    fn unknown_option_rejected() {
        let p = proc();
        assert_eq!(
            p.set_option("no-such-option", None),
            Err(Error::ConfigInvalid)
        );
    }
}
