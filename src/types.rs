//! Scheduler type definitions
//!
//! This module contains the scalar types, priority bands and constants
//! shared by the scheduler subsystem.

/// Timer frequency the tick accounting is based on (ticks per second).
pub const TICK_HZ: u64 = 1000;

/// Default timeslice is 100 msecs. Used when an LWK task has been enabled
/// for timeslicing.
pub const LWK_TIMESLICE: u32 = (100 * TICK_HZ / 1000) as u32;

/// Upper bound for a CPU commit counter. Counters saturate here; they
/// never wrap.
pub const COMMIT_MAX: i32 = i32::MAX;

/// Number of real-time priority levels surfaced to LWK tasks.
/// External RT priorities 1..=99 map onto internal 98..=0.
pub const MAX_RT_PRIO: i32 = 100;

/// One past the highest fair (nice-based) internal priority.
pub const MAX_PRIO: i32 = MAX_RT_PRIO + 40;

/// Internal priority band for LWK threads. High sits above every other
/// LWK thread, low below; both remain above guest tasks.
pub const LWK_HIGH_PRIO: i32 = 1;
pub const LWK_DEFAULT_PRIO: i32 = 49;
pub const LWK_LOW_PRIO: i32 = 98;

/// External (user-visible) RT priority installed on assimilated LWK
/// threads.
pub const LWK_DEFAULT_USER_PRIO: u32 = (MAX_RT_PRIO - 1 - LWK_DEFAULT_PRIO) as u32;

/// Sentinel priority carried by the per-CPU LWK idle task. It maps to
/// the dedicated idle queue slot below every other priority.
pub const LWK_IDLE_PRIO: i32 = MAX_PRIO;

/// Convert a nice value to the Linux-convention internal priority.
#[inline]
pub const fn nice_to_prio(nice: i8) -> i32 {
    MAX_RT_PRIO + 20 + nice as i32
}

/// Convert milliseconds into scheduler ticks, rounding down.
#[inline]
pub const fn msecs_to_ticks(ms: u64) -> u64 {
    ms * TICK_HZ / 1000
}

/// Convert scheduler ticks into milliseconds.
#[inline]
pub const fn ticks_to_msecs(ticks: u64) -> u64 {
    ticks * 1000 / TICK_HZ
}

/// Weight for nice value 0 (base weight).
pub const NICE_0_WEIGHT: u64 = 1024;

/// Precomputed weights for nice values -20 to +19.
/// Formula: weight = 1024 * 1.25^(-nice).
pub const NICE_TO_WEIGHT: [u64; 40] = [
    // -20 to -11
    88761, 71755, 56483, 46273, 36291, 29154, 23254, 18705, 14949, 11916,
    // -10 to -1
    9548, 7620, 6100, 4904, 3906, 3121, 2501, 1991, 1586, 1277,
    // 0 to 9
    1024, 820, 655, 526, 423, 335, 272, 215, 172, 137,
    // 10 to 19
    110, 87, 70, 56, 45, 36, 29, 23, 18, 15,
];

/// Inverse weights (2^32 / weight) matching `NICE_TO_WEIGHT`, used when
/// handing a task back to the host fair class.
pub const NICE_TO_WMULT: [u32; 40] = [
    // -20 to -11
    48388, 59856, 76040, 92818, 118348, 147320, 184698, 229616, 287308, 360437,
    // -10 to -1
    449829, 563644, 704093, 875809, 1099582, 1376151, 1717300, 2157191, 2708050, 3363326,
    // 0 to 9
    4194304, 5237765, 6557202, 8165337, 10153587, 12820798, 15790321, 19976592, 24970740,
    31350126,
    // 10 to 19
    39045157, 49367440, 61356676, 76695844, 95443717, 119304647, 148102320, 186737708,
    238609294, 286331153,
];

/// Get weight for a nice value (-20 to +19).
#[inline]
pub const fn nice_to_weight(nice: i8) -> u64 {
    let idx = nice as i32 + 20;
    let idx = if idx < 0 {
        0
    } else if idx > 39 {
        39
    } else {
        idx as usize
    };
    NICE_TO_WEIGHT[idx]
}

/// Get the inverse weight for a nice value (-20 to +19).
#[inline]
pub const fn nice_to_wmult(nice: i8) -> u32 {
    let idx = nice as i32 + 20;
    let idx = if idx < 0 {
        0
    } else if idx > 39 {
        39
    } else {
        idx as usize
    };
    NICE_TO_WMULT[idx]
}

/// Scheduling policy carried by a task.
///
/// LWK threads surface `Fifo` (or `Rr` when timeslicing is enabled) so
/// runtimes and tools keep working; host tasks keep whatever policy the
/// host gave them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedPolicy {
    Normal,
    Batch,
    Idle,
    Fifo,
    Rr,
    Deadline,
}

/// Which commit counters are considered when searching for the least
/// committed CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CommitScope {
    AllCommits = 0,
    OnlyComputeCommits = 1,
    OnlyUtilityCommits = 2,
}

impl CommitScope {
    /// Parse the numeric form accepted on the configuration channel.
    pub fn from_config(v: i32) -> Option<Self> {
        match v {
            0 => Some(CommitScope::AllCommits),
            1 => Some(CommitScope::OnlyComputeCommits),
            2 => Some(CommitScope::OnlyUtilityCommits),
            _ => None,
        }
    }
}

/// How many CPUs a utility thread may be affinitized to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CpusPerUtil {
    Multiple = 0,
    One = 1,
}

/// Search direction over the process's LWK CPU sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchOrder {
    Forward,
    Reverse,
}

/// A topology match request used by the placement engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchType {
    FirstAvail,
    SameCore,
    SameL1,
    SameL2,
    SameL3,
    SameDomain,
    OtherCore,
    OtherL1,
    OtherL2,
    OtherL3,
    OtherDomain,
    InNodeSet,
}

/// Errors surfaced by the scheduler core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// User-supplied configuration string malformed or out of range.
    ConfigInvalid,
    /// Unreadable or unwritable user buffer.
    UserFault,
    /// Conflicting placement or behaviour attribute bits.
    AttrConflict,
    /// Resource shortage; the operation was abandoned with prior state
    /// unchanged.
    AllocFail,
    /// No CPU matched even after full relaxation.
    PlacementUnsatisfiable,
    /// Behaviour bits outside the acceptable set.
    BehaviourUnacceptable,
    /// Uncommit observed a zero counter.
    CounterUnderflow,
    /// A task of an unrecognised scheduling class appeared on an LWK CPU.
    AssimilationUnexpected,
    /// No task with the requested pid.
    NoSuchTask,
}

impl Error {
    /// Kernel-style negative errno for the syscall surfaces.
    pub fn errno(self) -> i64 {
        match self {
            Error::ConfigInvalid | Error::AttrConflict => -22, // EINVAL
            Error::UserFault => -14,                           // EFAULT
            Error::AllocFail => -12,                           // ENOMEM
            Error::NoSuchTask => -3,                           // ESRCH
            Error::PlacementUnsatisfiable
            | Error::BehaviourUnacceptable
            | Error::CounterUnderflow
            | Error::AssimilationUnexpected => -22,
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            Error::ConfigInvalid => "invalid configuration value",
            Error::UserFault => "bad user-space address",
            Error::AttrConflict => "conflicting clone attributes",
            Error::AllocFail => "allocation failure",
            Error::PlacementUnsatisfiable => "no CPU satisfies the placement request",
            Error::BehaviourUnacceptable => "unacceptable behaviour attributes",
            Error::CounterUnderflow => "commit counter underflow",
            Error::AssimilationUnexpected => "unexpected task assimilation",
            Error::NoSuchTask => "no such task",
        };
        f.write_str(s)
    }
}
