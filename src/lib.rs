//! Lightweight-kernel companion scheduler core.
//!
//! A subset of the CPUs of a many-core machine is ceded to a user process
//! and scheduled by this crate; the remaining CPUs stay with the
//! general-purpose host scheduler. The core owns placement, enqueue/
//! dequeue, preemption, idle behaviour and the clone-time thread
//! assignment policy on those LWK CPUs.
//!
//! ## Architecture
//!
//! - Each CPU owns one priority-indexed run queue ([`runqueue`])
//!   and a pair of commit counters ([`percpu`]) that record which
//!   threads are accounted against it.
//! - The placement engine ([`placement`]) turns clone-time hints into
//!   a home CPU: topology-aware matching with a relaxation ladder,
//!   exclusive reservations and a "push utility threads aside"
//!   rebalancing pass.
//! - The scheduler-class adapter ([`adapter`]) is the set of hooks the
//!   host core scheduler invokes: enqueue, dequeue, yield, pick-next,
//!   tick, fork, select-task-rq and the assimilation protocol that
//!   converts arbitrary tasks arriving on an LWK CPU into LWK tasks.
//! - The idle driver ([`idle`]) parks an LWK CPU in a shallow or deep
//!   low-power state depending on whether the CPU currently has an
//!   owning process.
//!
//! ## Lock hierarchy
//!
//! To avoid deadlocks, locks are acquired in this order:
//! 1. Task table
//! 2. Utility-group registry
//! 3. Per-process moveable-utility list
//! 4. Per-CPU run queue / commit counters
//! 5. Per-CPU atomics (statistics, flags)

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod adapter;
pub mod attr;
pub mod cpuset;
pub mod groups;
pub mod idle;
pub mod percpu;
pub mod placement;
pub mod process;
pub mod runqueue;
pub mod sched;
pub mod stats;
pub mod table;
pub mod task;
pub mod topology;
pub mod types;

// Re-export the types a host embedding needs day to day.
pub use attr::{CloneAttr, CloneHints, CloneResult};
pub use cpuset::{CpuSet, NodeSet, MAX_CPUS, MAX_NODES};
pub use idle::{IdleCaps, IdleUnit};
pub use process::LwkProcess;
pub use sched::LwkSched;
pub use table::Pid;
pub use task::{SchedClass, Task, ThreadType};
pub use topology::{CpuTopology, Topology};
pub use types::{CommitScope, Error, SchedPolicy};

#[doc(hidden)]
pub use log;

#[macro_export]
macro_rules! kfatal {
    ($($arg:tt)*) => {{
        $crate::log::error!(target: "lwk-sched", $($arg)*);
    }};
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        $crate::log::error!(target: "lwk-sched", $($arg)*);
    }};
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        $crate::log::warn!(target: "lwk-sched", $($arg)*);
    }};
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        $crate::log::info!(target: "lwk-sched", $($arg)*);
    }};
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{
        $crate::log::debug!(target: "lwk-sched", $($arg)*);
    }};
}

#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        $crate::log::trace!(target: "lwk-sched", $($arg)*);
    }};
}

/// Emit a warning at most once per call site.
#[macro_export]
macro_rules! kwarn_once {
    ($($arg:tt)*) => {{
        static WARNED: ::core::sync::atomic::AtomicBool =
            ::core::sync::atomic::AtomicBool::new(false);
        if !WARNED.swap(true, ::core::sync::atomic::Ordering::Relaxed) {
            $crate::kwarn!($($arg)*);
        }
    }};
}
