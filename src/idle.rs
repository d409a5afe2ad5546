//! LWK idle driver.
//!
//! Each LWK CPU runs a dedicated idle task in a cooperative loop. The
//! loop selects a shallow low-power hint while the CPU belongs to a
//! running LWK process and a deep one otherwise, then parks the CPU
//! through an [`IdleUnit`]. Two units exist: the instruction-issuing
//! monitor/mwait one and a portable halt-equivalent.

use alloc::format;
use core::sync::atomic::{fence, Ordering};

use crate::cpuset::CpuSet;
use crate::sched::LwkSched;
use crate::task::{SchedClass, Task, ThreadType};
use crate::types::{SchedPolicy, LWK_IDLE_PRIO};
use crate::{kerror, kinfo, ktrace};

/// Hint word flag: mwait usable with this hint.
pub const MWAIT_ENABLED: u32 = 0x8000_0000;
/// Hint word flag: entering this state flushes the TLBs, so the host
/// must drop lazy mm state first.
pub const TLBS_FLUSHED: u32 = 0x4000_0000;

/// The C-state hint bits handed to mwait.
#[inline]
pub const fn mwait_hint(word: u32) -> u32 {
    word & 0xff
}

/// Low-power hint words supported by the processor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IdleCaps {
    /// Shallowest supported sleep; used while a process owns the CPU.
    pub shallow: u32,
    /// Deepest supported sleep; used while the CPU is unowned.
    pub deep: u32,
}

impl IdleCaps {
    /// No mwait support; the idle units fall back to halt.
    pub const fn disabled() -> Self {
        Self { shallow: 0, deep: 0 }
    }

    pub(crate) fn log(&self) {
        if self.shallow & MWAIT_ENABLED != 0 {
            kinfo!(
                "idle mwait enabled, hints min/max={:08x}/{:08x}",
                self.shallow,
                self.deep
            );
        } else {
            kinfo!("idle halt enabled, not using mwait");
        }
    }

    /// Probe the mwait extensions: the shallowest and the deepest
    /// C-state the processor advertises.
    #[cfg(target_arch = "x86_64")]
    pub fn probe() -> Self {
        const CPUID_MWAIT_LEAF: u32 = 5;
        const ECX_EXTENSIONS_SUPPORTED: u32 = 1 << 0;
        const ECX_INTERRUPT_BREAK: u32 = 1 << 1;
        const SUBSTATE_MASK: u32 = 0xf;

        let leaf = unsafe { core::arch::x86_64::__cpuid(CPUID_MWAIT_LEAF) };
        let substates = leaf.edx;
        if leaf.ecx & ECX_EXTENSIONS_SUPPORTED == 0
            || leaf.ecx & ECX_INTERRUPT_BREAK == 0
            || substates == 0
        {
            crate::kwarn!("mwait not supported by processor, idle halt enabled");
            return Self::disabled();
        }

        let mut caps = Self::disabled();
        let mut found_first = false;
        for cstate_hint in 0u32..7 {
            let num_substates = (substates >> ((cstate_hint + 1) * 4)) & SUBSTATE_MASK;
            if num_substates == 0 {
                continue;
            }
            if !found_first {
                found_first = true;
                caps.shallow = (cstate_hint << 4) | MWAIT_ENABLED;
            }
            caps.deep = (cstate_hint << 4) | (num_substates - 1) | MWAIT_ENABLED;
            if cstate_hint > 0 {
                caps.deep |= TLBS_FLUSHED;
            }
        }
        caps
    }
}

/// Park the CPU for one quantum.
///
/// Implementations must wake on interrupts and should double-check
/// `need_resched` after arming any monitor facility.
pub trait IdleUnit {
    fn idle(&mut self, hint: u32, need_resched: &mut dyn FnMut() -> bool);
}

/// Portable halt-equivalent idle unit.
pub struct HaltUnit;

impl IdleUnit for HaltUnit {
    fn idle(&mut self, _hint: u32, need_resched: &mut dyn FnMut() -> bool) {
        #[cfg(target_arch = "x86_64")]
        {
            x86_64::instructions::interrupts::disable();
            if !need_resched() {
                // Re-enable and halt the CPU in one step so the wakeup
                // interrupt cannot slip in between.
                x86_64::instructions::interrupts::enable_and_hlt();
            } else {
                x86_64::instructions::interrupts::enable();
            }
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            if !need_resched() {
                core::hint::spin_loop();
            }
        }
    }
}

/// Instruction-issuing idle unit: monitor/mwait with interrupt break.
#[cfg(target_arch = "x86_64")]
pub struct MwaitUnit {
    monitor_line: core::sync::atomic::AtomicU32,
}

#[cfg(target_arch = "x86_64")]
impl MwaitUnit {
    pub const fn new() -> Self {
        Self {
            monitor_line: core::sync::atomic::AtomicU32::new(0),
        }
    }
}

#[cfg(target_arch = "x86_64")]
impl Default for MwaitUnit {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_arch = "x86_64")]
impl IdleUnit for MwaitUnit {
    fn idle(&mut self, hint: u32, need_resched: &mut dyn FnMut() -> bool) {
        if hint & MWAIT_ENABLED == 0 {
            HaltUnit.idle(hint, need_resched);
            return;
        }
        let eax = mwait_hint(hint) as u64;
        // ecx bit 0: break on interrupt even with interrupts masked.
        let ecx: u64 = 1;
        x86_64::instructions::interrupts::disable();
        unsafe {
            core::arch::asm!(
                "monitor",
                in("rax") &self.monitor_line as *const _ as u64,
                in("rcx") 0u64,
                in("rdx") 0u64,
            );
        }
        if !need_resched() {
            unsafe {
                core::arch::asm!("mwait", in("rax") eax, in("rcx") ecx);
            }
        }
        x86_64::instructions::interrupts::enable();
    }
}

impl LwkSched {
    /// Kick a CPU that may be parked in its idle loop so it re-reads
    /// the owner and LWK flags.
    pub fn wake_if_idle(&self, cpu: usize) {
        self.cpus[cpu].set_need_resched();
    }

    /// Set up and launch a CPU's idle task.
    ///
    /// When the task already exists it is only kicked, so a CPU parked
    /// in a deep sleep comes back to a shallow state for the process
    /// about to launch.
    pub fn prepare_idle(&self, cpu: usize) {
        let mcpu = &self.cpus[cpu];
        if mcpu.idle_pid().is_some() {
            self.wake_if_idle(cpu);
            return;
        }
        let pid = self.alloc_pid();
        let comm = format!("lwk_idle/{}", cpu);
        let mut task = Task::new(
            pid,
            pid,
            &comm,
            SchedClass::Fair,
            SchedPolicy::Normal,
            LWK_IDLE_PRIO,
            CpuSet::from_cpus(&[cpu]),
        );
        task.cpu = cpu;
        mcpu.idle_pid.store(pid, Ordering::Release);
        if self.tasks.lock().insert(task).is_err() {
            kerror!("(!) idle task create failure for cpu={}", cpu);
            mcpu.idle_pid.store(0, Ordering::Release);
            return;
        }
        ktrace!("idle init cpu={}", cpu);
        // Waking on the designated CPU sends the task through the
        // assimilation flow; it wedges itself in at the lowest queue
        // slot as the new idle entity.
        if self.wake_task(pid).is_err() {
            kerror!("(!) idle task wake failure for cpu={}", cpu);
        }
    }

    /// Body of a CPU's idle task.
    ///
    /// Runs until the CPU stops being an LWK CPU. `schedule` is called
    /// whenever a reschedule was requested; the host parks us again
    /// once nothing is runnable.
    pub fn idle_loop<U: IdleUnit + ?Sized>(
        &self,
        cpu: usize,
        unit: &mut U,
        mut schedule: impl FnMut(),
    ) {
        let mcpu = &self.cpus[cpu];
        // Pairs with the barrier in deactivation.
        fence(Ordering::SeqCst);
        while mcpu.is_lwk() {
            while !mcpu.need_resched() && mcpu.is_lwk() {
                let hint = if mcpu.owner() != 0 {
                    mcpu.shallow_sleep_mwait
                } else {
                    mcpu.deep_sleep_mwait
                };
                let mut wake = || mcpu.need_resched() || !mcpu.is_lwk();
                unit.idle(hint, &mut wake);
            }
            mcpu.clear_need_resched();
            schedule();
            fence(Ordering::SeqCst);
        }
        // Exiting: drop the special idle treatment so the task can be
        // stopped like any other kthread.
        if let Some(pid) = mcpu.idle_pid() {
            let mut tasks = self.tasks.lock();
            if let Some(task) = tasks.get_mut(pid) {
                task.lwk.thread_type = ThreadType::Guest;
            }
        }
    }
}
