//! Per-CPU topology facts.
//!
//! The host supplies cache and NUMA layout once at construction; the
//! scheduler only ever reads it. A cache or core domain is identified by
//! the first CPU id sharing that domain, so equal ids mean "same
//! domain" without a separate namespace per level.

use alloc::vec::Vec;

use crate::cpuset::CpuSet;

/// Immutable topology record for one CPU. Unknown fields are -1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuTopology {
    /// NUMA domain id.
    pub numa_id: i32,
    /// First CPU id among this CPU's hyperthread siblings.
    pub core_id: i32,
    /// First CPU id sharing the L1 cache.
    pub l1c_id: i32,
    /// First CPU id sharing the L2 cache.
    pub l2c_id: i32,
    /// First CPU id sharing the L3 cache.
    pub l3c_id: i32,
    /// Position of this CPU within its sibling mask.
    pub thread_index: i32,
}

impl CpuTopology {
    pub const fn unknown() -> Self {
        Self {
            numa_id: -1,
            core_id: -1,
            l1c_id: -1,
            l2c_id: -1,
            l3c_id: -1,
            thread_index: -1,
        }
    }
}

/// Topology facts for every present CPU.
#[derive(Clone, Debug)]
pub struct Topology {
    cpus: Vec<CpuTopology>,
}

impl Topology {
    /// Build from raw per-CPU masks as delivered by the host's topology
    /// query: a NUMA id, the hyperthread sibling mask and the
    /// shared-CPU map of each cache level.
    pub fn from_masks(
        numa_ids: &[i32],
        siblings: &[CpuSet],
        l1_shared: &[CpuSet],
        l2_shared: &[CpuSet],
        l3_shared: &[CpuSet],
    ) -> Self {
        let n = numa_ids.len();
        let mut cpus = Vec::with_capacity(n);
        for cpu in 0..n {
            let mut t = CpuTopology::unknown();
            t.numa_id = numa_ids[cpu];
            if let Some(first) = siblings.get(cpu).and_then(|m| m.first_set()) {
                // The core id is the first CPU id in the sibling list;
                // the thread index is this CPU's position within it.
                t.core_id = first as i32;
                t.thread_index = siblings[cpu].iter().take_while(|&c| c != cpu).count() as i32;
            }
            t.l1c_id = l1_shared
                .get(cpu)
                .and_then(|m| m.first_set())
                .map_or(-1, |c| c as i32);
            t.l2c_id = l2_shared
                .get(cpu)
                .and_then(|m| m.first_set())
                .map_or(-1, |c| c as i32);
            t.l3c_id = l3_shared
                .get(cpu)
                .and_then(|m| m.first_set())
                .map_or(-1, |c| c as i32);
            cpus.push(t);
        }
        Self { cpus }
    }

    /// Synthetic symmetric machine: `num_cpus` CPUs split into equal
    /// L2 tiles, L3 complexes and NUMA domains. Each CPU is its own
    /// core and L1 (no hyperthreading).
    pub fn symmetric(num_cpus: usize, cpus_per_l2: usize, cpus_per_l3: usize, cpus_per_node: usize) -> Self {
        let mut cpus = Vec::with_capacity(num_cpus);
        for cpu in 0..num_cpus {
            let tile = |per: usize| -> i32 {
                if per == 0 {
                    cpu as i32
                } else {
                    (cpu - cpu % per) as i32
                }
            };
            cpus.push(CpuTopology {
                numa_id: tile(cpus_per_node),
                core_id: cpu as i32,
                l1c_id: cpu as i32,
                l2c_id: tile(cpus_per_l2),
                l3c_id: tile(cpus_per_l3),
                thread_index: 0,
            });
        }
        Self { cpus }
    }

    /// Flat single-domain machine; every topology request beyond
    /// FirstAvailable degenerates.
    pub fn flat(num_cpus: usize) -> Self {
        Self::symmetric(num_cpus, num_cpus, num_cpus, num_cpus)
    }

    pub fn num_cpus(&self) -> usize {
        self.cpus.len()
    }

    pub fn cpu(&self, cpu: usize) -> &CpuTopology {
        &self.cpus[cpu]
    }
}
