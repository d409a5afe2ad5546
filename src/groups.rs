//! Utility-group registry.
//!
//! An opaque user-supplied key binds a set of utility threads to one
//! remembered topology anchor. The table is tiny and bounded, so it is
//! a fixed array behind one global spinlock rather than a map.
//!
//! Locking contract: when placement must both observe and populate a
//! new entry, the registry lock is held across the whole placement
//! search so two concurrent clones with the same key cannot create
//! divergent anchors. The guard type below makes that explicit.

use spin::{Mutex, MutexGuard};

use crate::kinfo;
use crate::kwarn_once;
use crate::topology::CpuTopology;

/// Maximum number of simultaneously active utility thread groups.
pub const UTIL_GROUP_LIMIT: usize = 4;

#[derive(Clone, Copy)]
pub struct GroupEntry {
    /// Grouping key; 0 marks a free slot.
    pub key: u64,
    pub refcount: u32,
    pub topology: CpuTopology,
}

impl GroupEntry {
    const fn free() -> Self {
        Self {
            key: 0,
            refcount: 0,
            topology: CpuTopology::unknown(),
        }
    }
}

/// Registry guard held while a new entry is pending.
pub type GroupsGuard<'a> = MutexGuard<'a, [GroupEntry; UTIL_GROUP_LIMIT]>;

pub struct UtilGroups {
    entries: Mutex<[GroupEntry; UTIL_GROUP_LIMIT]>,
}

impl UtilGroups {
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new([GroupEntry::free(); UTIL_GROUP_LIMIT]),
        }
    }

    pub fn lock(&self) -> GroupsGuard<'_> {
        self.entries.lock()
    }

    /// Take a reference on an existing entry and return its anchor.
    pub fn find_and_get(guard: &mut GroupsGuard<'_>, key: u64) -> Option<CpuTopology> {
        for e in guard.iter_mut() {
            if e.key == key {
                e.refcount += 1;
                return Some(e.topology);
            }
        }
        None
    }

    /// Populate a free slot for a key that was not found. Returns false
    /// when every slot is taken.
    pub fn store(guard: &mut GroupsGuard<'_>, key: u64, topology: CpuTopology) -> bool {
        for e in guard.iter_mut() {
            if e.key == 0 {
                if e.refcount != 0 {
                    kwarn_once!("unexpected non-zero refcount={}", e.refcount);
                }
                e.key = key;
                e.refcount += 1;
                e.topology = topology;
                return true;
            }
        }
        kwarn_once!("no utility thread key slots available");
        false
    }

    /// Drop one reference; the slot is freed at refcount zero.
    pub fn put(&self, key: u64) {
        let mut entries = self.entries.lock();
        for e in entries.iter_mut() {
            if e.key == key {
                e.refcount -= 1;
                if e.refcount == 0 {
                    e.key = 0;
                }
                break;
            }
        }
    }

    /// Live entries, for the end-of-job summary and tests.
    pub fn snapshot(&self) -> [GroupEntry; UTIL_GROUP_LIMIT] {
        *self.entries.lock()
    }

    /// Log live keys at high stats verbosity.
    pub fn log_live_entries(&self) {
        let entries = self.entries.lock();
        for e in entries.iter() {
            if e.key != 0 {
                kinfo!("UTI key={} refcount={}", e.key, e.refcount);
            }
        }
    }

    pub fn reset(&self) {
        *self.entries.lock() = [GroupEntry::free(); UTIL_GROUP_LIMIT];
    }
}

impl Default for UtilGroups {
    fn default() -> Self {
        Self::new()
    }
}
