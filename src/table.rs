//! Task table.
//!
//! Slab of task control blocks with pid lookup. The whole table sits
//! behind one lock at the top of the lock hierarchy; per-CPU structures
//! are only ever taken underneath it.

use alloc::vec::Vec;

use crate::task::Task;
use crate::types::Error;

pub type Pid = u64;

/// Most tasks the table tracks at once.
pub const MAX_TASKS: usize = 1024;

/// Fixed-capacity task slab with linear pid lookup.
pub struct TaskTable {
    slots: Vec<Option<Task>>,
}

impl TaskTable {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_TASKS);
        slots.resize_with(MAX_TASKS, || None);
        Self { slots }
    }

    /// Insert a task; fails when the table is full or the pid exists.
    pub fn insert(&mut self, task: Task) -> Result<(), Error> {
        if self.get(task.pid).is_some() {
            return Err(Error::ConfigInvalid);
        }
        for slot in self.slots.iter_mut() {
            if slot.is_none() {
                *slot = Some(task);
                return Ok(());
            }
        }
        Err(Error::AllocFail)
    }

    pub fn remove(&mut self, pid: Pid) -> Option<Task> {
        for slot in self.slots.iter_mut() {
            if let Some(t) = slot {
                if t.pid == pid {
                    return slot.take();
                }
            }
        }
        None
    }

    pub fn get(&self, pid: Pid) -> Option<&Task> {
        self.slots
            .iter()
            .filter_map(|s| s.as_ref())
            .find(|t| t.pid == pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Task> {
        self.slots
            .iter_mut()
            .filter_map(|s| s.as_mut())
            .find(|t| t.pid == pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Task> {
        self.slots.iter_mut().filter_map(|s| s.as_mut())
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}
