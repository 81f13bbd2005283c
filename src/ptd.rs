//! Per-task data keys (spec.md §6 `alloc_ptdkey`/`free_ptdkey`/`set_ptd`/
//! `get_ptd`, bounded by `ROOT_NPTDKEYS`).
//!
//! Task scheduling itself is out of scope (spec.md §1 Non-goals), so "task"
//! here is whatever opaque id the embedding kernel already uses for its
//! tasks; this module only owns the `(task, key) -> value` table. Backed by
//! `hashbrown`, the same no_std hash map the teacher pulls in for its own
//! associative tables.

use hashbrown::HashMap;
use pipeline_error::PipelineError;
use pipeline_sync::SpinLock;

/// Matches the original implementation's fixed per-task key budget; chosen
/// as a reasonable default for a reimplementation, not load-bearing on any
/// wire format.
pub const ROOT_NPTDKEYS: usize = 32;

pub struct PtdTable {
    used_keys: SpinLock<[bool; ROOT_NPTDKEYS]>,
    values: SpinLock<HashMap<(usize, usize), usize>>,
}

impl PtdTable {
    pub fn new() -> Self {
        Self {
            used_keys: SpinLock::new([false; ROOT_NPTDKEYS]),
            values: SpinLock::new(HashMap::new()),
        }
    }

    pub fn alloc_ptdkey(&self) -> Result<usize, PipelineError> {
        let mut used = self.used_keys.lock();
        let key = used
            .iter()
            .position(|&taken| !taken)
            .ok_or(PipelineError::NoSlots)?;
        used[key] = true;
        Ok(key)
    }

    pub fn free_ptdkey(&self, key: usize) -> Result<(), PipelineError> {
        let mut used = self.used_keys.lock();
        let slot = used.get_mut(key).ok_or(PipelineError::InvalidArgument)?;
        if !*slot {
            return Err(PipelineError::NotFound);
        }
        *slot = false;
        drop(used);
        self.values.lock().retain(|&(_, k), _| k != key);
        Ok(())
    }

    pub fn set_ptd(&self, task: usize, key: usize, value: usize) -> Result<(), PipelineError> {
        if !self.used_keys.lock().get(key).copied().unwrap_or(false) {
            return Err(PipelineError::InvalidArgument);
        }
        self.values.lock().insert((task, key), value);
        Ok(())
    }

    pub fn get_ptd(&self, task: usize, key: usize) -> Option<usize> {
        self.values.lock().get(&(task, key)).copied()
    }
}

impl Default for PtdTable {
    fn default() -> Self {
        Self::new()
    }
}
