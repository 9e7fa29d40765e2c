use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::consts::MAX_KEEP_PINS;

const NO_POS: u64 = u64::MAX;

/// Bookkeeping shared by every cached object: file position, cache flags,
/// pin counter and the per-row monitor.
///
/// Lock order: cache write lock, then `monitor`. Never the reverse.
#[derive(Debug)]
pub struct RowState {
    pos: AtomicU64,
    in_memory: AtomicBool,
    changed: AtomicBool,
    is_new: AtomicBool,
    keep: AtomicU32,
    access: AtomicU64,
    monitor: Mutex<()>,
}

impl Default for RowState {
    fn default() -> Self {
        Self {
            pos: AtomicU64::new(NO_POS),
            in_memory: AtomicBool::new(false),
            changed: AtomicBool::new(false),
            is_new: AtomicBool::new(false),
            keep: AtomicU32::new(0),
            access: AtomicU64::new(0),
            monitor: Mutex::new(()),
        }
    }
}

impl RowState {
    /// State of a row created in memory: new and dirty, no position yet.
    pub fn fresh() -> Self {
        let s = Self::default();
        s.is_new.store(true, Ordering::Relaxed);
        s.changed.store(true, Ordering::Relaxed);
        s
    }

    /// State of a row materialised from the file at `pos`.
    pub fn loaded(pos: u64) -> Self {
        let s = Self::default();
        s.pos.store(pos, Ordering::Relaxed);
        s
    }

    pub fn pos(&self) -> Option<u64> {
        match self.pos.load(Ordering::Acquire) {
            NO_POS => None,
            p => Some(p),
        }
    }

    pub fn set_pos(&self, pos: u64) {
        self.pos.store(pos, Ordering::Release);
    }

    pub fn is_in_memory(&self) -> bool {
        self.in_memory.load(Ordering::Acquire)
    }

    pub fn set_in_memory(&self, on: bool) {
        self.in_memory.store(on, Ordering::Release);
    }

    pub fn has_changed(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }

    pub fn set_changed(&self, on: bool) {
        self.changed.store(on, Ordering::Release);
    }

    pub fn is_new(&self) -> bool {
        self.is_new.load(Ordering::Acquire)
    }

    pub fn set_new(&self, on: bool) {
        self.is_new.store(on, Ordering::Release);
    }

    /// Pin (`true`) or unpin (`false`). Pinning fails past MAX_KEEP_PINS nested pins.
    pub fn keep_in_memory(&self, keep: bool) -> bool {
        if keep {
            self.keep
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |k| {
                    (k < MAX_KEEP_PINS).then_some(k + 1)
                })
                .is_ok()
        } else {
            self.keep
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |k| k.checked_sub(1))
                .is_ok()
        }
    }

    pub fn is_kept(&self) -> bool {
        self.keep.load(Ordering::Acquire) > 0
    }

    /// Access count tracked by the row itself (bumped by sessions that use it).
    pub fn access_count(&self) -> u64 {
        self.access.load(Ordering::Relaxed)
    }

    pub fn update_access_count(&self, count: u64) {
        self.access.fetch_max(count, Ordering::Relaxed);
    }

    pub fn rebase_access_count(&self, floor: u64) {
        let _ = self
            .access
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |a| {
                Some(a.saturating_sub(floor))
            });
    }

    /// Per-row monitor (poison is ignored: the guarded data is `()`).
    pub fn monitor(&self) -> MutexGuard<'_, ()> {
        self.monitor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pins_are_bounded_and_nested() {
        let s = RowState::loaded(8);
        assert!(!s.is_kept());
        for _ in 0..MAX_KEEP_PINS {
            assert!(s.keep_in_memory(true));
        }
        assert!(!s.keep_in_memory(true));
        for _ in 0..MAX_KEEP_PINS {
            assert!(s.is_kept());
            assert!(s.keep_in_memory(false));
        }
        assert!(!s.is_kept());
        assert!(!s.keep_in_memory(false));
    }

    #[test]
    fn fresh_row_has_no_position() {
        let s = RowState::fresh();
        assert_eq!(s.pos(), None);
        assert!(s.is_new() && s.has_changed());
        s.set_pos(0);
        assert_eq!(s.pos(), Some(0));
    }
}
