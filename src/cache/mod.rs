//! Row cache: position -> cached object, bounded by row count and bytes.
//!
//! Design:
//! - HashMap<pos, Entry>; каждая запись несёт свой счётчик доступа (AtomicU64),
//!   поэтому `get` работает под read-локом владельца.
//! - Вытеснение ("clean up") не ведёт точный LRU: считается приблизительный
//!   потолок счётчиков (rank::access_ceiling), всё холоднее потолка уходит.
//! - Грязные строки перед удалением всегда отдаются `RowSaver` пачками,
//!   отсортированными по позиции.
//! - Закреплённые (keep_in_memory) строки не трогаются вообще.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use log::{debug, trace};

use crate::consts::{ACCESS_MAX, CACHE_SAVE_BATCH, INIT_IO_BUFFER_SIZE};
use crate::error::StorageError;
use crate::metrics::{record_cache_cleanup, record_cache_evictions, record_cache_rebase};
use crate::row::{require_pos, RowRef};

pub mod rank;

/// Save path used by the cache for dirty rows (eviction and save_all).
/// Rows arrive sorted by position; the saver clears their `changed`/`new` flags.
pub trait RowSaver {
    fn save_rows(&mut self, rows: &[RowRef]) -> Result<()>;
}

struct Entry {
    row: RowRef,
    access: AtomicU64,
}

pub struct RowCache {
    map: HashMap<u64, Entry>,
    cap_rows: usize,
    cap_bytes: u64,
    total_bytes: u64,
    access_count: AtomicU64,
    floor: AtomicU64,
    rebase_lock: Mutex<()>,
}

impl RowCache {
    pub fn new(cap_rows: usize, cap_bytes: u64) -> Self {
        Self {
            map: HashMap::with_capacity(cap_rows.min(1 << 16)),
            cap_rows: cap_rows.max(1),
            cap_bytes: cap_bytes.max(1),
            total_bytes: 0,
            access_count: AtomicU64::new(0),
            floor: AtomicU64::new(0),
            rebase_lock: Mutex::new(()),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn capacity(&self) -> (usize, u64) {
        (self.cap_rows, self.cap_bytes)
    }

    pub fn contains(&self, pos: u64) -> bool {
        self.map.contains_key(&pos)
    }

    /// Cache-side access counter of a resident row.
    pub fn access_of(&self, pos: u64) -> Option<u64> {
        self.map.get(&pos).map(|e| e.access.load(Ordering::Relaxed))
    }

    fn next_access(&self) -> u64 {
        self.access_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Resident row, bumping its counter. Never touches the disk.
    pub fn get(&self, pos: u64) -> Option<RowRef> {
        self.maybe_rebase();
        let e = self.map.get(&pos)?;
        let a = self.next_access();
        e.access.store(a, Ordering::Relaxed);
        e.row.state().update_access_count(a);
        Some(e.row.clone())
    }

    /// Counters above ACCESS_MAX: raise entries to their row's own count,
    /// then shift everything down. Relative order is kept for entries above
    /// the shift; colder ones clamp to 0.
    fn maybe_rebase(&self) {
        if self.access_count.load(Ordering::Acquire) <= ACCESS_MAX {
            return;
        }
        let _g = match self.rebase_lock.try_lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        if self.access_count.load(Ordering::Acquire) <= ACCESS_MAX {
            return;
        }
        let count = self.access_count.load(Ordering::Acquire);
        let mut base = self.floor.load(Ordering::Acquire);
        if base == 0 {
            base = self
                .map
                .values()
                .map(|e| e.access.load(Ordering::Relaxed).max(e.row.state().access_count()))
                .min()
                .unwrap_or(count);
        }
        // старые закреплённые строки держат минимум у нуля: сдвиг не меньше
        // половины потолка, иначе счётчик так и останется выше ACCESS_MAX
        base = base.max(count.saturating_sub(ACCESS_MAX / 2));
        for e in self.map.values() {
            let a = e.access.load(Ordering::Relaxed).max(e.row.state().access_count());
            e.access.store(a.saturating_sub(base), Ordering::Relaxed);
            e.row.state().rebase_access_count(base);
        }
        let _ = self
            .access_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some(c.saturating_sub(base)));
        self.floor.store(0, Ordering::Release);
        record_cache_rebase();
        debug!("row cache: access counters rebased by {}", base);
    }

    fn exceeds(&self, size: u64) -> bool {
        self.map.len() + 1 > self.cap_rows || self.total_bytes + size > self.cap_bytes
    }

    /// Make room for one more row of `size` bytes.
    /// Escalation: clean up, drop unchanged rows, forced clean up, CacheFull.
    fn prepare_put(&mut self, size: u64, saver: &mut dyn RowSaver) -> Result<()> {
        if !self.exceeds(size) {
            return Ok(());
        }
        self.clean_up(false, saver)?;
        if !self.exceeds(size) {
            return Ok(());
        }
        self.clear_unchanged();
        if !self.exceeds(size) {
            return Ok(());
        }
        self.clean_up(true, saver)?;
        if !self.exceeds(size) {
            return Ok(());
        }
        Err(StorageError::CacheFull {
            rows: self.map.len(),
            bytes: self.total_bytes,
        }
        .into())
    }

    /// Insert (or overwrite) the entry at `row.pos()`, evicting first if needed.
    pub fn put(&mut self, row: RowRef, saver: &mut dyn RowSaver) -> Result<()> {
        self.maybe_rebase();
        let pos = require_pos(&*row)?;
        let size = row.storage_size() as u64;

        if self.map.contains_key(&pos) {
            let a = self.next_access();
            row.state().update_access_count(a);
            self.replace(pos, row);
            if let Some(e) = self.map.get(&pos) {
                e.access.store(a, Ordering::Relaxed);
            }
            return Ok(());
        }
        self.prepare_put(size, saver)?;

        let a = self.next_access();
        row.state().set_in_memory(true);
        row.state().update_access_count(a);
        self.total_bytes += size;
        self.map.insert(
            pos,
            Entry {
                row,
                access: AtomicU64::new(a),
            },
        );
        Ok(())
    }

    /// Remove without saving.
    pub fn release(&mut self, pos: u64) -> Option<RowRef> {
        let e = self.map.remove(&pos)?;
        self.total_bytes -= e.row.storage_size() as u64;
        e.row.state().set_in_memory(false);
        Some(e.row)
    }

    /// Drop every entry in [lo, hi) without saving; returns how many went.
    pub fn release_range(&mut self, lo: u64, hi: u64) -> usize {
        let dead: Vec<u64> = self
            .map
            .keys()
            .copied()
            .filter(|p| *p >= lo && *p < hi)
            .collect();
        for p in &dead {
            self.release(*p);
        }
        dead.len()
    }

    /// Swap the object at an existing position, keeping its access counter.
    pub fn replace(&mut self, pos: u64, row: RowRef) -> Option<RowRef> {
        let e = self.map.get_mut(&pos)?;
        let old = std::mem::replace(&mut e.row, row);
        self.total_bytes = self.total_bytes - old.storage_size() as u64 + e.row.storage_size() as u64;
        e.row.state().set_in_memory(true);
        if !Arc::ptr_eq(&old, &e.row) {
            old.state().set_in_memory(false);
        }
        Some(old)
    }

    /// Remove every resident row that is neither dirty nor pinned.
    pub fn clear_unchanged(&mut self) {
        let before = self.map.len();
        let mut freed = 0u64;
        self.map.retain(|_, e| {
            let _m = e.row.state().monitor();
            if e.row.is_kept() || e.row.has_changed() {
                return true;
            }
            e.row.state().set_in_memory(false);
            freed += e.row.storage_size() as u64;
            false
        });
        self.total_bytes -= freed;
        let n = before - self.map.len();
        record_cache_evictions(n);
        debug!("row cache: cleared {} unchanged rows", n);
    }

    /// Eviction pass. `forced` puts the ceiling above every counter.
    pub fn clean_up(&mut self, forced: bool, saver: &mut dyn RowSaver) -> Result<()> {
        record_cache_cleanup();
        let remove_count = self.map.len() / 2;
        let ceiling = if forced {
            self.access_count.load(Ordering::Acquire) + 1
        } else {
            let counts: Vec<u64> = self
                .map
                .values()
                .map(|e| e.access.load(Ordering::Relaxed))
                .collect();
            rank::access_ceiling(&counts, remove_count)
        };

        let mut batch: Vec<RowRef> = Vec::with_capacity(CACHE_SAVE_BATCH.min(self.map.len()));
        let mut evict: Vec<u64> = Vec::new();

        for (pos, e) in self.map.iter() {
            let row = &e.row;
            let _m = row.state().monitor();
            if row.is_kept() {
                continue;
            }
            let old_row = e.access.load(Ordering::Relaxed) < ceiling;
            let new_row =
                row.state().is_new() && row.storage_size() as usize >= INIT_IO_BUFFER_SIZE;
            if !(old_row || new_row) {
                continue;
            }
            if row.has_changed() {
                batch.push(row.clone());
                if batch.len() >= CACHE_SAVE_BATCH {
                    drop(_m);
                    save_sorted(&mut batch, saver)?;
                }
            }
            if old_row {
                evict.push(*pos);
            }
        }
        save_sorted(&mut batch, saver)?;

        for pos in &evict {
            if let Some(e) = self.map.remove(pos) {
                self.total_bytes -= e.row.storage_size() as u64;
                e.row.state().set_in_memory(false);
            }
        }
        record_cache_evictions(evict.len());

        let total = self.access_count.load(Ordering::Acquire);
        self.floor.store(ceiling.min(total), Ordering::Release);
        trace!(
            "row cache: clean_up forced={} ceiling={} evicted={} left={}",
            forced,
            ceiling,
            evict.len(),
            self.map.len()
        );
        Ok(())
    }

    /// Save every dirty row, sorted by position, in fixed-size batches.
    pub fn save_all(&mut self, saver: &mut dyn RowSaver) -> Result<()> {
        let mut dirty: Vec<RowRef> = self
            .map
            .values()
            .filter(|e| e.row.has_changed())
            .map(|e| e.row.clone())
            .collect();
        dirty.sort_by_key(|r| r.pos());
        for chunk in dirty.chunks(CACHE_SAVE_BATCH) {
            saver.save_rows(chunk)?;
        }
        Ok(())
    }

    /// Empty the cache; rows are not saved.
    pub fn clear(&mut self) {
        for e in self.map.values() {
            e.row.state().set_in_memory(false);
        }
        self.map.clear();
        self.total_bytes = 0;
        self.floor.store(0, Ordering::Release);
    }

    /// Resident positions (unordered).
    pub fn positions(&self) -> impl Iterator<Item = u64> + '_ {
        self.map.keys().copied()
    }
}

fn save_sorted(batch: &mut Vec<RowRef>, saver: &mut dyn RowSaver) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    batch.sort_by_key(|r| r.pos());
    saver.save_rows(&batch[..])?;
    batch.clear();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{BlobRow, CachedObject};

    struct NoSave;

    impl RowSaver for NoSave {
        fn save_rows(&mut self, _rows: &[RowRef]) -> Result<()> {
            Ok(())
        }
    }

    fn row_at(pos: u64) -> RowRef {
        let r: RowRef = BlobRow::new(vec![1; 16], 8);
        r.state().set_pos(pos);
        r
    }

    #[test]
    fn rebase_brings_counter_below_the_ceiling_with_a_pinned_cold_row() -> Result<()> {
        let mut cache = RowCache::new(16, 1 << 20);
        let cold = row_at(8);
        cache.put(cold.clone(), &mut NoSave)?;
        cache.put(row_at(16), &mut NoSave)?;
        assert!(cold.keep_in_memory(true));
        assert_eq!(cache.access_of(8), Some(1));

        cache.access_count.store(ACCESS_MAX + 10, Ordering::Release);
        for _ in 0..5 {
            assert!(cache.get(16).is_some());
        }
        let count = cache.access_count.load(Ordering::Acquire);
        assert!(count <= ACCESS_MAX, "counter {} still over the ceiling", count);
        assert!(cache.access_of(16) > cache.access_of(8));
        assert!(cold.state().access_count() <= count);

        // второй проход не нужен: следующие get не сканируют карту
        let before = count;
        assert!(cache.get(16).is_some());
        assert_eq!(cache.access_count.load(Ordering::Acquire), before + 1);
        cold.keep_in_memory(false);
        Ok(())
    }
}
