//! Per-table-space allocation state of the "blocks" manager (in memory only).
//!
//! Свободное место таблицы:
//! - fresh area [fresh_pos, fresh_limit): хвост текущего file block, выдаётся последовательно;
//! - lookup: освобождённые фрагменты pos -> units (first-fit), ограничен по ёмкости.
//! Всё в scale units.

use std::collections::BTreeMap;

#[derive(Debug)]
pub struct TableSpace {
    space_id: u32,
    fresh_pos: u64,
    fresh_limit: u64,
    lookup: BTreeMap<u64, u64>,
    capacity: usize,
    initialised: bool,
}

impl TableSpace {
    pub fn new(space_id: u32, capacity: usize) -> Self {
        Self {
            space_id,
            fresh_pos: 0,
            fresh_limit: 0,
            lookup: BTreeMap::new(),
            capacity: capacity.max(2),
            initialised: false,
        }
    }

    pub fn space_id(&self) -> u32 {
        self.space_id
    }

    pub fn is_initialised(&self) -> bool {
        self.initialised
    }

    pub fn set_initialised(&mut self) {
        self.initialised = true;
    }

    pub fn fresh_area(&self) -> (u64, u64) {
        (self.fresh_pos, self.fresh_limit)
    }

    pub fn fresh_units(&self) -> u64 {
        self.fresh_limit - self.fresh_pos
    }

    pub fn lookup_len(&self) -> usize {
        self.lookup.len()
    }

    pub fn lookup_units(&self) -> u64 {
        self.lookup.values().sum()
    }

    pub fn is_over_capacity(&self) -> bool {
        self.lookup.len() > self.capacity
    }

    /// First fit from freed fragments, then from the fresh area.
    pub fn try_allocate(&mut self, units: u64) -> Option<u64> {
        let hit = self
            .lookup
            .iter()
            .find(|(_, &n)| n >= units)
            .map(|(&p, &n)| (p, n));
        if let Some((p, n)) = hit {
            self.lookup.remove(&p);
            if n > units {
                self.lookup.insert(p + units, n - units);
            }
            return Some(p);
        }
        self.try_allocate_fresh(units)
    }

    /// Fresh area only (allocator metadata must stay block-aligned).
    pub fn try_allocate_fresh(&mut self, units: u64) -> Option<u64> {
        if self.fresh_limit - self.fresh_pos >= units {
            let p = self.fresh_pos;
            self.fresh_pos += units;
            return Some(p);
        }
        None
    }

    /// New file block(s) [start, limit) for this space. Contiguous blocks extend the
    /// fresh area; otherwise the old remainder goes to the lookup.
    pub fn add_file_block(&mut self, start: u64, limit: u64) {
        if start == self.fresh_limit && self.fresh_limit != 0 {
            self.fresh_limit = limit;
            return;
        }
        if self.fresh_limit > self.fresh_pos {
            self.lookup
                .insert(self.fresh_pos, self.fresh_limit - self.fresh_pos);
        }
        self.fresh_pos = start;
        self.fresh_limit = limit;
    }

    /// Set the fresh area directly (initialisation from the directory).
    pub fn set_fresh_area(&mut self, start: u64, limit: u64) {
        self.fresh_pos = start;
        self.fresh_limit = limit;
    }

    pub fn release(&mut self, pos: u64, units: u64) {
        if units == 0 {
            return;
        }
        if pos + units == self.fresh_pos {
            self.fresh_pos = pos;
            return;
        }
        self.lookup.insert(pos, units);
    }

    /// Merge adjacent fragments in place.
    pub fn compact(&mut self) {
        let mut merged: BTreeMap<u64, u64> = BTreeMap::new();
        let mut cur: Option<(u64, u64)> = None;
        for (&p, &n) in &self.lookup {
            cur = match cur {
                Some((cp, cn)) if cp + cn == p => Some((cp, cn + n)),
                Some(c) => {
                    merged.insert(c.0, c.1);
                    Some((p, n))
                }
                None => Some((p, n)),
            };
        }
        if let Some((p, n)) = cur {
            merged.insert(p, n);
        }
        self.lookup = merged;
    }

    /// True when the lookup is still above half its capacity after compaction.
    pub fn needs_flush(&mut self) -> bool {
        if !self.is_over_capacity() {
            return false;
        }
        self.compact();
        self.lookup.len() >= self.capacity / 2
    }

    /// Take all freed fragments (to be returned to the bitmaps).
    pub fn drain_lookup(&mut self) -> Vec<(u64, u64)> {
        std::mem::take(&mut self.lookup).into_iter().collect()
    }

    /// Take everything this space holds: fragments plus the unused fresh area.
    pub fn drain_all(&mut self) -> Vec<(u64, u64)> {
        let mut out = self.drain_lookup();
        if self.fresh_limit > self.fresh_pos {
            out.push((self.fresh_pos, self.fresh_limit - self.fresh_pos));
        }
        self.fresh_pos = 0;
        self.fresh_limit = 0;
        self.initialised = false;
        out
    }
}
