//! Single free list for files without block metadata.
//!
//! - lookup: pos -> units, отсортирован по позиции, first-fit.
//! - при переполнении список сливается; если всё ещё полон, мелкие фрагменты
//!   выбрасываются и учитываются как потерянные (lost).
//! - список не сохраняется: при checkpoint его сумма уходит в заголовок как empty_size.

use std::collections::BTreeMap;

use anyhow::Result;
use log::debug;

use super::{to_units, DataSpaceManager};
use crate::consts::TABLE_ID_DEFAULT;
use crate::datafile::CacheCore;

pub struct SimpleSpaceManager {
    lookup: BTreeMap<u64, u64>,
    capacity: usize,
    lost_units: u64,
    scale: u32,
    file_block_size: u64,
}

impl SimpleSpaceManager {
    /// `lost_bytes` comes from the header (free space unknown after reopen).
    pub fn new(scale: u32, capacity: usize, lost_bytes: u64, file_block_size: u64) -> Self {
        Self {
            lookup: BTreeMap::new(),
            capacity: capacity.max(2),
            lost_units: lost_bytes / scale as u64,
            scale,
            file_block_size,
        }
    }

    pub fn free_list_len(&self) -> usize {
        self.lookup.len()
    }

    fn take(&mut self, units: u64) -> Option<u64> {
        let (p, n) = self
            .lookup
            .iter()
            .find(|(_, &n)| n >= units)
            .map(|(&p, &n)| (p, n))?;
        self.lookup.remove(&p);
        if n > units {
            self.lookup.insert(p + units, n - units);
        }
        Some(p)
    }

    fn compact(&mut self) {
        let mut merged = BTreeMap::new();
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

    fn shed(&mut self) {
        self.compact();
        if self.lookup.len() <= self.capacity {
            return;
        }
        let mut by_size: Vec<(u64, u64)> = self.lookup.iter().map(|(&p, &n)| (p, n)).collect();
        by_size.sort_by_key(|&(p, n)| (n, p));
        let drop_count = self.lookup.len() - self.capacity / 2;
        for &(p, n) in by_size.iter().take(drop_count) {
            self.lookup.remove(&p);
            self.lost_units += n;
        }
        debug!(
            "simple space: dropped {} small fragments, lost now {} units",
            drop_count, self.lost_units
        );
    }
}

impl DataSpaceManager for SimpleSpaceManager {
    fn allocate(&mut self, core: &mut CacheCore, _space_id: u32, size: u32) -> Result<u64> {
        let units = to_units(size as u64, self.scale);
        if let Some(p) = self.take(units) {
            return Ok(p);
        }
        core.enlarge_file_space(units * self.scale as u64)
    }

    fn release(&mut self, _core: &mut CacheCore, _space_id: u32, pos: u64, size: u32) -> Result<()> {
        let units = to_units(size as u64, self.scale);
        if units == 0 {
            return Ok(());
        }
        self.lookup.insert(pos, units);
        if self.lookup.len() > self.capacity {
            self.shed();
        }
        Ok(())
    }

    fn new_table_space_id(&mut self) -> u32 {
        TABLE_ID_DEFAULT
    }

    fn get_file_blocks(&mut self, core: &mut CacheCore, _space_id: u32, count: u32) -> Result<u64> {
        core.enlarge_file_space(count as u64 * self.file_block_size)
    }

    fn free_table_space(&mut self, _core: &mut CacheCore, _space_id: u32) -> Result<()> {
        Ok(())
    }

    fn find_table_space(&mut self, _core: &mut CacheCore, _pos: u64) -> Result<u32> {
        Ok(TABLE_ID_DEFAULT)
    }

    fn lost_blocks_size(&mut self, _core: &mut CacheCore) -> Result<u64> {
        let units: u64 = self.lost_units + self.lookup.values().sum::<u64>();
        Ok(units * self.scale as u64)
    }

    fn reset(&mut self, _core: &mut CacheCore) -> Result<()> {
        Ok(())
    }

    fn initialise_spaces(&mut self, _core: &mut CacheCore) -> Result<()> {
        Ok(())
    }

    fn is_multi_space(&self) -> bool {
        false
    }

    fn root_position(&self) -> u32 {
        0
    }

    fn file_block_size(&self) -> u64 {
        self.file_block_size
    }
}
