//! "Blocks" space manager: file blocks, a two-level directory and per-block bitmaps.
//!
//! Раскладка:
//! - файл делится на file blocks по `file_block_size` байт; блок i начинается с i * fbs;
//! - root (IntArrayBlock, DIR_BLOCK_SIZE слотов): адреса directory blocks,
//!   последний слот хранит следующий id table space;
//! - directory block: DIR_BLOCK_SIZE записей (table_id, bitmap, free, trailing);
//! - bitmap: бит на scale unit, set = свободно.
//!
//! Метаданные выделяются из table space TABLE_ID_DIRECTORY (только fresh area,
//! чтобы сохранялось выравнивание по FIXED_BLOCK_UNIT) и живут в общем кэше строк.
//! Пока метаданные меняются, они закреплены (Pinned), корень закреплён всегда.
//!
//! Инвариант: free_pos * scale == block_limit * fbs (иначе Integrity).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use log::{debug, info};

use super::{to_units, DataSpaceManager, TableSpace};
use crate::consts::{
    DIR_BLOCK_SIZE, FIXED_BLOCK_UNIT, TABLE_ID_DIRECTORY, TABLE_ID_EMPTY, TABLE_ID_FIRST,
};
use crate::datafile::CacheCore;
use crate::error::StorageError;
use crate::row::{downcast_row, CachedObject, RowRef};

pub mod objects;

use objects::{BitMapBlock, DirEntry, DirectoryBlock, IntArrayBlock, MetaReader, Pinned};

/// Root slots usable for directory block addresses.
const ROOT_DIR_SLOTS: usize = DIR_BLOCK_SIZE - 1;
/// Root slot holding the table-space id sequence.
const ROOT_SEQ_SLOT: usize = DIR_BLOCK_SIZE - 1;

fn integrity(msg: String) -> anyhow::Error {
    StorageError::Integrity(msg).into()
}

pub struct BlockSpaceManager {
    scale: u32,
    fbs: u64,
    units_per_block: u64,
    root: Arc<IntArrayBlock>,
    root_pos: u64,
    spaces: HashMap<u32, TableSpace>,
    next_space_id: u32,
    lookup_capacity: usize,
    bitmap_size: u32,
    dir_size: u32,
}

impl BlockSpaceManager {
    fn with_root(
        root: Arc<IntArrayBlock>,
        root_pos: u64,
        scale: u32,
        fbs: u64,
        lookup_capacity: usize,
    ) -> Self {
        let units_per_block = fbs / scale as u64;
        Self {
            scale,
            fbs,
            units_per_block,
            root,
            root_pos,
            spaces: HashMap::new(),
            next_space_id: TABLE_ID_FIRST,
            lookup_capacity,
            bitmap_size: BitMapBlock::storage_size_for(units_per_block as usize),
            dir_size: DirectoryBlock::storage_size_for(DIR_BLOCK_SIZE),
        }
    }

    /// Lay out allocator metadata in a brand new file.
    /// Block 0 (which also holds the header) belongs to the directory space.
    pub fn create(core: &mut CacheCore, fbs: u64, lookup_capacity: usize) -> Result<Self> {
        let scale = core.scale();
        let used = core.free_pos() * scale as u64;
        if used > FIXED_BLOCK_UNIT || fbs < FIXED_BLOCK_UNIT * 16 {
            return Err(integrity(format!(
                "cannot lay out space directory: free position {} bytes, block size {}",
                used, fbs
            )));
        }
        core.enlarge_file_space(fbs - used)?;

        let units_per_block = fbs / scale as u64;
        let mut dir_space = TableSpace::new(TABLE_ID_DIRECTORY, lookup_capacity);
        dir_space.set_fresh_area(FIXED_BLOCK_UNIT / scale as u64, units_per_block);
        dir_space.set_initialised();

        let root_units = to_units(IntArrayBlock::storage_size_for(DIR_BLOCK_SIZE) as u64, scale);
        let root_pos = dir_space
            .try_allocate_fresh(root_units)
            .ok_or_else(|| integrity("no room for the space directory root".into()))?;
        let root = IntArrayBlock::new(DIR_BLOCK_SIZE);
        root.state().set_pos(root_pos);
        root.keep_in_memory(true);
        root.set(ROOT_SEQ_SLOT, TABLE_ID_FIRST);
        core.add_object(root.clone())?;

        let mut mgr = Self::with_root(root, root_pos, scale, fbs, lookup_capacity);
        mgr.spaces.insert(TABLE_ID_DIRECTORY, dir_space);
        mgr.create_file_block_in_directory(core, 0, TABLE_ID_DIRECTORY)?;
        info!(
            "space directory created: block size {} bytes, root at {}",
            fbs, root_pos
        );
        Ok(mgr)
    }

    /// Attach to existing metadata; `root_4k` comes from the header.
    pub fn open(core: &mut CacheCore, root_4k: u32, fbs: u64, lookup_capacity: usize) -> Result<Self> {
        let scale = core.scale();
        let root_pos = root_4k as u64 * FIXED_BLOCK_UNIT / scale as u64;
        let row = core.get_object(root_pos, &MetaReader::IntArray, true)?;
        let root = downcast_row::<IntArrayBlock>(row)?;
        if root.len() != DIR_BLOCK_SIZE {
            return Err(integrity(format!(
                "space directory root has {} slots, expected {}",
                root.len(),
                DIR_BLOCK_SIZE
            )));
        }
        let mut mgr = Self::with_root(root, root_pos, scale, fbs, lookup_capacity);
        mgr.next_space_id = mgr.root.get(ROOT_SEQ_SLOT).max(TABLE_ID_FIRST);
        mgr.initialise_spaces(core)?;
        Ok(mgr)
    }

    pub fn units_per_block(&self) -> u64 {
        self.units_per_block
    }

    #[inline]
    fn block_start(&self, idx: u64) -> u64 {
        idx * self.units_per_block
    }

    #[inline]
    fn pos_of_4k(&self, v: u32) -> u64 {
        v as u64 * FIXED_BLOCK_UNIT / self.scale as u64
    }

    #[inline]
    fn to_4k(&self, pos: u64) -> Result<u32> {
        let bytes = pos * self.scale as u64;
        if bytes % FIXED_BLOCK_UNIT != 0 {
            return Err(integrity(format!("metadata at {} is not block aligned", pos)));
        }
        u32::try_from(bytes / FIXED_BLOCK_UNIT)
            .map_err(|_| integrity(format!("metadata position {} out of range", pos)))
    }

    /// Number of file blocks; checks that the file ends on a block boundary.
    fn block_limit(&self, core: &CacheCore) -> Result<u64> {
        let end = core.free_pos() * self.scale as u64;
        if end % self.fbs != 0 {
            return Err(integrity(format!(
                "file end {} is not a multiple of the file block size {}",
                end, self.fbs
            )));
        }
        Ok(end / self.fbs)
    }

    fn check_new_block_index(&self, old_free_pos: u64) -> Result<u64> {
        let bytes = old_free_pos * self.scale as u64;
        if bytes % self.fbs != 0 {
            return Err(integrity(format!(
                "new file block at byte {} does not start on a block boundary",
                bytes
            )));
        }
        Ok(bytes / self.fbs)
    }

    // ------------------------------------------------------------ metadata access

    fn pinned<T: CachedObject>(core: &mut CacheCore, pos: u64, reader: MetaReader) -> Result<Pinned<T>> {
        let row: RowRef = core.get_object(pos, &reader, true)?;
        let obj = downcast_row::<T>(row)?;
        Ok(Pinned::adopt(obj))
    }

    fn alloc_meta(&mut self, size: u32) -> Result<u64> {
        let units = to_units(size as u64, self.scale);
        self.spaces
            .get_mut(&TABLE_ID_DIRECTORY)
            .and_then(|ds| ds.try_allocate_fresh(units))
            .ok_or_else(|| integrity("space directory has no room for metadata".into()))
    }

    fn add_meta<T: CachedObject>(core: &mut CacheCore, obj: Arc<T>, pos: u64) -> Result<Pinned<T>> {
        obj.state().set_pos(pos);
        obj.keep_in_memory(true);
        let guard = Pinned::adopt(obj);
        let row: RowRef = guard.arc().clone();
        core.add_object(row)?;
        Ok(guard)
    }

    /// Directory block `d`; created (and linked from the root) when `create` is set.
    fn directory(
        &mut self,
        core: &mut CacheCore,
        d: usize,
        create: bool,
    ) -> Result<Option<Pinned<DirectoryBlock>>> {
        if d >= ROOT_DIR_SLOTS {
            return Err(integrity(format!(
                "space directory root is full ({} directory blocks)",
                ROOT_DIR_SLOTS
            )));
        }
        let ptr = self.root.get(d);
        if ptr != 0 {
            let pos = self.pos_of_4k(ptr);
            return Ok(Some(Self::pinned(core, pos, MetaReader::Directory)?));
        }
        if !create {
            return Ok(None);
        }
        let pos = self.alloc_meta(self.dir_size)?;
        let dir = Self::add_meta(core, DirectoryBlock::new(DIR_BLOCK_SIZE), pos)?;
        self.root.set(d, self.to_4k(pos)?);
        debug!("space directory: directory block {} at {}", d, pos);
        Ok(Some(dir))
    }

    fn entry_dir(&mut self, core: &mut CacheCore, idx: u64) -> Result<(Pinned<DirectoryBlock>, usize)> {
        let d = (idx / DIR_BLOCK_SIZE as u64) as usize;
        let slot = (idx % DIR_BLOCK_SIZE as u64) as usize;
        let dir = self
            .directory(core, d, false)?
            .ok_or_else(|| integrity(format!("no directory block for file block {}", idx)))?;
        Ok((dir, slot))
    }

    fn entry(&mut self, core: &mut CacheCore, idx: u64) -> Result<DirEntry> {
        let (dir, slot) = self.entry_dir(core, idx)?;
        Ok(dir.entry(slot))
    }

    fn bitmap(&self, core: &mut CacheCore, e: &DirEntry) -> Result<Pinned<BitMapBlock>> {
        if e.bitmap == 0 {
            return Err(integrity("directory entry without a bitmap".into()));
        }
        Self::pinned(core, self.pos_of_4k(e.bitmap), MetaReader::BitMap)
    }

    // ------------------------------------------------------------ block creation

    /// Directory entry + bitmap for a new block `idx`; the whole block is in use
    /// (it becomes the owner's fresh area).
    fn create_file_block_in_directory(&mut self, core: &mut CacheCore, idx: u64, space_id: u32) -> Result<()> {
        let d = (idx / DIR_BLOCK_SIZE as u64) as usize;
        let slot = (idx % DIR_BLOCK_SIZE as u64) as usize;
        let dir = self
            .directory(core, d, true)?
            .ok_or_else(|| integrity(format!("directory block {} missing", d)))?;

        let bm_pos = self.alloc_meta(self.bitmap_size)?;
        let _bm = Self::add_meta(core, BitMapBlock::new(self.units_per_block as usize), bm_pos)?;
        dir.set_entry(
            slot,
            DirEntry {
                table_id: space_id,
                bitmap: self.to_4k(bm_pos)?,
                free_units: 0,
                trailing_units: 0,
            },
        );
        Ok(())
    }

    /// Directory space must hold metadata for `count` more blocks; grows itself first.
    fn ensure_directory_headroom(&mut self, core: &mut CacheCore, count: u64) -> Result<()> {
        loop {
            let limit = self.block_limit(core)?;
            let mut new_dirs = 0u64;
            let first_d = limit / DIR_BLOCK_SIZE as u64;
            let last_d = (limit + count) / DIR_BLOCK_SIZE as u64;
            for d in first_d..=last_d {
                if (d as usize) < ROOT_DIR_SLOTS && self.root.get(d as usize) == 0 {
                    new_dirs += 1;
                }
            }
            // +1 block: growing the directory itself needs an entry too
            let need = (count + 1) * self.bitmap_size as u64 + new_dirs * self.dir_size as u64;
            let need_units = to_units(need, self.scale);
            let have = self.dir_space(core)?.fresh_units();
            if have >= need_units {
                return Ok(());
            }
            self.grow_directory_space(core)?;
        }
    }

    /// Self-hosted growth: the new block joins the directory space before its own
    /// entry and bitmap are allocated from it.
    fn grow_directory_space(&mut self, core: &mut CacheCore) -> Result<()> {
        // инициализация должна видеть файл без нового блока
        self.dir_space(core)?;
        let old = core.enlarge_file_space(self.fbs)?;
        let idx = self.check_new_block_index(old)?;
        let start = self.block_start(idx);
        let limit = start + self.units_per_block;
        if let Some(ds) = self.spaces.get_mut(&TABLE_ID_DIRECTORY) {
            ds.add_file_block(start, limit);
        }
        self.create_file_block_in_directory(core, idx, TABLE_ID_DIRECTORY)?;
        debug!("space directory: grew into file block {}", idx);
        Ok(())
    }

    // ------------------------------------------------------------ table spaces

    fn dir_space(&mut self, core: &mut CacheCore) -> Result<&mut TableSpace> {
        self.table_space(core, TABLE_ID_DIRECTORY)
    }

    /// Table space state, initialised lazily from the directory.
    fn table_space(&mut self, core: &mut CacheCore, space_id: u32) -> Result<&mut TableSpace> {
        let ready = self
            .spaces
            .get(&space_id)
            .map(|ts| ts.is_initialised())
            .unwrap_or(false);
        if !ready {
            let area = self.take_fresh_area(core, space_id)?;
            let cap = self.lookup_capacity;
            let ts = self
                .spaces
                .entry(space_id)
                .or_insert_with(|| TableSpace::new(space_id, cap));
            if let Some((start, limit)) = area {
                ts.add_file_block(start, limit);
            }
            ts.set_initialised();
        }
        self.spaces
            .get_mut(&space_id)
            .ok_or_else(|| anyhow!("table space {} vanished", space_id))
    }

    /// The owned block with the largest free tail becomes the fresh area;
    /// its tail bits are taken out of the bitmap.
    fn take_fresh_area(&mut self, core: &mut CacheCore, space_id: u32) -> Result<Option<(u64, u64)>> {
        let limit = self.block_limit(core)?;
        let mut best: Option<(u64, u32)> = None;
        for idx in 0..limit {
            let e = self.entry(core, idx)?;
            if e.table_id == space_id && e.trailing_units > 0 {
                if best.map(|(_, t)| e.trailing_units > t).unwrap_or(true) {
                    best = Some((idx, e.trailing_units));
                }
            }
        }
        let (idx, trailing) = match best {
            Some(b) => b,
            None => return Ok(None),
        };
        let (dir, slot) = self.entry_dir(core, idx)?;
        let mut e = dir.entry(slot);
        let bm = self.bitmap(core, &e)?;
        let off = self.units_per_block - trailing as u64;
        bm.update(|m| m.unset_range(off as usize, trailing as usize));
        e.free_units -= trailing;
        e.trailing_units = 0;
        dir.set_entry(slot, e);
        let start = self.block_start(idx) + off;
        Ok(Some((start, self.block_start(idx + 1))))
    }

    /// Return ranges to the owning blocks' bitmaps and refresh their counts.
    fn free_to_bitmaps(&mut self, core: &mut CacheCore, space_id: u32, list: Vec<(u64, u64)>) -> Result<()> {
        for (mut pos, mut units) in list {
            while units > 0 {
                let idx = pos / self.units_per_block;
                let off = pos % self.units_per_block;
                let n = units.min(self.units_per_block - off);

                let (dir, slot) = self.entry_dir(core, idx)?;
                let mut e = dir.entry(slot);
                if e.table_id != space_id {
                    return Err(integrity(format!(
                        "freeing {} units at {} for space {} inside block {} owned by {}",
                        n, pos, space_id, idx, e.table_id
                    )));
                }
                let bm = self.bitmap(core, &e)?;
                let (free, trailing) = bm.update(|m| {
                    m.set_range(off as usize, n as usize);
                    (m.count_set_bits() as u32, m.count_set_bits_end() as u32)
                });
                e.free_units = free;
                e.trailing_units = trailing;
                if free as u64 == self.units_per_block && e.table_id != TABLE_ID_DIRECTORY {
                    e.table_id = TABLE_ID_EMPTY;
                }
                dir.set_entry(slot, e);

                pos += n;
                units -= n;
            }
        }
        Ok(())
    }

    fn persist_sequence(&self) {
        self.root.set(ROOT_SEQ_SLOT, self.next_space_id);
    }
}

impl DataSpaceManager for BlockSpaceManager {
    fn allocate(&mut self, core: &mut CacheCore, space_id: u32, size: u32) -> Result<u64> {
        if space_id == TABLE_ID_DIRECTORY || space_id == TABLE_ID_EMPTY {
            return Err(anyhow!("table space id {} is reserved", space_id));
        }
        let units = to_units(size as u64, self.scale);
        if let Some(p) = self.table_space(core, space_id)?.try_allocate(units) {
            return Ok(p);
        }
        let blocks = units.div_ceil(self.units_per_block);
        let start = self.get_file_blocks(core, space_id, blocks as u32)?;
        let limit = start + blocks * self.units_per_block;
        let ts = self.table_space(core, space_id)?;
        ts.add_file_block(start, limit);
        ts.try_allocate(units).ok_or_else(|| {
            integrity(format!(
                "space {}: {} units not available after adding {} blocks",
                space_id, units, blocks
            ))
        })
    }

    fn release(&mut self, core: &mut CacheCore, space_id: u32, pos: u64, size: u32) -> Result<()> {
        let units = to_units(size as u64, self.scale);
        let ts = self.table_space(core, space_id)?;
        ts.release(pos, units);
        if ts.needs_flush() {
            let list = ts.drain_lookup();
            debug!("space {}: flushing {} free fragments to bitmaps", space_id, list.len());
            self.free_to_bitmaps(core, space_id, list)?;
        }
        Ok(())
    }

    fn new_table_space_id(&mut self) -> u32 {
        let id = self.next_space_id;
        self.next_space_id += 1;
        self.persist_sequence();
        id
    }

    fn get_file_blocks(&mut self, core: &mut CacheCore, space_id: u32, count: u32) -> Result<u64> {
        let count = count.max(1) as u64;
        let limit = self.block_limit(core)?;

        // first fit over empty blocks
        let mut run_start = 0u64;
        let mut run = 0u64;
        let mut found = None;
        for idx in 0..limit {
            if self.entry(core, idx)?.table_id == TABLE_ID_EMPTY {
                if run == 0 {
                    run_start = idx;
                }
                run += 1;
                if run == count {
                    found = Some(run_start);
                    break;
                }
            } else {
                run = 0;
            }
        }

        if let Some(first) = found {
            for idx in first..first + count {
                let (dir, slot) = self.entry_dir(core, idx)?;
                let mut e = dir.entry(slot);
                let bm = self.bitmap(core, &e)?;
                bm.update(|m| m.reset(false));
                e.table_id = space_id;
                e.free_units = 0;
                e.trailing_units = 0;
                dir.set_entry(slot, e);
            }
            debug!(
                "space {}: reused {} empty blocks from {}",
                space_id, count, first
            );
            return Ok(self.block_start(first));
        }

        self.ensure_directory_headroom(core, count)?;
        let old = core.enlarge_file_space(count * self.fbs)?;
        let idx = self.check_new_block_index(old)?;
        for i in 0..count {
            self.create_file_block_in_directory(core, idx + i, space_id)?;
        }
        debug!("space {}: {} new blocks from {}", space_id, count, idx);
        Ok(self.block_start(idx))
    }

    fn free_table_space(&mut self, core: &mut CacheCore, space_id: u32) -> Result<()> {
        if space_id == TABLE_ID_DIRECTORY || space_id == TABLE_ID_EMPTY {
            return Err(anyhow!("table space id {} cannot be freed", space_id));
        }
        let limit = self.block_limit(core)?;
        let mut freed = 0u64;
        for idx in 0..limit {
            let (dir, slot) = self.entry_dir(core, idx)?;
            let mut e = dir.entry(slot);
            if e.table_id != space_id {
                continue;
            }
            core.release_range(self.block_start(idx), self.block_start(idx + 1));
            let bm = self.bitmap(core, &e)?;
            bm.update(|m| m.reset(true));
            e.table_id = TABLE_ID_EMPTY;
            e.free_units = self.units_per_block as u32;
            e.trailing_units = self.units_per_block as u32;
            dir.set_entry(slot, e);
            freed += 1;
        }
        self.spaces.remove(&space_id);
        info!("space {}: freed {} blocks", space_id, freed);
        Ok(())
    }

    fn find_table_space(&mut self, core: &mut CacheCore, pos: u64) -> Result<u32> {
        let idx = pos / self.units_per_block;
        if idx >= self.block_limit(core)? {
            return Ok(TABLE_ID_EMPTY);
        }
        Ok(self.entry(core, idx)?.table_id)
    }

    fn lost_blocks_size(&mut self, core: &mut CacheCore) -> Result<u64> {
        let limit = self.block_limit(core)?;
        let mut units = 0u64;
        for idx in 0..limit {
            let e = self.entry(core, idx)?;
            units += if e.table_id == TABLE_ID_EMPTY {
                self.units_per_block
            } else {
                e.free_units as u64
            };
        }
        units += self.spaces.values().map(|ts| ts.lookup_units()).sum::<u64>();
        Ok(units * self.scale as u64)
    }

    fn reset(&mut self, core: &mut CacheCore) -> Result<()> {
        let mut ids: Vec<u32> = self.spaces.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let list = match self.spaces.get_mut(&id) {
                Some(ts) => ts.drain_all(),
                None => continue,
            };
            self.free_to_bitmaps(core, id, list)?;
        }
        self.persist_sequence();
        Ok(())
    }

    fn initialise_spaces(&mut self, core: &mut CacheCore) -> Result<()> {
        let limit = self.block_limit(core)?;
        let mut max_id = TABLE_ID_FIRST - 1;
        for idx in 0..limit {
            let e = self.entry(core, idx)?;
            if e.table_id >= TABLE_ID_FIRST {
                max_id = max_id.max(e.table_id);
            }
        }
        self.next_space_id = self.next_space_id.max(max_id + 1);
        self.spaces.retain(|_, ts| ts.is_initialised());
        debug!(
            "space directory: {} blocks, next table space id {}",
            limit, self.next_space_id
        );
        Ok(())
    }

    fn is_multi_space(&self) -> bool {
        true
    }

    fn root_position(&self) -> u32 {
        (self.root_pos * self.scale as u64 / FIXED_BLOCK_UNIT) as u32
    }

    fn file_block_size(&self) -> u64 {
        self.fbs
    }
}

impl BlockSpaceManager {
    /// Entry of file block `idx` (diagnostics and tests).
    pub fn block_entry(&mut self, core: &mut CacheCore, idx: u64) -> Result<DirEntry> {
        self.entry(core, idx)
    }
}
