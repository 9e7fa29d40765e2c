//! store: row stores of one table: in memory or backed by a DataFileCache.
//!
//! Оба варианта дают один набор операций (get / add / remove / element_count /
//! move_data). Формат строки знает `RowReader`, который хранилище получает снаружи.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use log::debug;

use crate::datafile::{DataFileCache, DefragSource};
use crate::row::{RowInput, RowOutput, RowReader, RowRef};

mod cached;
mod memory;

pub use cached::CachedStore;
pub use memory::MemoryStore;

pub enum RowStore {
    Memory(MemoryStore),
    Cached(CachedStore),
}

impl RowStore {
    pub fn memory(reader: Arc<dyn RowReader>) -> Self {
        RowStore::Memory(MemoryStore::new(reader))
    }

    /// Cached store in its own table space (DEFAULT with the simple allocator).
    pub fn cached(cache: Arc<DataFileCache>, reader: Arc<dyn RowReader>) -> Result<Self> {
        let space_id = cache.new_table_space_id()?;
        Ok(RowStore::Cached(CachedStore::new(cache, space_id, reader)))
    }

    /// Cached store over an existing table space and known rows (position -> size).
    pub fn cached_with_rows(
        cache: Arc<DataFileCache>,
        space_id: u32,
        reader: Arc<dyn RowReader>,
        rows: BTreeMap<u64, u32>,
    ) -> Self {
        RowStore::Cached(CachedStore::with_rows(cache, space_id, reader, rows))
    }

    pub fn get(&self, pos: u64) -> Result<Option<RowRef>> {
        match self {
            RowStore::Memory(m) => Ok(m.get(pos)),
            RowStore::Cached(c) => c.get(pos),
        }
    }

    /// Store a new row (no position yet); returns its position.
    pub fn add(&mut self, row: RowRef) -> Result<u64> {
        match self {
            RowStore::Memory(m) => m.add(row),
            RowStore::Cached(c) => c.add(row),
        }
    }

    pub fn remove(&mut self, pos: u64) -> Result<bool> {
        match self {
            RowStore::Memory(m) => Ok(m.remove(pos)),
            RowStore::Cached(c) => c.remove(pos),
        }
    }

    pub fn element_count(&self) -> usize {
        match self {
            RowStore::Memory(m) => m.len(),
            RowStore::Cached(c) => c.len(),
        }
    }

    pub fn positions(&self) -> Vec<u64> {
        match self {
            RowStore::Memory(m) => m.positions(),
            RowStore::Cached(c) => c.positions(),
        }
    }

    fn reader(&self) -> &Arc<dyn RowReader> {
        match self {
            RowStore::Memory(m) => m.reader(),
            RowStore::Cached(c) => c.reader(),
        }
    }

    /// Move every row into `target` (copies, not shared objects); this store
    /// ends up empty. Returns old position -> new position.
    pub fn move_data(&mut self, target: &mut RowStore) -> Result<BTreeMap<u64, u64>> {
        let reader = self.reader().clone();
        let mut moves = BTreeMap::new();
        for pos in self.positions() {
            let row = self
                .get(pos)?
                .ok_or_else(|| anyhow!("row {} vanished during move", pos))?;
            let copy = detached_copy(&row, reader.as_ref())?;
            let new_pos = target.add(copy)?;
            moves.insert(pos, new_pos);
        }
        for pos in moves.keys() {
            self.remove(*pos)?;
        }
        debug!("store: moved {} rows", moves.len());
        Ok(moves)
    }
}

/// Serialize and read back: a new object without position, new + changed.
fn detached_copy(row: &RowRef, reader: &dyn RowReader) -> Result<RowRef> {
    let mut out = RowOutput::new(8);
    row.write(&mut out)?;
    out.pad_to(row.storage_size())?;
    let mut input = RowInput::new();
    input.reset_row(0, out.len())?;
    input.as_mut_slice().copy_from_slice(out.as_slice());
    let copy = reader.read_row(&mut input)?;
    let st = copy.state();
    st.set_pos(u64::MAX);
    st.set_in_memory(false);
    st.set_new(true);
    st.set_changed(true);
    Ok(copy)
}

impl DefragSource for RowStore {
    fn live_rows(&self) -> Vec<(u64, u32)> {
        match self {
            RowStore::Memory(_) => Vec::new(),
            RowStore::Cached(c) => c.live_rows(),
        }
    }

    fn apply_moves(&mut self, moves: &BTreeMap<u64, u64>) -> Result<()> {
        match self {
            RowStore::Memory(_) => Ok(()),
            RowStore::Cached(c) => c.apply_moves(moves),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{downcast_row, BlobReader, BlobRow};

    #[test]
    fn memory_store_moves_into_memory_store() -> Result<()> {
        let reader: Arc<dyn RowReader> = Arc::new(BlobReader);
        let mut a = RowStore::memory(reader.clone());
        let p1 = a.add(BlobRow::new(b"one".to_vec(), 8))?;
        let p2 = a.add(BlobRow::new(b"two".to_vec(), 8))?;
        assert_eq!(a.element_count(), 2);
        assert!(a.remove(p1)?);
        assert!(!a.remove(p1)?);

        let mut b = RowStore::memory(reader);
        b.add(BlobRow::new(b"zero".to_vec(), 8))?;
        let moves = a.move_data(&mut b)?;
        assert_eq!(a.element_count(), 0);
        assert_eq!(b.element_count(), 2);

        let moved = b.get(moves[&p2])?.ok_or_else(|| anyhow!("moved row missing"))?;
        assert_eq!(downcast_row::<BlobRow>(moved)?.payload(), b"two");
        Ok(())
    }
}
