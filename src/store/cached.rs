use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use log::debug;

use crate::consts::TABLE_ID_DEFAULT;
use crate::datafile::DataFileCache;
use crate::error::StorageError;
use crate::row::{RowReader, RowRef};

/// Rows living in a data file; the store only remembers positions and sizes.
pub struct CachedStore {
    cache: Arc<DataFileCache>,
    space_id: u32,
    reader: Arc<dyn RowReader>,
    rows: BTreeMap<u64, u32>,
}

impl CachedStore {
    pub fn new(cache: Arc<DataFileCache>, space_id: u32, reader: Arc<dyn RowReader>) -> Self {
        Self::with_rows(cache, space_id, reader, BTreeMap::new())
    }

    pub fn with_rows(
        cache: Arc<DataFileCache>,
        space_id: u32,
        reader: Arc<dyn RowReader>,
        rows: BTreeMap<u64, u32>,
    ) -> Self {
        Self {
            cache,
            space_id,
            reader,
            rows,
        }
    }

    pub fn space_id(&self) -> u32 {
        self.space_id
    }

    pub fn cache(&self) -> &Arc<DataFileCache> {
        &self.cache
    }

    pub fn get(&self, pos: u64) -> Result<Option<RowRef>> {
        if !self.rows.contains_key(&pos) {
            return Ok(None);
        }
        self.cache.get(pos, self.reader.as_ref(), false).map(Some)
    }

    pub fn add(&mut self, row: RowRef) -> Result<u64> {
        let size = row.storage_size();
        let pos = self.cache.add(row, self.space_id)?;
        self.rows.insert(pos, size);
        Ok(pos)
    }

    pub fn remove(&mut self, pos: u64) -> Result<bool> {
        if self.rows.remove(&pos).is_none() {
            return Ok(false);
        }
        self.cache.remove(pos, self.space_id)?;
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn positions(&self) -> Vec<u64> {
        self.rows.keys().copied().collect()
    }

    pub fn reader(&self) -> &Arc<dyn RowReader> {
        &self.reader
    }

    pub(super) fn live_rows(&self) -> Vec<(u64, u32)> {
        self.rows.iter().map(|(p, s)| (*p, *s)).collect()
    }

    /// After defrag every row sits in the DEFAULT table space.
    pub(super) fn apply_moves(&mut self, moves: &BTreeMap<u64, u64>) -> Result<()> {
        let mut remapped = BTreeMap::new();
        for (old, size) in &self.rows {
            let new = moves.get(old).ok_or_else(|| {
                StorageError::Integrity(format!("row at {} missing from the defrag map", old))
            })?;
            remapped.insert(*new, *size);
        }
        self.rows = remapped;
        self.space_id = TABLE_ID_DEFAULT;
        debug!("cached store: {} rows remapped after defrag", self.rows.len());
        Ok(())
    }
}
