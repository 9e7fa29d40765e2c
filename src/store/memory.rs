use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::row::{RowReader, RowRef};

/// Rows held only in memory; positions are sequential ids.
pub struct MemoryStore {
    rows: BTreeMap<u64, RowRef>,
    next_id: u64,
    reader: Arc<dyn RowReader>,
}

impl MemoryStore {
    pub fn new(reader: Arc<dyn RowReader>) -> Self {
        Self {
            rows: BTreeMap::new(),
            next_id: 1,
            reader,
        }
    }

    pub fn get(&self, pos: u64) -> Option<RowRef> {
        self.rows.get(&pos).cloned()
    }

    pub fn add(&mut self, row: RowRef) -> Result<u64> {
        if let Some(p) = row.pos() {
            return Err(anyhow!("row already has position {}", p));
        }
        let id = self.next_id;
        self.next_id += 1;
        row.state().set_pos(id);
        row.state().set_in_memory(true);
        self.rows.insert(id, row);
        Ok(id)
    }

    pub fn remove(&mut self, pos: u64) -> bool {
        match self.rows.remove(&pos) {
            Some(row) => {
                row.state().set_in_memory(false);
                true
            }
            None => false,
        }
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
}
