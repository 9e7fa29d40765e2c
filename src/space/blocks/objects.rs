//! Persistent metadata of the blocks manager, stored as ordinary cached objects.
//!
//! Все объекты выровнены и округлены до FIXED_BLOCK_UNIT.
//! Раскладка (LE): [storage size u32][count u32][payload].
//! - IntArrayBlock: count * u32 (root: адреса directory blocks, последний слот = next space id)
//! - DirectoryBlock: count * (table_id, bitmap, free_units, trailing_units) u32
//! - BitMapBlock: count бит, set = свободная единица

use std::any::Any;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;

use crate::consts::{DIR_ENTRY_BYTES, FIXED_BLOCK_UNIT};
use crate::error::StorageError;
use crate::row::{CachedObject, RowInput, RowOutput, RowReader, RowRef, RowState};
use crate::space::BitMap;

/// Storage size of a metadata object with `raw` bytes of content.
pub fn meta_size(raw: usize) -> u32 {
    let unit = FIXED_BLOCK_UNIT as usize;
    (raw.div_ceil(unit) * unit) as u32
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------- IntArray

#[derive(Debug)]
pub struct IntArrayBlock {
    state: RowState,
    size: u32,
    values: Mutex<Vec<u32>>,
}

impl IntArrayBlock {
    pub fn new(len: usize) -> Arc<Self> {
        Arc::new(Self {
            state: RowState::fresh(),
            size: meta_size(8 + len * 4),
            values: Mutex::new(vec![0; len]),
        })
    }

    pub fn storage_size_for(len: usize) -> u32 {
        meta_size(8 + len * 4)
    }

    pub fn len(&self) -> usize {
        lock(&self.values).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, i: usize) -> u32 {
        lock(&self.values).get(i).copied().unwrap_or(0)
    }

    pub fn set(&self, i: usize, v: u32) {
        let mut vals = lock(&self.values);
        if let Some(slot) = vals.get_mut(i) {
            *slot = v;
            self.state.set_changed(true);
        }
    }
}

impl CachedObject for IntArrayBlock {
    fn state(&self) -> &RowState {
        &self.state
    }

    fn storage_size(&self) -> u32 {
        self.size
    }

    fn write(&self, out: &mut RowOutput) -> Result<()> {
        let vals = lock(&self.values);
        out.write_u32(self.size);
        out.write_u32(vals.len() as u32);
        for v in vals.iter() {
            out.write_u32(*v);
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// ---------------------------------------------------------------- Directory

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirEntry {
    pub table_id: u32,
    /// Bitmap address in FIXED_BLOCK_UNIT units.
    pub bitmap: u32,
    pub free_units: u32,
    pub trailing_units: u32,
}

#[derive(Debug)]
pub struct DirectoryBlock {
    state: RowState,
    size: u32,
    entries: Mutex<Vec<DirEntry>>,
}

impl DirectoryBlock {
    pub fn new(len: usize) -> Arc<Self> {
        Arc::new(Self {
            state: RowState::fresh(),
            size: Self::storage_size_for(len),
            entries: Mutex::new(vec![DirEntry::default(); len]),
        })
    }

    pub fn storage_size_for(len: usize) -> u32 {
        meta_size(8 + len * DIR_ENTRY_BYTES)
    }

    pub fn entry(&self, i: usize) -> DirEntry {
        lock(&self.entries).get(i).copied().unwrap_or_default()
    }

    pub fn set_entry(&self, i: usize, e: DirEntry) {
        let mut es = lock(&self.entries);
        if let Some(slot) = es.get_mut(i) {
            *slot = e;
            self.state.set_changed(true);
        }
    }
}

impl CachedObject for DirectoryBlock {
    fn state(&self) -> &RowState {
        &self.state
    }

    fn storage_size(&self) -> u32 {
        self.size
    }

    fn write(&self, out: &mut RowOutput) -> Result<()> {
        let es = lock(&self.entries);
        out.write_u32(self.size);
        out.write_u32(es.len() as u32);
        for e in es.iter() {
            out.write_u32(e.table_id);
            out.write_u32(e.bitmap);
            out.write_u32(e.free_units);
            out.write_u32(e.trailing_units);
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// ---------------------------------------------------------------- BitMap

#[derive(Debug)]
pub struct BitMapBlock {
    state: RowState,
    size: u32,
    map: Mutex<BitMap>,
}

impl BitMapBlock {
    /// All units used.
    pub fn new(units: usize) -> Arc<Self> {
        Arc::new(Self {
            state: RowState::fresh(),
            size: Self::storage_size_for(units),
            map: Mutex::new(BitMap::new(units)),
        })
    }

    pub fn storage_size_for(units: usize) -> u32 {
        meta_size(8 + units.div_ceil(8))
    }

    /// Read access.
    pub fn view<R>(&self, f: impl FnOnce(&BitMap) -> R) -> R {
        f(&lock(&self.map))
    }

    /// Mutation; marks the object dirty.
    pub fn update<R>(&self, f: impl FnOnce(&mut BitMap) -> R) -> R {
        let r = f(&mut lock(&self.map));
        self.state.set_changed(true);
        r
    }
}

impl CachedObject for BitMapBlock {
    fn state(&self) -> &RowState {
        &self.state
    }

    fn storage_size(&self) -> u32 {
        self.size
    }

    fn write(&self, out: &mut RowOutput) -> Result<()> {
        let m = lock(&self.map);
        out.write_u32(self.size);
        out.write_u32(m.len() as u32);
        out.write_bytes(&m.to_bytes());
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// ---------------------------------------------------------------- Reader

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaReader {
    IntArray,
    Directory,
    BitMap,
}

fn check_fits(input: &RowInput, size: u32, need: usize) -> Result<()> {
    if need > size as usize {
        return Err(StorageError::Integrity(format!(
            "metadata object at {} declares {} entries beyond its size {}",
            input.pos(),
            need,
            size
        ))
        .into());
    }
    Ok(())
}

impl RowReader for MetaReader {
    fn read_row(&self, input: &mut RowInput) -> Result<RowRef> {
        let size = input.read_size_prefix()?;
        let count = input.read_u32()? as usize;
        let state = RowState::loaded(input.pos());
        let row: RowRef = match self {
            MetaReader::IntArray => {
                check_fits(input, size, 8 + count * 4)?;
                let mut vals = Vec::with_capacity(count);
                for _ in 0..count {
                    vals.push(input.read_u32()?);
                }
                Arc::new(IntArrayBlock {
                    state,
                    size,
                    values: Mutex::new(vals),
                }) as RowRef
            }
            MetaReader::Directory => {
                check_fits(input, size, 8 + count * DIR_ENTRY_BYTES)?;
                let mut es = Vec::with_capacity(count);
                for _ in 0..count {
                    es.push(DirEntry {
                        table_id: input.read_u32()?,
                        bitmap: input.read_u32()?,
                        free_units: input.read_u32()?,
                        trailing_units: input.read_u32()?,
                    });
                }
                Arc::new(DirectoryBlock {
                    state,
                    size,
                    entries: Mutex::new(es),
                }) as RowRef
            }
            MetaReader::BitMap => {
                let nbytes = count.div_ceil(8);
                check_fits(input, size, 8 + nbytes)?;
                let bytes = input.read_bytes(nbytes)?;
                Arc::new(BitMapBlock {
                    state,
                    size,
                    map: Mutex::new(BitMap::from_bytes(count, &bytes)),
                }) as RowRef
            }
        };
        Ok(row)
    }
}

// ---------------------------------------------------------------- Pin guard

/// Metadata object pinned in the cache for the guard's lifetime.
pub struct Pinned<T: CachedObject>(Arc<T>);

impl<T: CachedObject> Pinned<T> {
    /// Takes ownership of one pin already placed on `obj`.
    pub fn adopt(obj: Arc<T>) -> Self {
        Pinned(obj)
    }

    pub fn arc(&self) -> &Arc<T> {
        &self.0
    }
}

impl<T: CachedObject> Deref for Pinned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: CachedObject> Drop for Pinned<T> {
    fn drop(&mut self) {
        self.0.keep_in_memory(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(obj: &dyn CachedObject, reader: MetaReader) -> Result<RowRef> {
        let mut out = RowOutput::new(8);
        obj.write(&mut out)?;
        out.pad_to(obj.storage_size())?;
        let mut input = RowInput::new();
        input.reset_row(512, out.len())?;
        input.as_mut_slice().copy_from_slice(out.as_slice());
        reader.read_row(&mut input)
    }

    #[test]
    fn directory_entries_survive_serialization() -> Result<()> {
        let d = DirectoryBlock::new(16);
        d.set_entry(
            3,
            DirEntry {
                table_id: 7,
                bitmap: 12,
                free_units: 100,
                trailing_units: 40,
            },
        );
        assert!(d.state().has_changed());
        let back = crate::row::downcast_row::<DirectoryBlock>(roundtrip(&*d, MetaReader::Directory)?)?;
        assert_eq!(back.entry(3), d.entry(3));
        assert_eq!(back.entry(4), DirEntry::default());
        assert_eq!(back.storage_size(), 4096);
        Ok(())
    }

    #[test]
    fn bitmap_and_root_survive_serialization() -> Result<()> {
        let b = BitMapBlock::new(1000);
        b.update(|m| m.set_range(10, 500));
        let back = crate::row::downcast_row::<BitMapBlock>(roundtrip(&*b, MetaReader::BitMap)?)?;
        assert_eq!(back.view(|m| m.count_set_bits()), 500);

        let r = IntArrayBlock::new(2048);
        r.set(2047, 9);
        assert_eq!(r.storage_size(), 12288);
        let back = crate::row::downcast_row::<IntArrayBlock>(roundtrip(&*r, MetaReader::IntArray)?)?;
        assert_eq!(back.get(2047), 9);
        assert!(crate::row::downcast_row::<BitMapBlock>(back).is_err());
        Ok(())
    }
}
