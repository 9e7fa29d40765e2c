//! space: free-space management of the data file.
//!
//! Два варианта за одним трейтом:
//! - `SimpleSpaceManager`: один список свободных фрагментов, файл растёт в конец.
//! - `BlockSpaceManager`: file blocks, директория (root -> directory blocks) и битмапы,
//!   метаданные живут в том же кэше строк, что и данные.
//!
//! Позиции в scale units, размеры на входе в байтах.

use anyhow::Result;

use crate::datafile::CacheCore;

pub mod bitmap;
pub mod blocks;
pub mod simple;
pub mod table_space;

pub use bitmap::BitMap;
pub use blocks::BlockSpaceManager;
pub use simple::SimpleSpaceManager;
pub use table_space::TableSpace;

pub trait DataSpaceManager: Send + Sync {
    /// Reserve `size` bytes for `space_id`; returns the scaled position.
    fn allocate(&mut self, core: &mut CacheCore, space_id: u32, size: u32) -> Result<u64>;

    /// Give back a range previously returned by `allocate`.
    fn release(&mut self, core: &mut CacheCore, space_id: u32, pos: u64, size: u32) -> Result<()>;

    /// Next user table-space id (never reused).
    fn new_table_space_id(&mut self) -> u32;

    /// `count` whole file blocks for `space_id`; returns the scaled position of the first.
    fn get_file_blocks(&mut self, core: &mut CacheCore, space_id: u32, count: u32) -> Result<u64>;

    /// Drop everything owned by `space_id`, including its cached rows.
    fn free_table_space(&mut self, core: &mut CacheCore, space_id: u32) -> Result<()>;

    /// Owner of the block holding `pos`.
    fn find_table_space(&mut self, core: &mut CacheCore, pos: u64) -> Result<u32>;

    /// Reclaimable bytes.
    fn lost_blocks_size(&mut self, core: &mut CacheCore) -> Result<u64>;

    /// Checkpoint, before rows are saved: fold in-memory free lists into persistent state.
    fn reset(&mut self, core: &mut CacheCore) -> Result<()>;

    /// After open and after every checkpoint.
    fn initialise_spaces(&mut self, core: &mut CacheCore) -> Result<()>;

    fn is_multi_space(&self) -> bool;

    /// Root of persistent metadata in FIXED_BLOCK_UNIT units (0 = none).
    fn root_position(&self) -> u32;

    fn file_block_size(&self) -> u64;
}

/// Size in scale units; sizes are always multiples of the scale.
#[inline]
pub(crate) fn to_units(size: u64, scale: u32) -> u64 {
    size.div_ceil(scale as u64)
}
