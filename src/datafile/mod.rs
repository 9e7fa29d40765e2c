//! datafile: the disk-backed row cache façade.
//!
//! Подмодули:
//! - core.rs      : FileIo (data-файл, shadow, буферы строк) и CacheCore (кэш + файл).
//! - open.rs      : open/close, восстановление после аварии, выбор space manager.
//! - checkpoint.rs: checkpoint и полный (gzip) backup.
//! - defrag.rs    : перепаковка живых строк в новый файл.
//!
//! Файлы одного хранилища (base = путь без расширения):
//! - <base>.data       : данные, заголовок в первых 32 байтах;
//! - <base>.backup     : shadow-лог (incremental) или gzip-копия (full backup);
//! - <base>.backup.new : временный gzip до rename;
//! - <base>.data.new / <base>.data.old: defrag;
//! - <base>.lck        : межпроцессный lock.
//!
//! Вся изменяемая часть под одним RwLock: чтения из кэша идут под read-локом,
//! загрузки с диска и любые записи под write-локом (значит, одну позицию
//! грузит не более одного потока).

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use log::{debug, warn};
use serde::Serialize;

use crate::config::StoreConfig;
use crate::consts::{BACKUP_EXT, DATA_EXT, LOCK_EXT, NEW_SUFFIX, OLD_SUFFIX};
use crate::error::StorageError;
use crate::lock::LockGuard;
use crate::metrics::record_cache_hit;
use crate::row::{downcast_row, CachedObject, RowReader, RowRef};
use crate::space::DataSpaceManager;

mod checkpoint;
mod core;
mod defrag;
mod open;

pub use self::core::{CacheCore, FileIo};
pub use defrag::{DefragReport, DefragSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Lifecycle {
    Closed,
    Opening,
    Open,
    Checkpointing,
    Defragmenting,
    Closing,
    /// An I/O failure left the session unusable; only close/reopen help.
    Error,
}

/// Paths derived from the base name.
#[derive(Debug, Clone)]
pub struct FileSet {
    pub data: PathBuf,
    pub backup: PathBuf,
    pub backup_tmp: PathBuf,
    pub data_new: PathBuf,
    pub data_old: PathBuf,
    pub lock: PathBuf,
}

fn with_suffix(base: &Path, parts: &[&str]) -> PathBuf {
    let mut s: OsString = base.as_os_str().to_os_string();
    for p in parts {
        s.push(".");
        s.push(p);
    }
    PathBuf::from(s)
}

impl FileSet {
    pub fn new(base: &Path) -> Self {
        Self {
            data: with_suffix(base, &[DATA_EXT]),
            backup: with_suffix(base, &[BACKUP_EXT]),
            backup_tmp: with_suffix(base, &[BACKUP_EXT, NEW_SUFFIX]),
            data_new: with_suffix(base, &[DATA_EXT, NEW_SUFFIX]),
            data_old: with_suffix(base, &[DATA_EXT, OLD_SUFFIX]),
            lock: with_suffix(base, &[LOCK_EXT]),
        }
    }
}

pub(crate) struct CacheState {
    lifecycle: Lifecycle,
    core: Option<CacheCore>,
    space: Option<Box<dyn DataSpaceManager>>,
    lock: Option<LockGuard>,
    readonly: bool,
    is_new: bool,
    initial_free_pos: u64,
}

impl CacheState {
    fn closed() -> Self {
        Self {
            lifecycle: Lifecycle::Closed,
            core: None,
            space: None,
            lock: None,
            readonly: false,
            is_new: false,
            initial_free_pos: 0,
        }
    }

    fn not_open(&self) -> anyhow::Error {
        StorageError::NotOpen(self.lifecycle).into()
    }

    /// Cache and space manager of an open session.
    fn parts(&mut self) -> Result<(&mut CacheCore, &mut dyn DataSpaceManager)> {
        if self.lifecycle != Lifecycle::Open {
            return Err(self.not_open());
        }
        match (self.core.as_mut(), self.space.as_mut()) {
            (Some(c), Some(s)) => Ok((c, s.as_mut())),
            _ => Err(StorageError::NotOpen(self.lifecycle).into()),
        }
    }

    fn writable_parts(&mut self) -> Result<(&mut CacheCore, &mut dyn DataSpaceManager)> {
        if self.readonly {
            return Err(StorageError::ReadOnly.into());
        }
        self.parts()
    }
}

/// Summary for `status` output and tests.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub lifecycle: Lifecycle,
    pub readonly: bool,
    pub rows: usize,
    pub bytes: u64,
    pub capacity_rows: usize,
    pub capacity_bytes: u64,
    pub file_end_bytes: u64,
    pub lost_bytes: u64,
    pub multi_space: bool,
    pub mapped: bool,
    pub modified: bool,
    pub shadow_bytes: u64,
}

pub struct DataFileCache {
    files: FileSet,
    cfg: StoreConfig,
    state: RwLock<CacheState>,
}

impl DataFileCache {
    /// Validate the configuration; nothing is touched on disk until `open`.
    pub fn new(base: impl AsRef<Path>, cfg: StoreConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            files: FileSet::new(base.as_ref()),
            cfg,
            state: RwLock::new(CacheState::closed()),
        })
    }

    /// `new` + `open`, shared.
    pub fn open_shared(base: impl AsRef<Path>, cfg: StoreConfig, readonly: bool) -> Result<Arc<Self>> {
        let c = Self::new(base, cfg)?;
        c.open(readonly)?;
        Ok(Arc::new(c))
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn files(&self) -> &FileSet {
        &self.files
    }

    pub fn config(&self) -> &StoreConfig {
        &self.cfg
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.read().lifecycle
    }

    pub fn is_open(&self) -> bool {
        self.lifecycle() == Lifecycle::Open
    }

    pub fn is_readonly(&self) -> bool {
        self.read().readonly
    }

    /// Row padding for objects stored here.
    pub fn row_padding(&self) -> u32 {
        self.cfg.cached_row_padding()
    }

    // ------------------------------------------------------------ rows

    /// Row at `pos`; loads it when not resident. `keep` pins the row and the
    /// caller must later call `keep_in_memory(false)` on it.
    pub fn get(&self, pos: u64, reader: &dyn RowReader, keep: bool) -> Result<RowRef> {
        {
            let st = self.read();
            if st.lifecycle == Lifecycle::Open {
                if let Some(core) = st.core.as_ref() {
                    if let Some(row) = core.cache.get(pos) {
                        if !keep || row.keep_in_memory(true) {
                            record_cache_hit();
                            return Ok(row);
                        }
                    }
                }
            }
        }
        let mut st = self.write();
        let (core, _) = st.parts()?;
        core.get_object(pos, reader, keep)
    }

    /// `get` with a checked downcast.
    pub fn get_row<T: CachedObject>(&self, pos: u64, reader: &dyn RowReader, keep: bool) -> Result<Arc<T>> {
        downcast_row::<T>(self.get(pos, reader, keep)?)
    }

    /// Current object for a reference the caller already holds: the same
    /// object while it is resident, otherwise whatever `get` finds at its position.
    pub fn get_from_row(&self, row: &RowRef, reader: &dyn RowReader, keep: bool) -> Result<RowRef> {
        if row.is_in_memory() && (!keep || row.keep_in_memory(true)) {
            return Ok(row.clone());
        }
        let pos = row.pos().ok_or_else(|| anyhow!("row has no file position"))?;
        self.get(pos, reader, keep)
    }

    /// Store a new row in `space_id`; returns its position.
    pub fn add(&self, row: RowRef, space_id: u32) -> Result<u64> {
        if let Some(p) = row.pos() {
            return Err(anyhow!("row is already stored at {}", p));
        }
        let mut st = self.write();
        let (core, space) = st.writable_parts()?;
        let size = row.storage_size();
        let pos = space.allocate(core, space_id, size)?;
        row.state().set_pos(pos);
        row.state().set_new(true);
        row.state().set_changed(true);
        if let Err(e) = core.add_object(row.clone()) {
            // место возвращается, строка остаётся без позиции
            row.state().set_pos(u64::MAX);
            if let Err(re) = space.release(core, space_id, pos, size) {
                warn!(
                    "add rollback: {} bytes at {} (space {}) not returned: {:#}",
                    size, pos, space_id, re
                );
            }
            return Err(e);
        }
        Ok(pos)
    }

    /// Put back a row object that already has a position (not new).
    pub fn restore(&self, row: RowRef) -> Result<()> {
        let mut st = self.write();
        let (core, _) = st.parts()?;
        row.state().set_new(false);
        if row.has_changed() {
            core.add_object(row)
        } else {
            core.cache.put(row, &mut core.io)
        }
    }

    /// Drop the row at `pos` from the cache without saving.
    pub fn release(&self, pos: u64) -> Result<bool> {
        let mut st = self.write();
        let (core, _) = st.parts()?;
        Ok(core.release(pos).is_some())
    }

    /// Delete the row at `pos` and give its space back to `space_id`.
    pub fn remove(&self, pos: u64, space_id: u32) -> Result<()> {
        let mut st = self.write();
        let (core, space) = st.writable_parts()?;
        let size = match core.release(pos) {
            Some(row) => row.storage_size(),
            None => core.io.read_size(pos)?,
        };
        space.release(core, space_id, pos, size)
    }

    /// Swap the object at its (existing) position.
    pub fn replace(&self, row: RowRef) -> Result<bool> {
        let pos = row.pos().ok_or_else(|| anyhow!("replace: row has no position"))?;
        let mut st = self.write();
        let (core, _) = st.parts()?;
        if row.has_changed() {
            core.io.set_file_modified()?;
        }
        Ok(core.cache.replace(pos, row).is_some())
    }

    /// Write one row now (it stays cached).
    pub fn save_row(&self, row: &RowRef) -> Result<()> {
        let mut st = self.write();
        let (core, _) = st.writable_parts()?;
        crate::cache::RowSaver::save_rows(&mut core.io, std::slice::from_ref(row))
    }

    /// Save every dirty row and sync; the header stays "modified".
    pub fn flush(&self) -> Result<()> {
        let mut st = self.write();
        let (core, _) = st.writable_parts()?;
        core.save_all()?;
        core.io.synch()
    }

    /// Stored size of the row at `pos`.
    pub fn storage_size(&self, pos: u64) -> Result<u32> {
        let mut st = self.write();
        let (core, _) = st.parts()?;
        if let Some(row) = core.cache.get(pos) {
            return Ok(row.storage_size());
        }
        core.io.read_size(pos)
    }

    // ------------------------------------------------------------ space

    /// Grow the file by `bytes`; returns the old end (scaled). With the blocks
    /// allocator only whole file blocks are accepted.
    pub fn enlarge_file_space(&self, bytes: u64) -> Result<u64> {
        let mut st = self.write();
        let (core, space) = st.writable_parts()?;
        if space.is_multi_space() && bytes % space.file_block_size() != 0 {
            return Err(anyhow!(
                "enlarge by {} bytes: the blocks allocator only grows by whole {}-byte blocks",
                bytes,
                space.file_block_size()
            ));
        }
        core.enlarge_file_space(bytes)
    }

    pub fn new_table_space_id(&self) -> Result<u32> {
        let mut st = self.write();
        let (_, space) = st.writable_parts()?;
        Ok(space.new_table_space_id())
    }

    pub fn free_table_space(&self, space_id: u32) -> Result<()> {
        let mut st = self.write();
        let (core, space) = st.writable_parts()?;
        space.free_table_space(core, space_id)
    }

    pub fn find_table_space(&self, pos: u64) -> Result<u32> {
        let mut st = self.write();
        let (core, space) = st.parts()?;
        space.find_table_space(core, pos)
    }

    pub fn lost_blocks_size(&self) -> Result<u64> {
        let mut st = self.write();
        let (core, space) = st.parts()?;
        space.lost_blocks_size(core)
    }

    pub fn get_file_blocks(&self, space_id: u32, count: u32) -> Result<u64> {
        let mut st = self.write();
        let (core, space) = st.writable_parts()?;
        space.get_file_blocks(core, space_id, count)
    }

    pub fn is_multi_space(&self) -> Result<bool> {
        let mut st = self.write();
        let (_, space) = st.parts()?;
        Ok(space.is_multi_space())
    }

    /// Lost space above the configured share of the file.
    pub fn should_defrag(&self) -> Result<bool> {
        if self.cfg.defrag_limit_percent == 0 {
            return Ok(false);
        }
        let mut st = self.write();
        let (core, space) = st.parts()?;
        let lost = space.lost_blocks_size(core)?;
        let end = core.free_pos() * core.scale() as u64;
        let over = end > 0 && lost * 100 > end * self.cfg.defrag_limit_percent as u64;
        debug!("should_defrag: lost {} of {} bytes -> {}", lost, end, over);
        Ok(over)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let mut st = self.write();
        let lifecycle = st.lifecycle;
        let readonly = st.readonly;
        let (core, space) = st.parts()?;
        let (capacity_rows, capacity_bytes) = core.cache.capacity();
        Ok(CacheStats {
            lifecycle,
            readonly,
            rows: core.cache.len(),
            bytes: core.cache.total_bytes(),
            capacity_rows,
            capacity_bytes,
            file_end_bytes: core.free_pos() * core.scale() as u64,
            lost_bytes: space.lost_blocks_size(core)?,
            multi_space: space.is_multi_space(),
            mapped: core.io.storage_kind() == crate::storage::StorageKind::Mapped,
            modified: core.io.is_modified(),
            shadow_bytes: core.io.shadow_size(),
        })
    }
}
