//! datafile/core: file I/O and the row cache under one owner.
//!
//! `CacheCore` is what the space managers see: the cache, the data file and the
//! header fields that move while the file is open (free position, flags).
//! It lives inside the `DataFileCache` write lock, so nothing here locks.
//!
//! Порядок записи строки:
//! 1) saved-бит снимается (один раз за сессию), страница заголовка уходит в shadow;
//! 2) before-image диапазонов строк копируется в shadow и синхронизируется;
//! 3) только потом строки пишутся в data-файл.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};

use crate::cache::{RowCache, RowSaver};
use crate::config::StoreConfig;
use crate::consts::{
    FLAG_ISSAVED, FLAG_ISSHADOWED, HDR_OFF_FLAGS, ROW_SIZE_PREFIX,
};
use crate::error::{io_at, io_op, StorageError};
use crate::header::{flags_bytes, with_flag, DataFileHeader};
use crate::metrics::{record_cache_hit, record_cache_miss, record_file_read, record_save_batch};
use crate::row::{require_pos, RowInput, RowOutput, RowReader, RowRef};
use crate::shadow::ShadowFile;
use crate::storage::{RafFile, ScaledFile, StorageKind};

pub struct FileIo {
    data_path: PathBuf,
    /// Some(..) when incremental backup is on.
    shadow_path: Option<PathBuf>,
    scale: u32,
    max_file_size: u64,
    readonly: bool,
    file: Box<dyn ScaledFile>,
    shadow: Option<ShadowFile>,
    /// Data length covered by the last checkpoint; shadow copies stop here.
    checkpoint_len: u64,
    header: DataFileHeader,
    modified: bool,
    input: RowInput,
    output: RowOutput,
}

impl FileIo {
    pub fn new(
        data_path: &Path,
        shadow_path: Option<PathBuf>,
        cfg: &StoreConfig,
        file: Box<dyn ScaledFile>,
        header: DataFileHeader,
        readonly: bool,
    ) -> Self {
        let scale = cfg.data_file_scale;
        Self {
            data_path: data_path.to_path_buf(),
            shadow_path,
            scale,
            max_file_size: cfg.max_data_file_size(),
            readonly,
            file,
            shadow: None,
            checkpoint_len: header.free_pos * scale as u64,
            header,
            modified: false,
            input: RowInput::new(),
            output: RowOutput::new(cfg.cached_row_padding()),
        }
    }

    #[inline]
    pub fn scale(&self) -> u32 {
        self.scale
    }

    pub fn header(&self) -> &DataFileHeader {
        &self.header
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn storage_kind(&self) -> StorageKind {
        self.file.kind()
    }

    pub fn shadow_size(&self) -> u64 {
        self.shadow.as_ref().map(|s| s.size()).unwrap_or(0)
    }

    fn incremental(&self) -> bool {
        self.shadow_path.is_some()
    }

    fn ensure_shadow(&mut self) -> Result<()> {
        if self.shadow.is_some() {
            return Ok(());
        }
        if let Some(p) = &self.shadow_path {
            self.shadow = Some(ShadowFile::create(p, self.checkpoint_len)?);
        }
        Ok(())
    }

    /// Overwrite bytes at `byte_pos`, shadowing their before-image first.
    fn write_through(&mut self, byte_pos: u64, bytes: &[u8]) -> Result<()> {
        if let Some(sh) = self.shadow.as_mut() {
            sh.copy(self.file.as_mut(), byte_pos, bytes.len() as u64)?;
            sh.synch()?;
        }
        self.file
            .write_at(byte_pos, bytes)
            .map_err(io_at("write", byte_pos))?;
        Ok(())
    }

    /// First modification after open/checkpoint: clear `saved` on disk.
    pub fn set_file_modified(&mut self) -> Result<()> {
        if self.readonly {
            return Err(StorageError::ReadOnly.into());
        }
        if self.modified {
            return Ok(());
        }
        let inc = self.incremental();
        if inc {
            self.ensure_shadow()?;
        }
        let flags = with_flag(with_flag(self.header.flags, FLAG_ISSAVED, false), FLAG_ISSHADOWED, inc);
        self.write_through(HDR_OFF_FLAGS, &flags_bytes(flags))?;
        self.file.synch().map_err(io_op("sync data file"))?;
        self.header.flags = flags;
        self.modified = true;
        debug!("data file {} marked modified", self.data_path.display());
        Ok(())
    }

    /// Grow the allocated area by `bytes`; returns the old free position (scaled).
    pub fn enlarge_file_space(&mut self, bytes: u64) -> Result<u64> {
        if self.readonly {
            return Err(StorageError::ReadOnly.into());
        }
        let scale = self.scale as u64;
        if bytes % scale != 0 {
            return Err(anyhow!("enlarge by {} bytes: not a multiple of scale {}", bytes, scale));
        }
        let old = self.header.free_pos;
        let new_end = old * scale + bytes;
        if new_end > self.max_file_size {
            return Err(StorageError::FileFull {
                requested: new_end,
                max: self.max_file_size,
            }
            .into());
        }
        self.set_file_modified()?;
        self.ensure_length(new_end)?;
        self.header.free_pos = new_end / scale;
        Ok(old)
    }

    /// Physical length; a mapped backend that cannot grow is swapped for RAF.
    fn ensure_length(&mut self, len: u64) -> Result<()> {
        if self.file.ensure_length(len).map_err(io_at("extend data file", len))? {
            return Ok(());
        }
        if self.file.kind() == StorageKind::Mapped {
            self.file.synch().map_err(io_op("sync mapped data file"))?;
            let raf = RafFile::open(&self.data_path, false).map_err(io_op("reopen data file"))?;
            self.file = Box::new(raf);
            info!(
                "data file {} outgrew the mapped backend at {} bytes, switched to RAF",
                self.data_path.display(),
                len
            );
            if self.file.ensure_length(len).map_err(io_at("extend data file", len))? {
                return Ok(());
            }
        }
        Err(StorageError::FileFull {
            requested: len,
            max: self.max_file_size,
        }
        .into())
    }

    /// Stored size of the row at `pos`.
    pub fn read_size(&mut self, pos: u64) -> Result<u32> {
        let off = pos * self.scale as u64;
        let size = self
            .file
            .read_u32_at(off)
            .map_err(io_at("read row size", pos))?;
        let end = self.header.free_pos * self.scale as u64;
        if (size as usize) < ROW_SIZE_PREFIX || off + size as u64 > end {
            return Err(StorageError::Format(format!(
                "row at {} declares size {} (allocated end {})",
                pos, size, end
            ))
            .into());
        }
        Ok(size)
    }

    pub fn read_object(&mut self, pos: u64, reader: &dyn RowReader) -> Result<RowRef> {
        let size = self.read_size(pos)?;
        self.input.reset_row(pos, size as usize)?;
        self.file
            .read_at(pos * self.scale as u64, self.input.as_mut_slice())
            .map_err(io_at("read row", pos))?;
        let row = reader.read_row(&mut self.input)?;
        row.state().set_pos(pos);
        record_file_read();
        Ok(row)
    }

    /// Whatever the last load left in the input buffer.
    pub fn last_input(&self) -> &[u8] {
        self.input.as_slice()
    }

    /// Stored bytes of the row at `pos`, size prefix included.
    pub fn read_raw(&mut self, pos: u64) -> Result<Vec<u8>> {
        let size = self.read_size(pos)?;
        let mut buf = vec![0u8; size as usize];
        self.file
            .read_at(pos * self.scale as u64, &mut buf)
            .map_err(io_at("read row", pos))?;
        Ok(buf)
    }

    /// Plain write without shadowing (files that have no checkpoint yet).
    pub fn write_raw(&mut self, pos: u64, bytes: &[u8]) -> Result<()> {
        self.file
            .write_at(pos * self.scale as u64, bytes)
            .map_err(io_at("write row", pos))?;
        Ok(())
    }

    pub fn reserve_row(&mut self, size: u32) {
        self.output.reserve_row(size as usize);
    }

    pub fn shrink_buffers(&mut self) {
        self.input.shrink();
        self.output.shrink();
    }

    pub fn synch(&mut self) -> Result<()> {
        self.file.synch().map_err(io_op("sync data file"))?;
        Ok(())
    }

    /// Lay down the header of an empty file.
    pub fn format_new(&mut self) -> Result<()> {
        let mut h = self.header;
        h.flags = h.saved_flags(self.incremental());
        self.ensure_length(h.free_pos * self.scale as u64)?;
        h.write(self.file.as_mut())?;
        self.file.synch().map_err(io_op("sync data file"))?;
        self.header = h;
        self.checkpoint_len = h.free_pos * self.scale as u64;
        Ok(())
    }

    /// Write the checkpoint header (saved set) and drop the shadow log.
    pub fn commit_header(&mut self, empty_size: u64, space_root: u32) -> Result<()> {
        let mut h = self.header;
        h.empty_size = empty_size;
        h.space_root = space_root;
        h.flags = h.saved_flags(self.incremental());
        self.file.synch().map_err(io_op("sync data file"))?;
        self.write_through(0, &h.encode())?;
        self.file.synch().map_err(io_op("sync data file"))?;
        self.header = h;

        if let Some(sh) = self.shadow.take() {
            sh.discard()?;
        }
        self.checkpoint_len = h.free_pos * self.scale as u64;
        self.modified = false;
        Ok(())
    }

    /// Close without saving; the shadow log stays for recovery.
    pub fn abandon(&mut self) -> Result<()> {
        if let Some(sh) = self.shadow.take() {
            sh.close()?;
        }
        Ok(())
    }
}

impl RowSaver for FileIo {
    fn save_rows(&mut self, rows: &[RowRef]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.set_file_modified()?;

        let scale = self.scale as u64;
        if let Some(sh) = self.shadow.as_mut() {
            for r in rows {
                let pos = require_pos(&**r)?;
                sh.copy(self.file.as_mut(), pos * scale, r.storage_size() as u64)?;
            }
            sh.synch()?;
        }

        for r in rows {
            let pos = require_pos(&**r)?;
            let _m = r.state().monitor();
            self.output.reset();
            r.write(&mut self.output)?;
            self.output.pad_to(r.storage_size())?;
            self.file
                .write_at(pos * scale, self.output.as_slice())
                .map_err(io_at("save row", pos))?;
            r.state().set_changed(false);
            r.state().set_new(false);
        }
        record_save_batch(rows.len());
        Ok(())
    }
}

/// Row cache plus file, handed to the space managers.
pub struct CacheCore {
    pub(crate) cache: RowCache,
    pub(crate) io: FileIo,
}

impl CacheCore {
    pub fn new(cfg: &StoreConfig, io: FileIo) -> Self {
        Self {
            cache: RowCache::new(cfg.cache_rows, cfg.cache_bytes),
            io,
        }
    }

    #[inline]
    pub fn scale(&self) -> u32 {
        self.io.scale()
    }

    /// Logical end of allocated space (scaled).
    #[inline]
    pub fn free_pos(&self) -> u64 {
        self.io.header().free_pos
    }

    pub fn enlarge_file_space(&mut self, bytes: u64) -> Result<u64> {
        self.io.enlarge_file_space(bytes)
    }

    /// Cached object at `pos`, loading it through `reader` on a miss.
    /// `keep` pins it; the caller owes one `keep_in_memory(false)`.
    pub fn get_object(&mut self, pos: u64, reader: &dyn RowReader, keep: bool) -> Result<RowRef> {
        if let Some(row) = self.cache.get(pos) {
            record_cache_hit();
            if keep {
                pin(&row)?;
            }
            return Ok(row);
        }
        record_cache_miss();
        let row = self.load(pos, reader)?;
        if keep {
            pin(&row)?;
        }
        if let Err(e) = self.cache.put(row.clone(), &mut self.io) {
            if keep {
                row.keep_in_memory(false);
            }
            return Err(e);
        }
        Ok(row)
    }

    fn load(&mut self, pos: u64, reader: &dyn RowReader) -> Result<RowRef> {
        match self.io.read_object(pos, reader) {
            Ok(row) => Ok(row),
            Err(e) if matches!(StorageError::of(&e), Some(StorageError::OutOfMemory { .. })) => {
                warn!("out of memory loading row {}, purging unchanged rows", pos);
                self.cache.clear_unchanged();
                self.io.shrink_buffers();
                self.io.read_object(pos, reader).map_err(|e2| {
                    error!("row {} failed to load after purge: {:#}", pos, e2);
                    StorageError::RowLoad {
                        pos,
                        partial: self.io.last_input().to_vec(),
                    }
                    .into()
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Insert an object that already has its position; marks the file modified.
    pub fn add_object(&mut self, row: RowRef) -> Result<()> {
        require_pos(&*row)?;
        self.io.set_file_modified()?;
        self.io.reserve_row(row.storage_size());
        self.cache.put(row, &mut self.io)
    }

    pub fn release(&mut self, pos: u64) -> Option<RowRef> {
        self.cache.release(pos)
    }

    pub fn release_range(&mut self, lo: u64, hi: u64) -> usize {
        self.cache.release_range(lo, hi)
    }

    pub fn save_all(&mut self) -> Result<()> {
        self.cache.save_all(&mut self.io)
    }
}

fn pin(row: &RowRef) -> Result<()> {
    if row.keep_in_memory(true) {
        Ok(())
    } else {
        Err(anyhow!("row at {:?} already holds the maximum number of pins", row.pos()))
    }
}
