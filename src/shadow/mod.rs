//! shadow: before-image log for incremental backup.
//!
//! Формат <base>.backup (LE):
//! MAGIC8 = "RQSHADW1"
//! u64 original_len          (длина data-файла на момент checkpoint)
//! records: [len u32][offset u64][crc32c u32][payload len bytes]
//!
//! Политика:
//! - Копируются страницы SHADOW_PAGE_SIZE, каждая не более одного раза за сессию.
//! - Копируется только то, что лежит ниже original_len: всё выше обрезается при restore.
//! - CRC покрывает [len][offset] и payload; битый/неполный хвост = конец лога.
//! - Вызывающий обязан сделать `synch()` до записи в основной файл.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use crate::consts::{SHADOW_HDR_SIZE, SHADOW_MAGIC, SHADOW_PAGE_SIZE, SHADOW_REC_HDR_SIZE};
use crate::error::{io_at, io_op};
use crate::metrics::record_shadow_copy;
use crate::storage::ScaledFile;

mod restore;

pub use restore::restore_file;

pub struct ShadowFile {
    path: PathBuf,
    file: File,
    original_len: u64,
    copied: HashSet<u64>,
    write_pos: u64,
    dirty: bool,
}

impl ShadowFile {
    /// Start a fresh log; `original_len` is the data file length at the last checkpoint.
    pub fn create(path: &Path, original_len: u64) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("create shadow file {}", path.display()))?;

        let mut hdr = [0u8; SHADOW_HDR_SIZE as usize];
        hdr[..8].copy_from_slice(SHADOW_MAGIC);
        LittleEndian::write_u64(&mut hdr[8..16], original_len);
        file.write_all(&hdr).map_err(io_op("write shadow header"))?;
        file.sync_all().map_err(io_op("sync shadow header"))?;

        debug!(
            "shadow: created {} (original_len={})",
            path.display(),
            original_len
        );
        Ok(Self {
            path: path.to_path_buf(),
            file,
            original_len,
            copied: HashSet::new(),
            write_pos: SHADOW_HDR_SIZE,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn original_len(&self) -> u64 {
        self.original_len
    }

    /// Bytes written to the log so far (header included).
    pub fn size(&self) -> u64 {
        self.write_pos
    }

    /// Capture the current bytes of [offset, offset+len) from `data` before they are overwritten.
    pub fn copy(&mut self, data: &mut dyn ScaledFile, offset: u64, len: u64) -> Result<()> {
        if len == 0 || offset >= self.original_len {
            return Ok(());
        }
        let end = (offset + len).min(self.original_len);
        let first = offset / SHADOW_PAGE_SIZE;
        let last = (end - 1) / SHADOW_PAGE_SIZE;

        let mut buf = Vec::new();
        for page in first..=last {
            if self.copied.contains(&page) {
                continue;
            }
            let p_off = page * SHADOW_PAGE_SIZE;
            let p_len = (SHADOW_PAGE_SIZE).min(self.original_len - p_off) as usize;
            buf.resize(p_len, 0);
            data.read_at(p_off, &mut buf)
                .map_err(io_at("shadow read before-image", p_off))?;
            self.append(p_off, &buf)?;
            self.copied.insert(page);
        }
        Ok(())
    }

    fn append(&mut self, offset: u64, payload: &[u8]) -> Result<()> {
        let mut hdr = [0u8; SHADOW_REC_HDR_SIZE];
        LittleEndian::write_u32(&mut hdr[0..4], payload.len() as u32);
        LittleEndian::write_u64(&mut hdr[4..12], offset);
        let crc = crc32c::crc32c_append(crc32c::crc32c(&hdr[..12]), payload);
        LittleEndian::write_u32(&mut hdr[12..16], crc);

        self.file
            .seek(SeekFrom::Start(self.write_pos))
            .map_err(io_at("shadow seek", self.write_pos))?;
        self.file
            .write_all(&hdr)
            .and_then(|_| self.file.write_all(payload))
            .map_err(io_at("shadow append", offset))?;
        self.write_pos += (SHADOW_REC_HDR_SIZE + payload.len()) as u64;
        self.dirty = true;
        record_shadow_copy(payload.len());
        Ok(())
    }

    /// Force appended records to stable storage.
    pub fn synch(&mut self) -> Result<()> {
        if self.dirty {
            self.file.sync_data().map_err(io_op("shadow sync"))?;
            self.dirty = false;
        }
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.synch()
    }

    /// Close and delete the log (checkpoint made it obsolete).
    pub fn discard(self) -> Result<()> {
        let path = self.path.clone();
        drop(self.file);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove shadow {}", path.display())),
        }
    }
}
