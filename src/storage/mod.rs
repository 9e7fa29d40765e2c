//! storage: random-access file backends for the data file.
//!
//! Все позиции здесь в байтах; масштабирование (scale units) делает datafile.
//! Backend выбирается при открытии конфигурацией:
//! - `RafFile`: обычный std::fs::File (seek + read/write).
//! - `MappedFile`: memmap2 поверх файла; при росте сверх `nio_max_bytes`
//!   `ensure_length` возвращает false, и datafile переключается на RAF.

use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use byteorder::{ByteOrder, LittleEndian};

use crate::config::StoreConfig;

pub mod mapped;
pub mod raf;

pub use mapped::MappedFile;
pub use raf::RafFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Raf,
    Mapped,
}

/// Contract of the data file handle consumed by the cache.
pub trait ScaledFile: Send + Sync {
    fn kind(&self) -> StorageKind;

    fn length(&self) -> io::Result<u64>;

    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<()>;

    fn write_at(&mut self, pos: u64, buf: &[u8]) -> io::Result<()>;

    /// Grow the physical file to at least `len` bytes.
    /// Ok(false) means this backend cannot cover `len` and must be replaced.
    fn ensure_length(&mut self, len: u64) -> io::Result<bool>;

    /// Force written data to stable storage.
    fn synch(&mut self) -> io::Result<()>;

    fn read_u32_at(&mut self, pos: u64) -> io::Result<u32> {
        let mut b = [0u8; 4];
        self.read_at(pos, &mut b)?;
        Ok(LittleEndian::read_u32(&b))
    }

    fn read_u64_at(&mut self, pos: u64) -> io::Result<u64> {
        let mut b = [0u8; 8];
        self.read_at(pos, &mut b)?;
        Ok(LittleEndian::read_u64(&b))
    }

    fn write_u32_at(&mut self, pos: u64, v: u32) -> io::Result<()> {
        let mut b = [0u8; 4];
        LittleEndian::write_u32(&mut b, v);
        self.write_at(pos, &b)
    }

    fn write_u64_at(&mut self, pos: u64, v: u64) -> io::Result<()> {
        let mut b = [0u8; 8];
        LittleEndian::write_u64(&mut b, v);
        self.write_at(pos, &b)
    }
}

/// Open the data file with the backend the configuration asks for.
/// Read-only sessions always use RAF.
pub fn open_storage(path: &Path, cfg: &StoreConfig, readonly: bool) -> Result<Box<dyn ScaledFile>> {
    if cfg.nio && !readonly {
        let len = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        if len <= cfg.nio_max_bytes {
            let f = MappedFile::open(path, cfg.nio_max_bytes)
                .with_context(|| format!("open mapped data file {}", path.display()))?;
            log::debug!("storage: mapped backend for {}", path.display());
            return Ok(Box::new(f));
        }
        log::info!(
            "storage: {} is larger than nio_max_bytes ({}), using RAF",
            path.display(),
            cfg.nio_max_bytes
        );
    }
    let f = RafFile::open(path, readonly)
        .with_context(|| format!("open data file {}", path.display()))?;
    Ok(Box::new(f))
}
