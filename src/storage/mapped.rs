use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use memmap2::MmapMut;

use super::{ScaledFile, StorageKind};

/// Шаг роста отображения.
const GROWTH_STEP: u64 = 1 << 20;

/// Memory-mapped backend; the map covers the whole physical file and is
/// re-created after every growth.
pub struct MappedFile {
    file: File,
    map: Option<MmapMut>,
    capacity: u64,
    max_bytes: u64,
}

impl MappedFile {
    pub fn open(path: &Path, max_bytes: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        let capacity = file.metadata()?.len();
        let map = if capacity > 0 {
            Some(unsafe { MmapMut::map_mut(&file)? })
        } else {
            None
        };
        Ok(Self {
            file,
            map,
            capacity,
            max_bytes,
        })
    }

    fn range(&self, pos: u64, len: usize) -> io::Result<std::ops::Range<usize>> {
        let end = pos
            .checked_add(len as u64)
            .filter(|e| *e <= self.capacity)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("mapped access {}+{} past end {}", pos, len, self.capacity),
                )
            })?;
        Ok(pos as usize..end as usize)
    }
}

impl ScaledFile for MappedFile {
    fn kind(&self) -> StorageKind {
        StorageKind::Mapped
    }

    fn length(&self) -> io::Result<u64> {
        Ok(self.capacity)
    }

    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let r = self.range(pos, buf.len())?;
        match &self.map {
            Some(m) => {
                buf.copy_from_slice(&m[r]);
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "empty mapping")),
        }
    }

    fn write_at(&mut self, pos: u64, buf: &[u8]) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let r = self.range(pos, buf.len())?;
        match &mut self.map {
            Some(m) => {
                m[r].copy_from_slice(buf);
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "empty mapping")),
        }
    }

    fn ensure_length(&mut self, len: u64) -> io::Result<bool> {
        if len <= self.capacity {
            return Ok(true);
        }
        if len > self.max_bytes {
            return Ok(false);
        }
        let mut new_capacity = self.capacity.max(GROWTH_STEP);
        while new_capacity < len {
            new_capacity = new_capacity.saturating_add(GROWTH_STEP);
        }
        let new_capacity = new_capacity.min(self.max_bytes).max(len);

        if let Some(m) = self.map.take() {
            m.flush()?;
        }
        self.file.set_len(new_capacity)?;
        self.map = Some(unsafe { MmapMut::map_mut(&self.file)? });
        self.capacity = new_capacity;
        Ok(true)
    }

    fn synch(&mut self) -> io::Result<()> {
        if let Some(m) = &self.map {
            m.flush()?;
        }
        self.file.sync_all()
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        if let Some(m) = &self.map {
            let _ = m.flush();
        }
    }
}
