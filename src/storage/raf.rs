use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::{ScaledFile, StorageKind};

/// Plain file backend.
pub struct RafFile {
    file: File,
    readonly: bool,
}

impl RafFile {
    pub fn open(path: &Path, readonly: bool) -> io::Result<Self> {
        let file = if readonly {
            OpenOptions::new().read(true).open(path)?
        } else {
            OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(path)?
        };
        Ok(Self { file, readonly })
    }
}

impl ScaledFile for RafFile {
    fn kind(&self) -> StorageKind {
        StorageKind::Raf
    }

    fn length(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.read_exact(buf)
    }

    fn write_at(&mut self, pos: u64, buf: &[u8]) -> io::Result<()> {
        if self.readonly {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "read-only data file",
            ));
        }
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.write_all(buf)
    }

    fn ensure_length(&mut self, len: u64) -> io::Result<bool> {
        if self.file.metadata()?.len() < len {
            if self.readonly {
                return Ok(false);
            }
            self.file.set_len(len)?;
        }
        Ok(true)
    }

    fn synch(&mut self) -> io::Result<()> {
        if self.readonly {
            return Ok(());
        }
        self.file.sync_all()
    }
}
