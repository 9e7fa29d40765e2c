//! Full (non-incremental) backup of the data file.
//!
//! - `write_backup`: gzip <base>.data в <base>.backup.new, fsync, rename поверх <base>.backup.
//!   При ошибке .new удаляется, старый backup остаётся.
//! - `restore_backup`: распаковать <base>.backup поверх <base>.data.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{info, warn};

use crate::metrics::{record_backup_written, record_restore};

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
    }
}

fn compress_into(data_path: &Path, tmp_path: &Path) -> Result<u64> {
    let src = File::open(data_path).with_context(|| format!("open {}", data_path.display()))?;
    let dst = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(tmp_path)
        .with_context(|| format!("create {}", tmp_path.display()))?;
    let mut enc = GzEncoder::new(BufWriter::new(dst), Compression::fast());
    let n = io::copy(&mut BufReader::new(src), &mut enc)
        .with_context(|| format!("compress {}", data_path.display()))?;
    let mut w = enc.finish().context("finish gzip stream")?;
    w.flush()?;
    let f = w.into_inner().map_err(|e| e.into_error())?;
    f.sync_all()?;
    Ok(n)
}

/// Write a compressed copy of `data_path` to `backup_path` atomically (tmp + rename).
pub fn write_backup(data_path: &Path, backup_path: &Path, tmp_path: &Path) -> Result<()> {
    match compress_into(data_path, tmp_path) {
        Ok(n) => {
            fs::rename(tmp_path, backup_path).with_context(|| {
                format!("rename {} -> {}", tmp_path.display(), backup_path.display())
            })?;
            record_backup_written();
            info!("backup: {} bytes of {} saved", n, data_path.display());
            Ok(())
        }
        Err(e) => {
            warn!("backup: failed, removing {}: {:#}", tmp_path.display(), e);
            let _ = remove_if_exists(tmp_path);
            Err(e)
        }
    }
}

/// Replace `data_path` with the decompressed content of `backup_path`.
/// Returns false when there is no backup to restore.
pub fn restore_backup(backup_path: &Path, data_path: &Path) -> Result<bool> {
    if !backup_path.exists() {
        return Ok(false);
    }
    let src = File::open(backup_path)
        .with_context(|| format!("open backup {}", backup_path.display()))?;
    let dst = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(data_path)
        .with_context(|| format!("open {} for restore", data_path.display()))?;
    let mut dec = GzDecoder::new(BufReader::new(src));
    let mut w = BufWriter::new(dst);
    let n = io::copy(&mut dec, &mut w)
        .with_context(|| format!("decompress {}", backup_path.display()))?;
    w.flush()?;
    w.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    record_restore();
    info!(
        "backup: restored {} bytes into {} from {}",
        n,
        data_path.display(),
        backup_path.display()
    );
    Ok(true)
}
