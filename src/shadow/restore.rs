use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};

use crate::consts::{SHADOW_HDR_SIZE, SHADOW_MAGIC, SHADOW_REC_HDR_SIZE};
use crate::error::StorageError;
use crate::metrics::record_restore;

/// Undo everything written to `data_path` since the shadow log was started:
/// replay before-images in order, then cut the file back to its checkpoint length.
/// Returns the number of records applied; a missing log applies nothing.
pub fn restore_file(shadow_path: &Path, data_path: &Path) -> Result<usize> {
    if !shadow_path.exists() {
        debug!("shadow restore: {} not found, nothing to do", shadow_path.display());
        return Ok(0);
    }
    let mut src = OpenOptions::new()
        .read(true)
        .open(shadow_path)
        .with_context(|| format!("open shadow {}", shadow_path.display()))?;
    let len = src.metadata()?.len();
    if len < SHADOW_HDR_SIZE {
        warn!(
            "shadow restore: {} shorter than its header, ignored",
            shadow_path.display()
        );
        return Ok(0);
    }

    let mut hdr = [0u8; SHADOW_HDR_SIZE as usize];
    src.read_exact(&mut hdr)?;
    if &hdr[..8] != SHADOW_MAGIC {
        return Err(StorageError::Format(format!(
            "bad shadow magic in {}",
            shadow_path.display()
        ))
        .into());
    }
    let original_len = LittleEndian::read_u64(&hdr[8..16]);

    let mut dst = OpenOptions::new()
        .read(true)
        .write(true)
        .open(data_path)
        .with_context(|| format!("open data file {} for restore", data_path.display()))?;

    let mut pos = SHADOW_HDR_SIZE;
    let mut applied = 0usize;
    let mut payload = Vec::new();
    while pos + SHADOW_REC_HDR_SIZE as u64 <= len {
        src.seek(SeekFrom::Start(pos))?;
        let mut rh = [0u8; SHADOW_REC_HDR_SIZE];
        if src.read_exact(&mut rh).is_err() {
            break;
        }
        let rec_len = LittleEndian::read_u32(&rh[0..4]) as usize;
        let offset = LittleEndian::read_u64(&rh[4..12]);
        let crc_expected = LittleEndian::read_u32(&rh[12..16]);
        let total = SHADOW_REC_HDR_SIZE as u64 + rec_len as u64;
        if pos + total > len {
            debug!("shadow restore: partial record tail at off={}, stop", pos);
            break;
        }
        payload.resize(rec_len, 0);
        src.read_exact(&mut payload)?;
        let crc = crc32c::crc32c_append(crc32c::crc32c(&rh[..12]), &payload);
        if crc != crc_expected {
            // запись не была синхронизирована, основной файл её не видел
            warn!(
                "shadow restore: CRC mismatch at off={} (expected={}, actual={}), stop",
                pos, crc_expected, crc
            );
            break;
        }
        dst.seek(SeekFrom::Start(offset))?;
        dst.write_all(&payload)
            .with_context(|| format!("restore before-image at {}", offset))?;
        applied += 1;
        pos += total;
    }

    dst.set_len(original_len)
        .with_context(|| format!("truncate {} to {}", data_path.display(), original_len))?;
    dst.sync_all()?;
    record_restore();
    info!(
        "shadow restore: applied {} records from {}, data length {}",
        applied,
        shadow_path.display(),
        original_len
    );
    Ok(applied)
}
