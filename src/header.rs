// src/header.rs: заголовок data-файла
//
// Формат первых 32 байт <base>.data (LE):
// [0]  MAGIC4 = "RQDF"
// [4]  u64 empty_size   (потерянные/свободные байты на момент checkpoint)
// [12] u64 free_pos     (логический конец выделенного пространства, в scale units)
// [20] u32 reserved
// [24] u32 space_root   (корень аллокатора в единицах FIXED_BLOCK_UNIT, 0 = нет)
// [28] u32 flags        (bit0 shadowed, bit1 saved, bit2 rowinfo, bit3 190, bit4 HX)
//
// Политика:
// - Файл без бита 190 или с битом HX не открывается (Format error до любой записи).
// - Бит saved снимается при первой модификации после open/checkpoint.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use byteorder::{ByteOrder, LittleEndian};

use crate::consts::{
    DATA_MAGIC, FLAG_190, FLAG_HX, FLAG_ISSAVED, FLAG_ISSHADOWED, FLAG_ROWINFO, HDR_OFF_EMPTY_SIZE,
    HDR_OFF_FLAGS, HDR_OFF_FREE_POS, HDR_OFF_MAGIC, HDR_OFF_RESERVED, HDR_OFF_SPACE_ROOT,
    INITIAL_FREE_POS,
};
use crate::error::{io_op, StorageError};
use crate::storage::ScaledFile;

pub const HEADER_SIZE: usize = INITIAL_FREE_POS as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFileHeader {
    pub empty_size: u64,
    /// В scale units.
    pub free_pos: u64,
    pub space_root: u32,
    pub flags: u32,
}

#[inline]
pub fn flag(flags: u32, bit: u32) -> bool {
    flags & (1 << bit) != 0
}

#[inline]
pub fn with_flag(flags: u32, bit: u32, on: bool) -> u32 {
    if on {
        flags | (1 << bit)
    } else {
        flags & !(1 << bit)
    }
}

impl DataFileHeader {
    /// Header of a brand new file: free position right after the header
    /// (or one scale unit, whichever is larger).
    pub fn new_file(scale: u32) -> Self {
        let first = INITIAL_FREE_POS.max(scale as u64);
        Self {
            empty_size: 0,
            free_pos: first.div_ceil(scale as u64),
            space_root: 0,
            flags: with_flag(0, FLAG_190, true),
        }
    }

    pub fn is_saved(&self) -> bool {
        flag(self.flags, FLAG_ISSAVED)
    }

    pub fn is_shadowed(&self) -> bool {
        flag(self.flags, FLAG_ISSHADOWED)
    }

    /// Row-info bit belongs to the table layer; the cache only carries it over.
    pub fn has_row_info(&self) -> bool {
        flag(self.flags, FLAG_ROWINFO)
    }

    /// Flags word of a consistent file: format bit and saved set, shadowed as
    /// given, row-info kept from the current word, everything else cleared.
    pub fn saved_flags(&self, shadowed: bool) -> u32 {
        let f = with_flag(0, FLAG_ROWINFO, self.has_row_info());
        with_flag(
            with_flag(with_flag(f, FLAG_190, true), FLAG_ISSAVED, true),
            FLAG_ISSHADOWED,
            shadowed,
        )
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut b = [0u8; HEADER_SIZE];
        b[HDR_OFF_MAGIC as usize..HDR_OFF_MAGIC as usize + 4].copy_from_slice(DATA_MAGIC);
        LittleEndian::write_u64(&mut b[HDR_OFF_EMPTY_SIZE as usize..], self.empty_size);
        LittleEndian::write_u64(&mut b[HDR_OFF_FREE_POS as usize..], self.free_pos);
        LittleEndian::write_u32(&mut b[HDR_OFF_RESERVED as usize..], 0);
        LittleEndian::write_u32(&mut b[HDR_OFF_SPACE_ROOT as usize..], self.space_root);
        LittleEndian::write_u32(&mut b[HDR_OFF_FLAGS as usize..], self.flags);
        b
    }

    /// Decode and validate magic / version flags.
    pub fn decode(b: &[u8]) -> Result<Self> {
        if b.len() < HEADER_SIZE {
            return Err(StorageError::Format(format!("header too short: {} bytes", b.len())).into());
        }
        if &b[HDR_OFF_MAGIC as usize..HDR_OFF_MAGIC as usize + 4] != DATA_MAGIC {
            return Err(StorageError::Format("bad data file magic".into()).into());
        }
        let h = Self {
            empty_size: LittleEndian::read_u64(&b[HDR_OFF_EMPTY_SIZE as usize..]),
            free_pos: LittleEndian::read_u64(&b[HDR_OFF_FREE_POS as usize..]),
            space_root: LittleEndian::read_u32(&b[HDR_OFF_SPACE_ROOT as usize..]),
            flags: LittleEndian::read_u32(&b[HDR_OFF_FLAGS as usize..]),
        };
        if flag(h.flags, FLAG_HX) {
            return Err(StorageError::Format("file uses the incompatible HX format".into()).into());
        }
        if !flag(h.flags, FLAG_190) {
            return Err(StorageError::Format("file predates the supported format version".into()).into());
        }
        Ok(h)
    }

    pub fn read(file: &mut dyn ScaledFile) -> Result<Self> {
        let mut b = [0u8; HEADER_SIZE];
        file.read_at(0, &mut b).map_err(io_op("read header"))?;
        Self::decode(&b)
    }

    pub fn write(&self, file: &mut dyn ScaledFile) -> Result<()> {
        file.write_at(0, &self.encode())
            .map_err(io_op("write header"))?;
        Ok(())
    }

    /// Прочитать заголовок напрямую с диска (до выбора backend'а).
    pub fn read_path(path: &Path) -> Result<Self> {
        let mut f = File::open(path).with_context(|| format!("open {}", path.display()))?;
        let mut b = [0u8; HEADER_SIZE];
        f.read_exact(&mut b)
            .map_err(io_op("read header"))
            .with_context(|| format!("read header of {}", path.display()))?;
        Self::decode(&b)
    }
}

/// Flags word only; used to clear the saved bit on first modification.
pub fn flags_bytes(flags: u32) -> [u8; 4] {
    let mut b = [0u8; 4];
    LittleEndian::write_u32(&mut b, flags);
    b
}
