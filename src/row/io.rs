//! Reusable scratch buffers for row (de)serialization.

use anyhow::Result;
use byteorder::{ByteOrder, LittleEndian};

use crate::consts::{INIT_IO_BUFFER_SIZE, ROW_SIZE_PREFIX};
use crate::error::StorageError;

/// Input buffer: holds the raw bytes of one row read from the file.
#[derive(Debug)]
pub struct RowInput {
    buf: Vec<u8>,
    pos: u64,
    size: usize,
    cursor: usize,
}

impl Default for RowInput {
    fn default() -> Self {
        Self {
            buf: vec![0u8; INIT_IO_BUFFER_SIZE],
            pos: 0,
            size: 0,
            cursor: 0,
        }
    }
}

impl RowInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepare for a row of `size` bytes at (scaled) `pos`.
    /// Growth failure surfaces as `OutOfMemory`.
    pub fn reset_row(&mut self, pos: u64, size: usize) -> Result<()> {
        if size > self.buf.len() {
            let extra = size - self.buf.len();
            self.buf
                .try_reserve_exact(extra)
                .map_err(|_| StorageError::OutOfMemory { pos })?;
            self.buf.resize(size, 0);
        }
        self.pos = pos;
        self.size = size;
        self.cursor = 0;
        Ok(())
    }

    /// Shrink back to the initial size after an oversized row.
    pub fn shrink(&mut self) {
        if self.buf.len() > INIT_IO_BUFFER_SIZE {
            self.buf.truncate(INIT_IO_BUFFER_SIZE);
            self.buf.shrink_to_fit();
        }
        self.size = self.size.min(self.buf.len());
        self.cursor = self.cursor.min(self.size);
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes of the current row (for the loader to fill).
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[..self.size]
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.size]
    }

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        let end = self.cursor + n;
        if end > self.size {
            return Err(StorageError::Format(format!(
                "row at {} truncated: need {} bytes, have {}",
                self.pos,
                end,
                self.size
            ))
            .into());
        }
        let s = &self.buf[self.cursor..end];
        self.cursor = end;
        Ok(s)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        Ok(self.take(n)?.to_vec())
    }

    /// Skip the leading storage-size prefix; returns it.
    pub fn read_size_prefix(&mut self) -> Result<u32> {
        debug_assert_eq!(self.cursor, 0);
        self.read_u32()
    }
}

/// Output buffer: a row serializes itself here before the save path writes it.
#[derive(Debug)]
pub struct RowOutput {
    buf: Vec<u8>,
    padding: u32,
}

impl RowOutput {
    pub fn new(padding: u32) -> Self {
        Self {
            buf: Vec::with_capacity(INIT_IO_BUFFER_SIZE),
            padding: padding.max(8),
        }
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Pre-grow for a row larger than the initial buffer.
    pub fn reserve_row(&mut self, size: usize) {
        if size > self.buf.capacity() {
            self.buf.reserve(size - self.buf.len());
        }
    }

    /// Drop an oversized allocation once the large row is written.
    pub fn shrink(&mut self) {
        if self.buf.capacity() > INIT_IO_BUFFER_SIZE * 4 {
            self.buf = Vec::with_capacity(INIT_IO_BUFFER_SIZE);
        }
    }

    pub fn padding(&self) -> u32 {
        self.padding
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u32(&mut self, v: u32) {
        let mut b = [0u8; 4];
        LittleEndian::write_u32(&mut b, v);
        self.buf.extend_from_slice(&b);
    }

    pub fn write_u64(&mut self, v: u64) {
        let mut b = [0u8; 8];
        LittleEndian::write_u64(&mut b, v);
        self.buf.extend_from_slice(&b);
    }

    pub fn write_bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    /// Zero-fill up to `storage_size`; a row that wrote more than it declared is an error.
    pub fn pad_to(&mut self, storage_size: u32) -> Result<()> {
        let want = storage_size as usize;
        if self.buf.len() > want {
            return Err(StorageError::Integrity(format!(
                "row serialized {} bytes but declares storage size {}",
                self.buf.len(),
                want
            ))
            .into());
        }
        self.buf.resize(want, 0);
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

/// Storage size for `raw` serialized bytes (including the size prefix),
/// rounded up to the row padding.
pub fn padded_size(raw: usize, padding: u32) -> u32 {
    let p = padding.max(8) as usize;
    let raw = raw.max(ROW_SIZE_PREFIX);
    (raw.div_ceil(p) * p) as u32
}
