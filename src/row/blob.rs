use std::any::Any;
use std::sync::Arc;

use anyhow::Result;

use super::{padded_size, CachedObject, RowInput, RowOutput, RowRef, RowReader, RowState};
use crate::error::StorageError;

/// Generic opaque row: `[storage size u32][payload len u32][payload][pad]`.
#[derive(Debug)]
pub struct BlobRow {
    state: RowState,
    size: u32,
    payload: Vec<u8>,
}

impl BlobRow {
    /// New in-memory row (new + changed, no position yet).
    pub fn new(payload: Vec<u8>, padding: u32) -> Arc<Self> {
        Arc::new(Self {
            state: RowState::fresh(),
            size: padded_size(8 + payload.len(), padding),
            payload,
        })
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

impl CachedObject for BlobRow {
    fn state(&self) -> &RowState {
        &self.state
    }

    fn storage_size(&self) -> u32 {
        self.size
    }

    fn write(&self, out: &mut RowOutput) -> Result<()> {
        out.write_u32(self.size);
        out.write_u32(self.payload.len() as u32);
        out.write_bytes(&self.payload);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BlobReader;

impl RowReader for BlobReader {
    fn read_row(&self, input: &mut RowInput) -> Result<RowRef> {
        let size = input.read_size_prefix()?;
        let len = input.read_u32()? as usize;
        if 8 + len > size as usize {
            return Err(StorageError::Format(format!(
                "blob at {}: payload {} exceeds storage size {}",
                input.pos(),
                len,
                size
            ))
            .into());
        }
        let payload = input.read_bytes(len)?;
        Ok(Arc::new(BlobRow {
            state: RowState::loaded(input.pos()),
            size,
            payload,
        }))
    }
}
