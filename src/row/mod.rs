//! row: the cached-object model.
//!
//! Ядро не знает формата строк: объект отдаёт позицию, размер хранения,
//! флаги (через `RowState`) и умеет сериализоваться в `RowOutput`.
//! Чтение с диска делает внешний `RowReader`.

use std::any::Any;
use std::sync::Arc;

use anyhow::Result;

use crate::error::StorageError;

pub mod blob;
pub mod io;
pub mod state;

pub use blob::{BlobReader, BlobRow};
pub use io::{padded_size, RowInput, RowOutput};
pub use state::RowState;

/// A row (or allocator metadata object) that can live in the row cache.
pub trait CachedObject: Send + Sync + 'static {
    fn state(&self) -> &RowState;

    /// Bytes occupied in the file, including the leading u32 size, padded.
    fn storage_size(&self) -> u32;

    /// Serialize the whole row: u32 storage size first, then the body.
    /// The save path pads the output to `storage_size()`.
    fn write(&self, out: &mut RowOutput) -> Result<()>;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    fn pos(&self) -> Option<u64> {
        self.state().pos()
    }

    fn is_in_memory(&self) -> bool {
        self.state().is_in_memory()
    }

    fn has_changed(&self) -> bool {
        self.state().has_changed()
    }

    fn is_kept(&self) -> bool {
        self.state().is_kept()
    }

    /// Pin/unpin; see `RowState::keep_in_memory`.
    fn keep_in_memory(&self, keep: bool) -> bool {
        self.state().keep_in_memory(keep)
    }
}

impl std::fmt::Debug for dyn CachedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedObject")
            .field("pos", &self.pos())
            .field("storage_size", &self.storage_size())
            .finish()
    }
}

pub type RowRef = Arc<dyn CachedObject>;

/// Deserializer supplied by the table layer.
pub trait RowReader: Send + Sync {
    /// Build a row from `input` (already filled, `input.pos()` is its position).
    fn read_row(&self, input: &mut RowInput) -> Result<RowRef>;
}

/// Position of an object that the cache is about to index.
pub(crate) fn require_pos(row: &dyn CachedObject) -> Result<u64> {
    row.pos().ok_or_else(|| {
        StorageError::Integrity("cached object has no file position".into()).into()
    })
}

/// Concrete type of a cached row; mismatch means two object kinds share a position.
pub fn downcast_row<T: CachedObject>(row: RowRef) -> Result<Arc<T>> {
    let pos = row.pos();
    row.into_any().downcast::<T>().map_err(|_| {
        StorageError::Integrity(format!(
            "object at position {:?} is not a {}",
            pos,
            std::any::type_name::<T>()
        ))
        .into()
    })
}
