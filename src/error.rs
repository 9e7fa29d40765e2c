//! Typed storage failures.
//!
//! Everything public returns `anyhow::Result`; the failures callers must tell
//! apart travel inside the `anyhow::Error` as a `StorageError` and are recovered
//! with `downcast_ref` (see [`StorageError::of`]).

use std::io;

use thiserror::Error;

use crate::datafile::Lifecycle;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Eviction could not make room; the caller must abort its operation.
    #[error("data cache is full (rows={rows}, bytes={bytes})")]
    CacheFull { rows: usize, bytes: u64 },

    /// The data file would grow past its configured maximum.
    #[error("data file is full (requested end {requested}, max {max})")]
    FileFull { requested: u64, max: u64 },

    /// Row materialisation ran out of memory; retried once after a purge.
    #[error("out of memory while loading row at position {pos}")]
    OutOfMemory { pos: u64 },

    /// Second failure to materialise a row; carries what was read for diagnostics.
    #[error("failed to load row at position {pos} ({} bytes read)", partial.len())]
    RowLoad { pos: u64, partial: Vec<u8> },

    #[error("I/O error in {op} (position {pos:?}): {source}")]
    Io {
        op: &'static str,
        pos: Option<u64>,
        #[source]
        source: io::Error,
    },

    /// Space allocator metadata disagrees with the file; never repaired automatically.
    #[error("space manager integrity violation: {0}")]
    Integrity(String),

    /// Wrong magic / version flags; raised before anything is written.
    #[error("unsupported data file format: {0}")]
    Format(String),

    #[error("data file is not open (state {0:?})")]
    NotOpen(Lifecycle),

    #[error("data file is read-only")]
    ReadOnly,

    /// Checkpoint artifacts were rolled back; the previous checkpoint still holds.
    #[error("checkpoint failed, previous checkpoint retained: {0}")]
    CheckpointFailed(String),
}

impl StorageError {
    pub fn io(op: &'static str, pos: Option<u64>, source: io::Error) -> Self {
        StorageError::Io { op, pos, source }
    }

    /// Найти StorageError внутри anyhow-цепочки (если есть).
    pub fn of(err: &anyhow::Error) -> Option<&StorageError> {
        err.chain().find_map(|e| e.downcast_ref::<StorageError>())
    }

    /// Cache full / file full: non-retriable at this layer.
    pub fn is_capacity(err: &anyhow::Error) -> bool {
        matches!(
            Self::of(err),
            Some(StorageError::CacheFull { .. }) | Some(StorageError::FileFull { .. })
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, StorageError::Integrity(_) | StorageError::RowLoad { .. })
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, StorageError::CheckpointFailed(_))
    }
}

/// `map_err` helper: wrap an io::Error with the operation name and position.
/// The failure is logged here, once, with the operation and position.
pub(crate) fn io_at(op: &'static str, pos: u64) -> impl FnOnce(io::Error) -> StorageError {
    move |e| {
        log::error!("{} at {}: {}", op, pos, e);
        StorageError::io(op, Some(pos), e)
    }
}

pub(crate) fn io_op(op: &'static str) -> impl FnOnce(io::Error) -> StorageError {
    move |e| {
        log::error!("{}: {}", op, e);
        StorageError::io(op, None, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_through_anyhow() {
        let e: anyhow::Error = StorageError::CacheFull { rows: 2, bytes: 10 }.into();
        assert!(StorageError::is_capacity(&e));

        let e = anyhow::Error::from(StorageError::Integrity("bad root".into()))
            .context("open space manager");
        assert!(!StorageError::is_capacity(&e));
        assert!(StorageError::of(&e).map(|s| s.is_fatal()).unwrap_or(false));

        let e: anyhow::Error = StorageError::CheckpointFailed("disk full".into()).into();
        assert!(StorageError::of(&e).unwrap().is_recoverable());
    }
}
