//! Checkpoint: all dirty rows and allocator state on disk, header saved.
//!
//! Порядок:
//! 1) space.reset (in-memory свободные списки -> битмапы);
//! 2) save_all (строки и метаданные, пачками по позиции);
//! 3) заголовок: empty_size, free_pos, root, saved; sync; shadow удаляется;
//! 4) full backup (если incremental выключен): при ошибке предыдущий backup цел,
//!    ошибка CheckpointFailed, сессия остаётся открытой.

use anyhow::Result;
use log::{error, info};

use super::{CacheCore, CacheState, DataFileCache, Lifecycle};
use crate::backup::write_backup;
use crate::error::StorageError;
use crate::metrics::record_checkpoint;
use crate::space::DataSpaceManager;

/// Persist cache and allocator state and write a saved header.
pub(crate) fn commit(core: &mut CacheCore, space: &mut dyn DataSpaceManager) -> Result<()> {
    space.reset(core)?;
    core.save_all()?;
    let lost = space.lost_blocks_size(core)?;
    core.io.commit_header(lost, space.root_position())?;
    space.initialise_spaces(core)?;
    Ok(())
}

impl DataFileCache {
    pub fn checkpoint(&self) -> Result<()> {
        let mut st = self.write();
        self.checkpoint_locked(&mut st)
    }

    pub(super) fn checkpoint_locked(&self, st: &mut CacheState) -> Result<()> {
        if st.readonly {
            return Err(StorageError::ReadOnly.into());
        }
        if st.lifecycle != Lifecycle::Open {
            return Err(st.not_open());
        }
        st.lifecycle = Lifecycle::Checkpointing;
        match self.commit_and_backup(st) {
            Ok(()) => {
                st.lifecycle = Lifecycle::Open;
                record_checkpoint();
                info!("checkpoint of {} done", self.files.data.display());
                Ok(())
            }
            Err(e) => {
                let recoverable = StorageError::of(&e)
                    .map(|s| s.is_recoverable())
                    .unwrap_or(false);
                st.lifecycle = if recoverable {
                    Lifecycle::Open
                } else {
                    error!("checkpoint of {} failed: {:#}", self.files.data.display(), e);
                    Lifecycle::Error
                };
                Err(e)
            }
        }
    }

    /// Commit plus the full backup; lifecycle is the caller's business.
    pub(super) fn commit_and_backup(&self, st: &mut CacheState) -> Result<()> {
        {
            let core = st.core.as_mut().ok_or_else(|| st_not_open())?;
            let space = st.space.as_mut().ok_or_else(|| st_not_open())?;
            commit(core, space.as_mut())?;
        }
        if !self.cfg.incremental_backup {
            write_backup(&self.files.data, &self.files.backup, &self.files.backup_tmp)
                .map_err(|e| StorageError::CheckpointFailed(format!("{:#}", e)))?;
        }
        Ok(())
    }
}

fn st_not_open() -> anyhow::Error {
    StorageError::NotOpen(Lifecycle::Closed).into()
}
