//! Defragmentation: copy live rows into `<base>.data.new`, then swap files.
//!
//! Живые строки знает только владелец (DefragSource); ядро копирует их байты
//! как есть (в новый файл, в table space DEFAULT), отдаёт карту old -> new и
//! переоткрывает файл. До rename любая ошибка откатывается удалением .new.

use std::collections::BTreeMap;
use std::fs;

use anyhow::{Context, Result};
use log::{info, warn};
use serde::Serialize;

use super::checkpoint::commit;
use super::{CacheCore, CacheState, DataFileCache, FileIo, Lifecycle};
use crate::backup::write_backup;
use crate::consts::TABLE_ID_DEFAULT;
use crate::error::StorageError;
use crate::header::DataFileHeader;
use crate::metrics::record_defrag;
use crate::space::{BlockSpaceManager, DataSpaceManager, SimpleSpaceManager};
use crate::storage::RafFile;

/// Owner of the rows being defragmented. It must not call back into the
/// cache: the cache is locked for the whole run.
pub trait DefragSource {
    /// Live rows as (position, storage size).
    fn live_rows(&self) -> Vec<(u64, u32)>;

    /// Rewrite references after the swap.
    fn apply_moves(&mut self, moves: &BTreeMap<u64, u64>) -> Result<()>;
}

#[derive(Debug, Clone, Serialize)]
pub struct DefragReport {
    pub rows_moved: usize,
    pub old_end_bytes: u64,
    pub new_end_bytes: u64,
}

impl DataFileCache {
    pub fn defrag(&self, source: &mut dyn DefragSource) -> Result<DefragReport> {
        let mut st = self.write();
        self.checkpoint_locked(&mut st)?;
        st.lifecycle = Lifecycle::Defragmenting;

        let old_end = match st.core.as_ref() {
            Some(c) => c.free_pos() * c.scale() as u64,
            None => 0,
        };
        let (moves, new_end) = match self.copy_live_rows(&mut st, &*source) {
            Ok(r) => r,
            Err(e) => {
                warn!("defrag of {} abandoned: {:#}", self.files.data.display(), e);
                let _ = fs::remove_file(&self.files.data_new);
                st.lifecycle = Lifecycle::Open;
                return Err(e);
            }
        };

        // swap
        st.space = None;
        st.core = None;
        if let Err(e) = self.swap_files() {
            warn!("defrag swap of {} failed: {:#}", self.files.data.display(), e);
            let _ = fs::remove_file(&self.files.data_new);
            st.lifecycle = Lifecycle::Error;
            return Err(e);
        }
        if let Err(e) = self.open_files(&mut st, false) {
            st.lifecycle = Lifecycle::Error;
            return Err(e);
        }
        st.lifecycle = Lifecycle::Open;

        source.apply_moves(&moves)?;
        fs::remove_file(&self.files.data_old)
            .with_context(|| format!("remove {}", self.files.data_old.display()))?;
        if !self.cfg.incremental_backup {
            write_backup(&self.files.data, &self.files.backup, &self.files.backup_tmp)?;
        }
        record_defrag();
        info!(
            "defrag of {}: {} rows, {} -> {} bytes",
            self.files.data.display(),
            moves.len(),
            old_end,
            new_end
        );
        Ok(DefragReport {
            rows_moved: moves.len(),
            old_end_bytes: old_end,
            new_end_bytes: new_end,
        })
    }

    fn copy_live_rows(
        &self,
        st: &mut CacheState,
        source: &dyn DefragSource,
    ) -> Result<(BTreeMap<u64, u64>, u64)> {
        let cfg = &self.cfg;
        let lifecycle = st.lifecycle;
        let (old_core, old_space) = match (st.core.as_mut(), st.space.as_ref()) {
            (Some(c), Some(s)) => (c, s),
            _ => return Err(StorageError::NotOpen(lifecycle).into()),
        };
        let multi = old_space.is_multi_space();

        let _ = fs::remove_file(&self.files.data_new);
        let file = RafFile::open(&self.files.data_new, false)
            .with_context(|| format!("create {}", self.files.data_new.display()))?;
        let header = DataFileHeader::new_file(cfg.data_file_scale);
        let mut io = FileIo::new(&self.files.data_new, None, cfg, Box::new(file), header, false);
        io.format_new()?;
        let mut core = CacheCore::new(cfg, io);

        let fbs = cfg.file_block_size();
        let mut space: Box<dyn DataSpaceManager> = if multi {
            Box::new(BlockSpaceManager::create(&mut core, fbs, cfg.max_free_blocks)?)
        } else {
            Box::new(SimpleSpaceManager::new(cfg.data_file_scale, cfg.max_free_blocks, 0, fbs))
        };

        let mut rows = source.live_rows();
        rows.sort_unstable();
        let mut moves = BTreeMap::new();
        for (pos, size) in rows {
            let bytes = old_core.io.read_raw(pos)?;
            if bytes.len() != size as usize {
                return Err(StorageError::Integrity(format!(
                    "live row at {} is stored with {} bytes, owner says {}",
                    pos,
                    bytes.len(),
                    size
                ))
                .into());
            }
            let new_pos = space.allocate(&mut core, TABLE_ID_DEFAULT, size)?;
            core.io.write_raw(new_pos, &bytes)?;
            moves.insert(pos, new_pos);
        }
        commit(&mut core, space.as_mut())?;
        core.io.synch()?;
        let new_end = core.free_pos() * core.scale() as u64;
        Ok((moves, new_end))
    }

    fn swap_files(&self) -> Result<()> {
        let f = &self.files;
        fs::rename(&f.data, &f.data_old)
            .with_context(|| format!("rename {} -> {}", f.data.display(), f.data_old.display()))?;
        if let Err(e) = fs::rename(&f.data_new, &f.data) {
            let _ = fs::rename(&f.data_old, &f.data);
            return Err(e)
                .with_context(|| format!("rename {} -> {}", f.data_new.display(), f.data.display()));
        }
        Ok(())
    }
}
