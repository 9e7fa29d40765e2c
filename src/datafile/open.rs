//! Open / close of a DataFileCache session.
//!
//! Open:
//! 1) lock (exclusive, shared for read-only);
//! 2) существующий файл без saved-бита восстанавливается: из shadow-лога, если
//!    заголовок помечен shadowed, иначе из gzip-backup; read-only такой файл не открывает;
//! 3) формат проверяется до любой записи;
//! 4) новый файл получает заголовок (и метаданные blocks-аллокатора, если включён);
//! 5) space manager: blocks, если в заголовке есть root, иначе simple.

use std::fs;
use std::io;

use anyhow::{anyhow, Context, Result};
use log::{info, warn};

use super::checkpoint::commit;
use super::{CacheCore, CacheState, DataFileCache, FileIo, Lifecycle};
use crate::backup::{restore_backup, write_backup};
use crate::consts::INITIAL_FREE_POS;
use crate::header::DataFileHeader;
use crate::lock::{try_acquire, LockMode};
use crate::shadow::restore_file;
use crate::space::{BlockSpaceManager, DataSpaceManager, SimpleSpaceManager};
use crate::storage::open_storage;

fn remove_if_exists(path: &std::path::Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
    }
}

impl DataFileCache {
    pub fn open(&self, readonly: bool) -> Result<()> {
        let mut st = self.write();
        match st.lifecycle {
            Lifecycle::Closed | Lifecycle::Error => {}
            other => return Err(anyhow!("open: data file is already {:?}", other)),
        }
        st.core = None;
        st.space = None;
        // lock прошлой сессии (из Error) держит flock на том же .lck
        st.lock = None;
        st.lifecycle = Lifecycle::Opening;

        let res = try_acquire(&self.files.lock, LockMode::for_readonly(readonly)).and_then(|lock| {
            st.lock = Some(lock);
            self.open_files(&mut st, readonly)
        });
        match res {
            Ok(()) => {
                st.lifecycle = Lifecycle::Open;
                info!(
                    "opened {} (readonly={}, new={})",
                    self.files.data.display(),
                    readonly,
                    st.is_new
                );
                Ok(())
            }
            Err(e) => {
                st.space = None;
                st.core = None;
                st.lock = None;
                st.lifecycle = Lifecycle::Closed;
                Err(e)
            }
        }
    }

    /// Everything after the lock; also used to reopen after defrag.
    pub(super) fn open_files(&self, st: &mut CacheState, readonly: bool) -> Result<()> {
        let files = &self.files;
        let cfg = &self.cfg;
        let len = fs::metadata(&files.data).map(|m| m.len()).unwrap_or(0);
        let is_new = len <= INITIAL_FREE_POS;

        if is_new {
            if readonly {
                return Err(anyhow!(
                    "data file {} does not exist (read-only open)",
                    files.data.display()
                ));
            }
            if len > 0 {
                warn!("{} holds only {} bytes, starting a new file", files.data.display(), len);
                fs::remove_file(&files.data)
                    .with_context(|| format!("remove {}", files.data.display()))?;
            }
            remove_if_exists(&files.backup)?;
        } else {
            self.recover_if_needed(readonly)?;
        }

        let file = open_storage(&files.data, cfg, readonly)?;
        let header = if is_new {
            DataFileHeader::new_file(cfg.data_file_scale)
        } else {
            DataFileHeader::read_path(&files.data)?
        };
        let shadow_path = cfg.incremental_backup.then(|| files.backup.clone());
        let mut io = FileIo::new(&files.data, shadow_path, cfg, file, header, readonly);
        if is_new {
            io.format_new()?;
        }
        let mut core = CacheCore::new(cfg, io);

        let fbs = cfg.file_block_size();
        let cap = cfg.max_free_blocks;
        let root = core.io.header().space_root;
        let mut space: Box<dyn DataSpaceManager> = if root != 0 {
            Box::new(BlockSpaceManager::open(&mut core, root, fbs, cap)?)
        } else if is_new && cfg.space_blocks {
            let mut m = BlockSpaceManager::create(&mut core, fbs, cap)?;
            commit(&mut core, &mut m)?;
            Box::new(m)
        } else {
            Box::new(SimpleSpaceManager::new(
                cfg.data_file_scale,
                cap,
                core.io.header().empty_size,
                fbs,
            ))
        };
        space.initialise_spaces(&mut core)?;

        if !readonly && !cfg.incremental_backup && (is_new || !files.backup.exists()) {
            write_backup(&files.data, &files.backup, &files.backup_tmp)?;
        }

        st.initial_free_pos = core.free_pos();
        st.is_new = is_new;
        st.readonly = readonly;
        st.core = Some(core);
        st.space = Some(space);
        Ok(())
    }

    /// Crash recovery before the data file is opened for real.
    fn recover_if_needed(&self, readonly: bool) -> Result<()> {
        let files = &self.files;
        let h = DataFileHeader::read_path(&files.data)?;
        if h.is_saved() {
            if self.cfg.incremental_backup && !readonly {
                // лог прошлой сессии устарел: checkpoint успел записаться
                remove_if_exists(&files.backup)?;
            }
            return Ok(());
        }
        if readonly {
            return Err(anyhow!(
                "data file {} was not closed cleanly; open it writable to recover",
                files.data.display()
            ));
        }
        if h.is_shadowed() {
            if files.backup.exists() {
                let n = restore_file(&files.backup, &files.data)?;
                info!("recovered {} from shadow log ({} pages)", files.data.display(), n);
                remove_if_exists(&files.backup)?;
            } else {
                warn!(
                    "{} is unsaved and shadowed but {} is missing",
                    files.data.display(),
                    files.backup.display()
                );
            }
        } else if restore_backup(&files.backup, &files.data)? {
            info!("recovered {} from full backup", files.data.display());
        } else {
            warn!(
                "{} is unsaved and has no backup to restore",
                files.data.display()
            );
        }
        DataFileHeader::read_path(&files.data)?;
        Ok(())
    }

    /// Close the session. `write` saves everything (checkpoint); otherwise
    /// unsaved work is dropped and the shadow log stays for the next open.
    pub fn close(&self, write: bool) -> Result<()> {
        let mut st = self.write();
        let was = st.lifecycle;
        match was {
            Lifecycle::Closed => return Ok(()),
            Lifecycle::Open | Lifecycle::Error => {}
            other => return Err(anyhow!("close: data file is {:?}", other)),
        }
        st.lifecycle = Lifecycle::Closing;

        let save = write && !st.readonly && was == Lifecycle::Open;
        if write && was == Lifecycle::Error {
            warn!("closing {} after an error, nothing saved", self.files.data.display());
        }
        let readonly = st.readonly;
        let res = if save {
            self.commit_and_backup(&mut st)
        } else {
            match st.core.as_mut() {
                Some(core) if !readonly => core.io.abandon(),
                _ => Ok(()),
            }
        };
        if let Err(e) = res {
            st.lifecycle = Lifecycle::Error;
            return Err(e);
        }

        let untouched = st.is_new
            && st
                .core
                .as_ref()
                .map(|c| c.free_pos() == st.initial_free_pos)
                .unwrap_or(false);
        st.space = None;
        st.core = None;
        if save && untouched {
            remove_if_exists(&self.files.data)?;
            remove_if_exists(&self.files.backup)?;
            info!("{} was never used, files removed", self.files.data.display());
        }
        st.lock = None;
        st.lifecycle = Lifecycle::Closed;
        Ok(())
    }
}
