//! Process lock for an open data file.
//!
//! fs2 advisory lock on `<base>.lck`:
//! - Exclusive: writer session, one per data file.
//! - Shared: read-only sessions may coexist.
//!
//! Lock is released on Drop (закрытие файла = освобождение).

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    pub fn for_readonly(readonly: bool) -> Self {
        if readonly {
            LockMode::Shared
        } else {
            LockMode::Exclusive
        }
    }
}

pub struct LockGuard {
    file: File,
    path: PathBuf,
    mode: LockMode,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .finish()
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("open lock file {}", path.display()))
}

/// Take the lock without blocking; a second writer on the same file fails fast.
pub fn try_acquire(path: &Path, mode: LockMode) -> Result<LockGuard> {
    let file = open_lock_file(path)?;
    match mode {
        LockMode::Shared => file
            .try_lock_shared()
            .with_context(|| format!("data file is locked by another process: {}", path.display()))?,
        LockMode::Exclusive => file
            .try_lock_exclusive()
            .with_context(|| format!("data file is locked by another process: {}", path.display()))?,
    }
    Ok(LockGuard {
        file,
        path: path.to_path_buf(),
        mode,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_then_release() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("rq-lock-{}", std::process::id()));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("t.lck");

        let g = try_acquire(&path, LockMode::Exclusive)?;
        assert_eq!(g.mode(), LockMode::Exclusive);
        assert!(try_acquire(&path, LockMode::Exclusive).is_err());
        drop(g);
        let _again = try_acquire(&path, LockMode::Exclusive)?;
        Ok(())
    }
}
