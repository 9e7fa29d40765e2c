use anyhow::{anyhow, Result};
use std::path::PathBuf;

use RowQuiver::{DataFileCache, FileSet, StoreBuilder};

pub fn exec(
    path: PathBuf,
    scale: Option<u32>,
    simple: bool,
    full_backup: bool,
    block_mb: Option<u32>,
) -> Result<()> {
    let files = FileSet::new(&path);
    if files.data.exists() {
        return Err(anyhow!("{} already exists", files.data.display()));
    }
    if let Some(parent) = files.data.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut b = StoreBuilder::new().space_blocks(!simple);
    if let Some(s) = scale {
        b = b.data_file_scale(s);
    }
    if let Some(mb) = block_mb {
        b = b.file_block_mb(mb);
    }
    if full_backup {
        b = b.incremental_backup(false);
    }
    let cfg = b.build()?;

    let cache = DataFileCache::new(&path, cfg)?;
    cache.open(false)?;
    cache.checkpoint()?;
    let stats = cache.stats()?;
    // close(true) удалил бы нетронутый новый файл
    cache.close(false)?;

    println!(
        "Initialized {} (scale={}, allocator={}, backup={}, end={} B)",
        files.data.display(),
        cache.config().data_file_scale,
        if stats.multi_space { "blocks" } else { "simple" },
        if full_backup { "full" } else { "shadow" },
        stats.file_end_bytes
    );
    Ok(())
}
