use anyhow::Result;
use std::path::PathBuf;

use RowQuiver::{DataFileCache, StoreConfig};

pub fn exec(path: PathBuf) -> Result<()> {
    let cache = DataFileCache::new(&path, StoreConfig::from_env())?;
    cache.open(false)?;
    if let Err(e) = cache.checkpoint() {
        let _ = cache.close(false);
        return Err(e);
    }
    let lost = cache.lost_blocks_size()?;
    cache.close(false)?;
    println!("Checkpoint OK: {} (lost {} B)", cache.files().data.display(), lost);
    Ok(())
}
