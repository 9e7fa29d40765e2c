use anyhow::Result;
use std::fs;
use std::path::PathBuf;

use RowQuiver::{BlobReader, BlobRow, DataFileCache, StoreConfig};

use super::util::{display_text, hex_dump};

pub fn exec(path: PathBuf, pos: u64, out: Option<PathBuf>) -> Result<()> {
    let cache = DataFileCache::new(&path, StoreConfig::from_env())?;
    cache.open(true)?;
    let row = cache.get_row::<BlobRow>(pos, &BlobReader, false);
    cache.close(false)?;
    let row = row?;
    let v = row.payload();

    if let Some(out_path) = out {
        if let Some(parent) = out_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&out_path, v)?;
        println!("FOUND pos={}: {} B -> wrote to {}", pos, v.len(), out_path.display());
    } else {
        println!("FOUND pos={}: {} B", pos, v.len());
        println!("text: {}", display_text(v));
        println!("hex:  {}", hex_dump(&v[..v.len().min(64)]));
    }
    Ok(())
}
