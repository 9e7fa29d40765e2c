use anyhow::{anyhow, Result};
use std::path::PathBuf;

use RowQuiver::{BlobRow, DataFileCache, StoreConfig};

use super::util::{decode_value_arg, read_all};

pub fn exec(path: PathBuf, value: Option<String>, value_file: Option<PathBuf>, space: u32) -> Result<()> {
    let bytes = match (value, value_file) {
        (_, Some(p)) => read_all(&p)?,
        (Some(s), None) => decode_value_arg(&s)?,
        (None, None) => return Err(anyhow!("either --value or --value-file must be provided")),
    };

    let cache = DataFileCache::new(&path, StoreConfig::from_env())?;
    cache.open(false)?;
    let row = BlobRow::new(bytes, cache.row_padding());
    let size = row.payload().len();
    let res = cache.add(row, space);
    let pos = match res {
        Ok(p) => p,
        Err(e) => {
            cache.close(false)?;
            return Err(e);
        }
    };
    cache.close(true)?;
    println!("OK put: pos={} value={} B space={}", pos, size, space);
    Ok(())
}
