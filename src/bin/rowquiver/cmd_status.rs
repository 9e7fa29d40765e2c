use anyhow::Result;
use serde::Serialize;
use std::path::PathBuf;

use RowQuiver::metrics::{self, MetricsSnapshot};
use RowQuiver::{CacheStats, DataFileCache, DataFileHeader, StoreConfig};

#[derive(Serialize)]
struct HeaderView {
    empty_size: u64,
    free_pos: u64,
    space_root: u32,
    flags: u32,
    saved: bool,
    shadowed: bool,
    row_info: bool,
}

#[derive(Serialize)]
struct StatusReport {
    data_file: String,
    header: HeaderView,
    stats: CacheStats,
    config: StoreConfig,
    metrics: MetricsSnapshot,
}

pub fn exec(path: PathBuf, json: bool) -> Result<()> {
    let cache = DataFileCache::new(&path, StoreConfig::from_env())?;
    let h = DataFileHeader::read_path(&cache.files().data)?;
    cache.open(true)?;
    let stats = cache.stats();
    cache.close(false)?;
    let stats = stats?;

    let report = StatusReport {
        data_file: cache.files().data.display().to_string(),
        header: HeaderView {
            empty_size: h.empty_size,
            free_pos: h.free_pos,
            space_root: h.space_root,
            flags: h.flags,
            saved: h.is_saved(),
            shadowed: h.is_shadowed(),
            row_info: h.has_row_info(),
        },
        stats,
        config: cache.config().clone(),
        metrics: metrics::snapshot(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("RowQuiver status: {}", report.data_file);
    println!("  header:");
    println!("    free_pos   = {} units ({} B)", h.free_pos, report.stats.file_end_bytes);
    println!("    empty_size = {} B", h.empty_size);
    println!("    space_root = {}", h.space_root);
    println!(
        "    flags      = {:#06b} (saved={}, shadowed={}, row_info={})",
        h.flags,
        h.is_saved(),
        h.is_shadowed(),
        h.has_row_info()
    );
    println!("  allocator:");
    println!("    kind       = {}", if report.stats.multi_space { "blocks" } else { "simple" });
    println!("    lost       = {} B", report.stats.lost_bytes);
    println!("  cache:");
    println!("    rows       = {} / {}", report.stats.rows, report.stats.capacity_rows);
    println!("    bytes      = {} / {}", report.stats.bytes, report.stats.capacity_bytes);
    println!("    backend    = {}", if report.stats.mapped { "mapped" } else { "raf" });
    println!("  config: {}", report.config);
    Ok(())
}
