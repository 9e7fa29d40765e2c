use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;

use RowQuiver::{BlobReader, BlobRow, DataFileCache, StoreBuilder, StoreConfig};

fn unique_root(prefix: &str) -> PathBuf {
    static NEXT_ID: AtomicU64 = AtomicU64::new(0);
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let root = std::env::temp_dir().join(format!("rqtest-config-{prefix}-{pid}-{t}-{id}"));
    std::fs::create_dir_all(&root).unwrap();
    root
}

#[test]
fn env_overrides_defaults() -> Result<()> {
    // единственный тест в этом бинаре, который трогает окружение
    std::env::set_var("RQ_CACHE_ROWS", "1000");
    std::env::set_var("RQ_DATA_FILE_SCALE", "32");
    std::env::set_var("RQ_SPACE_BLOCKS", "off");
    std::env::set_var("RQ_INC_BACKUP", "0");
    std::env::set_var("RQ_DEFRAG_LIMIT", "25");

    let cfg = StoreBuilder::new().build()?;
    assert_eq!(cfg.cache_rows, 1000);
    assert_eq!(cfg.cache_bytes, 1000 * 1024);
    assert_eq!(cfg.data_file_scale, 32);
    assert!(!cfg.space_blocks);
    assert!(!cfg.incremental_backup);
    assert_eq!(cfg.defrag_limit_percent, 25);

    // builder поверх env
    let cfg = StoreBuilder::new().data_file_scale(16).build()?;
    assert_eq!(cfg.data_file_scale, 16);
    assert_eq!(cfg.cache_rows, 1000);

    // мусор в переменной игнорируется
    std::env::set_var("RQ_CACHE_ROWS", "lots");
    assert_eq!(StoreConfig::from_env().cache_rows, StoreConfig::default().cache_rows);

    for k in [
        "RQ_CACHE_ROWS",
        "RQ_DATA_FILE_SCALE",
        "RQ_SPACE_BLOCKS",
        "RQ_INC_BACKUP",
        "RQ_DEFRAG_LIMIT",
    ] {
        std::env::remove_var(k);
    }
    Ok(())
}

#[test]
fn invalid_settings_are_rejected_before_touching_disk() -> Result<()> {
    let root = unique_root("invalid");
    let base = root.join("db");

    assert!(StoreBuilder::from_default().cache_rows(0).build().is_err());
    assert!(StoreBuilder::from_default().file_block_mb(128).build().is_err());
    assert!(StoreBuilder::from_default().max_free_blocks(1).build().is_err());

    let bad = StoreConfig::default().with_data_file_scale(3);
    assert!(DataFileCache::new(&base, bad).is_err());
    assert!(!root.join("db.data").exists());
    Ok(())
}

#[test]
fn scale_sets_row_alignment() -> Result<()> {
    let root = unique_root("scale");
    let cfg = StoreBuilder::from_default()
        .data_file_scale(32)
        .space_blocks(false)
        .build()?;
    let cache = DataFileCache::open_shared(root.join("db"), cfg, false)?;
    assert_eq!(cache.row_padding(), 32);

    let mut last = 0;
    for n in [1usize, 30, 33, 100] {
        let row = BlobRow::new(vec![7; n], cache.row_padding());
        let pos = cache.add(row, 0)?;
        assert!(pos > last);
        last = pos;
        assert_eq!(cache.storage_size(pos)? % 32, 0);
    }
    cache.checkpoint()?;
    let row = cache.get_row::<BlobRow>(last, &BlobReader, false)?;
    assert_eq!(row.payload().len(), 100);

    let stats = cache.stats()?;
    assert_eq!(stats.file_end_bytes % 32, 0);
    assert_eq!(stats.capacity_rows, StoreConfig::default().cache_rows);
    cache.close(true)?;
    Ok(())
}

#[test]
fn defrag_threshold_follows_the_limit() -> Result<()> {
    let root = unique_root("limit");
    let base = root.join("db");
    let cfg = StoreBuilder::from_default()
        .space_blocks(false)
        .defrag_limit_percent(10)
        .build()?;
    let cache = DataFileCache::open_shared(&base, cfg, false)?;
    let mut rows = Vec::new();
    for i in 0..20u8 {
        rows.push(cache.add(BlobRow::new(vec![i; 500], 8), 0)?);
    }
    assert!(!cache.should_defrag()?);
    for p in rows.iter().take(10) {
        cache.remove(*p, 0)?;
    }
    assert!(cache.should_defrag()?);
    cache.close(true)?;

    let never = StoreBuilder::from_default().space_blocks(false).build()?;
    let cache = DataFileCache::open_shared(&base, never, false)?;
    // потерянное место пришло из заголовка, но лимит 0 = никогда
    assert!(cache.lost_blocks_size()? > 0);
    assert!(!cache.should_defrag()?);
    cache.close(true)?;
    Ok(())
}
