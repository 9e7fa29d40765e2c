use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;

use RowQuiver::consts::{TABLE_ID_DEFAULT, TABLE_ID_DIRECTORY, TABLE_ID_EMPTY, TABLE_ID_FIRST};
use RowQuiver::{BlobReader, BlobRow, CachedObject, DataFileCache, StoreBuilder, StoreConfig};

fn unique_root(prefix: &str) -> PathBuf {
    static NEXT_ID: AtomicU64 = AtomicU64::new(0);
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let root = std::env::temp_dir().join(format!("rqtest-blocks-{prefix}-{pid}-{t}-{id}"));
    std::fs::create_dir_all(&root).unwrap();
    root
}

fn blocks_cfg() -> Result<StoreConfig> {
    StoreBuilder::from_default()
        .data_file_scale(8)
        .file_block_mb(1)
        .space_blocks(true)
        .build()
}

/// Scale units per 1 MiB block at scale 8.
const UPB: u64 = (1 << 20) / 8;

#[test]
fn freed_blocks_are_reused_before_the_file_grows() -> Result<()> {
    let root = unique_root("reuse");
    let cache = DataFileCache::open_shared(root.join("db"), blocks_cfg()?, false)?;
    assert!(cache.is_multi_space()?);

    let p = cache.get_file_blocks(5, 4)?;
    assert_eq!(p, UPB, "block 0 holds the directory");
    assert_eq!(cache.find_table_space(p)?, 5);
    assert_eq!(cache.find_table_space(p + 3 * UPB)?, 5);
    let end = cache.stats()?.file_end_bytes;
    assert_eq!(end, 5 << 20);

    cache.free_table_space(5)?;
    assert_eq!(cache.find_table_space(p)?, TABLE_ID_EMPTY);

    let q = cache.get_file_blocks(6, 2)?;
    assert!(q >= p && q + 2 * UPB <= p + 4 * UPB, "reused range lies in the freed one");
    assert_eq!(cache.find_table_space(q)?, 6);
    assert_eq!(cache.find_table_space(q + UPB)?, 6);
    assert_eq!(cache.stats()?.file_end_bytes, end, "no growth");

    // блок за концом файла
    assert_eq!(cache.find_table_space(end / 8 + 10)?, TABLE_ID_EMPTY);
    assert_eq!(cache.find_table_space(0)?, TABLE_ID_DIRECTORY);
    cache.close(true)?;
    Ok(())
}

#[test]
fn lost_space_tracks_allocation_round_trip() -> Result<()> {
    let root = unique_root("lost");
    let cache = DataFileCache::open_shared(root.join("db"), blocks_cfg()?, false)?;
    let space = cache.new_table_space_id()?;
    assert!(space >= TABLE_ID_FIRST);

    // 8 + 56 = 64 байта, кратно scale
    let first = cache.add(BlobRow::new(vec![1; 56], 8), space)?;
    assert_eq!(cache.find_table_space(first)?, space);
    cache.checkpoint()?;
    let l0 = cache.lost_blocks_size()?;

    let second = cache.add(BlobRow::new(vec![2; 56], 8), space)?;
    cache.checkpoint()?;
    let l1 = cache.lost_blocks_size()?;
    assert_eq!(l1, l0 - 64);

    cache.remove(second, space)?;
    cache.checkpoint()?;
    assert_eq!(cache.lost_blocks_size()?, l0);

    // тот же размер снова ложится на освобождённое место
    let again = cache.add(BlobRow::new(vec![3; 56], 8), space)?;
    assert_eq!(again, second);
    assert_eq!(cache.find_table_space(first)?, space);
    cache.close(true)?;
    Ok(())
}

#[test]
fn reserved_space_ids_are_refused() -> Result<()> {
    let root = unique_root("reserved");
    let cache = DataFileCache::open_shared(root.join("db"), blocks_cfg()?, false)?;
    let row = BlobRow::new(b"meta?".to_vec(), 8);
    assert!(cache.add(row.clone(), TABLE_ID_DIRECTORY).is_err());
    assert!(row.pos().is_none(), "failed add leaves the row unplaced");
    assert!(cache.add(BlobRow::new(b"x".to_vec(), 8), TABLE_ID_EMPTY).is_err());
    assert!(cache.free_table_space(TABLE_ID_DIRECTORY).is_err());

    // blocks-аллокатор растёт только целыми блоками
    assert!(cache.enlarge_file_space(4096).is_err());
    let old = cache.enlarge_file_space(1 << 20)?;
    assert_eq!(old, UPB);
    cache.close(true)?;
    Ok(())
}

#[test]
fn directory_grows_into_its_own_block() -> Result<()> {
    let root = unique_root("grow");
    let base = root.join("db");
    let cfg = blocks_cfg()?;
    let (space, first) = {
        let cache = DataFileCache::new(&base, cfg.clone())?;
        cache.open(false)?;
        let space = cache.new_table_space_id()?;
        // битмапов для 60 блоков в блоке 0 не хватает
        let first = cache.get_file_blocks(space, 60)?;
        assert_eq!(cache.find_table_space(UPB)?, TABLE_ID_DIRECTORY);
        assert_eq!(first, 2 * UPB);
        assert_eq!(cache.find_table_space(first + 59 * UPB)?, space);
        assert_eq!(cache.stats()?.file_end_bytes, 62 << 20);
        cache.close(true)?;
        (space, first)
    };

    let cache = DataFileCache::new(&base, cfg)?;
    cache.open(false)?;
    assert_eq!(cache.find_table_space(UPB)?, TABLE_ID_DIRECTORY);
    assert_eq!(cache.find_table_space(first)?, space);
    assert_eq!(cache.find_table_space(first + 59 * UPB)?, space);
    assert!(cache.new_table_space_id()? > space);
    cache.close(true)?;
    Ok(())
}

#[test]
fn spaces_and_rows_survive_reopen() -> Result<()> {
    let root = unique_root("reopen");
    let base = root.join("db");
    let cfg = blocks_cfg()?;
    let mut rows = Vec::new();
    let (s1, s2) = {
        let cache = DataFileCache::new(&base, cfg.clone())?;
        cache.open(false)?;
        let s1 = cache.new_table_space_id()?;
        let s2 = cache.new_table_space_id()?;
        for i in 0..30u8 {
            let s = if i % 2 == 0 { s1 } else { s2 };
            let pos = cache.add(BlobRow::new(vec![i; 300 + i as usize], 8), s)?;
            rows.push((pos, s, i));
        }
        cache.close(true)?;
        (s1, s2)
    };

    let cache = DataFileCache::new(&base, cfg)?;
    cache.open(false)?;
    for (pos, s, i) in &rows {
        assert_eq!(cache.find_table_space(*pos)?, *s);
        let row = cache.get_row::<BlobRow>(*pos, &BlobReader, false)?;
        assert_eq!(row.payload(), vec![*i; 300 + *i as usize].as_slice());
    }
    let s3 = cache.new_table_space_id()?;
    assert!(s3 > s1 && s3 > s2);

    // новые строки s1 не залезают в блок s2
    let pos = cache.add(BlobRow::new(vec![0xEE; 64], 8), s1)?;
    assert_eq!(cache.find_table_space(pos)?, s1);
    cache.close(true)?;
    Ok(())
}

#[test]
fn simple_manager_is_single_space() -> Result<()> {
    let root = unique_root("simple");
    let cfg = StoreBuilder::from_default().space_blocks(false).build()?;
    let cache = DataFileCache::open_shared(root.join("db"), cfg, false)?;
    assert!(!cache.is_multi_space()?);
    assert_eq!(cache.new_table_space_id()?, TABLE_ID_DEFAULT);

    let a = cache.add(BlobRow::new(vec![1; 100], 8), 0)?;
    assert_eq!(cache.find_table_space(a)?, TABLE_ID_DEFAULT);
    let size = cache.storage_size(a)? as u64;
    cache.remove(a, 0)?;
    assert_eq!(cache.lost_blocks_size()?, size);

    let b = cache.add(BlobRow::new(vec![2; 100], 8), 0)?;
    assert_eq!(b, a);
    assert_eq!(cache.lost_blocks_size()?, 0);
    cache.close(true)?;
    Ok(())
}
