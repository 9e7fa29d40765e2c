use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;

use RowQuiver::consts::TABLE_ID_DEFAULT;
use RowQuiver::{
    downcast_row, BlobReader, BlobRow, CachedObject, DataFileCache, DataFileHeader, Lifecycle,
    RowReader, RowStore, StorageError, StoreBuilder, StoreConfig,
};

fn unique_root(prefix: &str) -> PathBuf {
    static NEXT_ID: AtomicU64 = AtomicU64::new(0);
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let root = std::env::temp_dir().join(format!("rqtest-ckpt-{prefix}-{pid}-{t}-{id}"));
    std::fs::create_dir_all(&root).unwrap();
    root
}

fn simple_cfg() -> Result<StoreConfig> {
    StoreBuilder::from_default().space_blocks(false).build()
}

fn body(i: u32) -> Vec<u8> {
    let mut v = format!("row-{i:04}-").into_bytes();
    v.resize(40 + (i as usize % 7) * 90, b'0' + (i % 10) as u8);
    v
}

/// Fill a store, drop every other row; returns the payloads still expected.
fn fill_and_thin(store: &mut RowStore, n: u32) -> Result<BTreeSet<Vec<u8>>> {
    let mut by_pos = BTreeMap::new();
    for i in 0..n {
        let pos = store.add(BlobRow::new(body(i), 8))?;
        by_pos.insert(pos, i);
    }
    let mut expected = BTreeSet::new();
    for (k, (pos, i)) in by_pos.iter().enumerate() {
        if k % 2 == 0 {
            assert!(store.remove(*pos)?);
        } else {
            expected.insert(body(*i));
        }
    }
    Ok(expected)
}

fn payloads(store: &RowStore) -> Result<BTreeSet<Vec<u8>>> {
    let mut out = BTreeSet::new();
    for pos in store.positions() {
        let row = store
            .get(pos)?
            .ok_or_else(|| anyhow::anyhow!("row {} missing", pos))?;
        out.insert(downcast_row::<BlobRow>(row)?.payload().to_vec());
    }
    Ok(out)
}

#[test]
fn defrag_compacts_and_remaps_a_cached_store() -> Result<()> {
    let root = unique_root("defrag-simple");
    let cache = DataFileCache::open_shared(root.join("db"), simple_cfg()?, false)?;
    let reader: Arc<dyn RowReader> = Arc::new(BlobReader);
    let mut store = RowStore::cached(cache.clone(), reader)?;

    let expected = fill_and_thin(&mut store, 40)?;
    assert!(cache.lost_blocks_size()? > 0);

    let report = cache.defrag(&mut store)?;
    assert_eq!(report.rows_moved, 20);
    assert!(report.new_end_bytes < report.old_end_bytes);
    assert_eq!(cache.lifecycle(), Lifecycle::Open);
    assert_eq!(cache.lost_blocks_size()?, 0);
    assert_eq!(cache.stats()?.rows, 0, "cache starts empty after the swap");

    assert_eq!(store.element_count(), 20);
    assert_eq!(payloads(&store)?, expected);
    assert!(!cache.files().data_new.exists());
    assert!(!cache.files().data_old.exists());

    // файл остаётся рабочим
    store.add(BlobRow::new(b"after defrag".to_vec(), 8))?;
    cache.close(true)?;
    Ok(())
}

#[test]
fn defrag_with_blocks_moves_rows_into_the_default_space() -> Result<()> {
    let root = unique_root("defrag-blocks");
    let base = root.join("db");
    let cfg = StoreBuilder::from_default().build()?;
    let cache = DataFileCache::open_shared(&base, cfg.clone(), false)?;
    let reader: Arc<dyn RowReader> = Arc::new(BlobReader);
    let mut store = RowStore::cached(cache.clone(), reader.clone())?;

    let expected = fill_and_thin(&mut store, 60)?;
    let report = cache.defrag(&mut store)?;
    assert_eq!(report.rows_moved, 30);
    assert!(cache.is_multi_space()?);
    for pos in store.positions() {
        assert_eq!(cache.find_table_space(pos)?, TABLE_ID_DEFAULT);
    }
    assert_eq!(payloads(&store)?, expected);
    cache.close(true)?;

    // после переоткрытия строки на новых местах
    let again = DataFileCache::open_shared(&base, cfg, false)?;
    for pos in store.positions() {
        let row = again.get_row::<BlobRow>(pos, reader.as_ref(), false)?;
        assert!(expected.contains(row.payload()));
    }
    again.close(true)?;
    Ok(())
}

#[test]
fn failed_swap_leaves_error_state_that_a_fresh_open_clears() -> Result<()> {
    let root = unique_root("swap-fail");
    let cache = DataFileCache::open_shared(root.join("db"), simple_cfg()?, false)?;
    let reader: Arc<dyn RowReader> = Arc::new(BlobReader);
    let mut store = RowStore::cached(cache.clone(), reader)?;
    let expected = fill_and_thin(&mut store, 16)?;

    // rename data -> data.old упирается в непустой каталог
    let blocker = cache.files().data_old.clone();
    std::fs::create_dir(&blocker)?;
    std::fs::write(blocker.join("keep"), b"x")?;
    assert!(cache.defrag(&mut store).is_err());
    assert_eq!(cache.lifecycle(), Lifecycle::Error);
    assert!(!cache.files().data_new.exists(), "half-built file removed");
    assert!(cache.files().data.exists());
    let err = cache.get(32, &BlobReader, false).expect_err("no session in Error");
    assert!(matches!(StorageError::of(&err), Some(StorageError::NotOpen(_))));

    std::fs::remove_dir_all(&blocker)?;
    cache.open(false)?;
    assert_eq!(cache.lifecycle(), Lifecycle::Open);
    assert_eq!(store.element_count(), 8);
    assert_eq!(payloads(&store)?, expected, "rows stay at their old positions");
    cache.close(true)?;
    Ok(())
}

#[test]
fn full_backup_restores_after_crash() -> Result<()> {
    let root = unique_root("gzip");
    let base = root.join("db");
    let cfg = StoreBuilder::from_default()
        .space_blocks(false)
        .incremental_backup(false)
        .build()?;

    let kept = {
        let cache = DataFileCache::new(&base, cfg.clone())?;
        cache.open(false)?;
        assert!(cache.files().backup.exists(), "new file gets a backup at open");
        let mut kept = Vec::new();
        for i in 0..10u32 {
            kept.push((cache.add(BlobRow::new(body(i), 8), 0)?, body(i)));
        }
        cache.close(true)?;
        kept
    };
    let files = DataFileCache::new(&base, cfg.clone())?.files().clone();
    let end = DataFileHeader::read_path(&files.data)?.free_pos * 8;

    {
        let cache = DataFileCache::new(&base, cfg.clone())?;
        cache.open(false)?;
        cache.remove(kept[0].0, 0)?;
        cache.add(BlobRow::new(vec![0xFF; kept[0].1.len()], 8), 0)?;
        cache.add(BlobRow::new(vec![0xAB; 5000], 8), 0)?;
        cache.flush()?;
        let h = DataFileHeader::read_path(&files.data)?;
        assert!(!h.is_saved());
        assert!(!h.is_shadowed());
        cache.close(false)?;
    }

    let cache = DataFileCache::new(&base, cfg)?;
    cache.open(false)?;
    for (pos, want) in &kept {
        let row = cache.get_row::<BlobRow>(*pos, &BlobReader, false)?;
        assert_eq!(row.payload(), want.as_slice());
    }
    assert_eq!(cache.stats()?.file_end_bytes, end);
    cache.close(true)?;
    Ok(())
}

#[test]
fn failed_backup_keeps_the_session_open() -> Result<()> {
    let root = unique_root("ckpt-fail");
    let cfg = StoreBuilder::from_default()
        .space_blocks(false)
        .incremental_backup(false)
        .build()?;
    let cache = DataFileCache::open_shared(root.join("db"), cfg, false)?;
    let pos = cache.add(BlobRow::new(b"survivor".to_vec(), 8), 0)?;

    // tmp-файл backup'а не создать: на его месте каталог
    std::fs::create_dir(&cache.files().backup_tmp)?;
    let err = cache.checkpoint().expect_err("backup cannot be written");
    assert!(matches!(
        StorageError::of(&err),
        Some(StorageError::CheckpointFailed(_))
    ));
    assert_eq!(cache.lifecycle(), Lifecycle::Open);
    assert!(cache.files().backup.exists(), "previous backup untouched");

    std::fs::remove_dir(&cache.files().backup_tmp)?;
    cache.checkpoint()?;
    let row = cache.get_row::<BlobRow>(pos, &BlobReader, false)?;
    assert_eq!(row.payload(), b"survivor");
    cache.close(true)?;
    Ok(())
}

#[test]
fn mapped_backend_falls_back_to_raf_when_it_outgrows_the_limit() -> Result<()> {
    let root = unique_root("hybrid");
    let base = root.join("db");
    let cfg = StoreBuilder::from_default()
        .space_blocks(false)
        .nio(true)
        .nio_max_bytes(64 * 1024)
        .build()?;
    let cache = DataFileCache::new(&base, cfg.clone())?;
    cache.open(false)?;
    assert!(cache.stats()?.mapped);

    let mut rows = Vec::new();
    for i in 0..40u32 {
        let payload = vec![(i % 251) as u8; 3000];
        rows.push((cache.add(BlobRow::new(payload.clone(), 8), 0)?, payload));
    }
    cache.flush()?;
    let stats = cache.stats()?;
    assert!(stats.file_end_bytes > 64 * 1024);
    assert!(!stats.mapped, "switched to plain file I/O");
    cache.close(true)?;

    cache.open(false)?;
    assert!(!cache.stats()?.mapped, "large file opens with RAF");
    for (pos, want) in &rows {
        let row = cache.get_row::<BlobRow>(*pos, &BlobReader, false)?;
        assert_eq!(row.payload(), want.as_slice());
    }
    cache.close(true)?;
    Ok(())
}

#[test]
fn capacity_errors_are_classified() -> Result<()> {
    let root = unique_root("capacity");
    let cfg = StoreBuilder::from_default()
        .space_blocks(false)
        .data_file_scale(1)
        .cache_rows(2)
        .build()?;
    let cache = DataFileCache::open_shared(root.join("db"), cfg, false)?;

    let a = cache.add(BlobRow::new(vec![1; 32], 8), 0)?;
    let b = cache.add(BlobRow::new(vec![2; 32], 8), 0)?;
    let pa = cache.get(a, &BlobReader, true)?;
    let pb = cache.get(b, &BlobReader, true)?;

    let row = BlobRow::new(vec![3; 32], 8);
    let err = cache.add(row.clone(), 0).expect_err("both residents pinned");
    assert!(matches!(StorageError::of(&err), Some(StorageError::CacheFull { .. })));
    assert!(StorageError::is_capacity(&err));
    assert!(row.pos().is_none());
    assert_eq!(cache.lost_blocks_size()?, row.storage_size() as u64, "space handed back");
    assert_eq!(cache.lifecycle(), Lifecycle::Open);

    pb.keep_in_memory(false);
    let c = cache.add(BlobRow::new(vec![4; 32], 8), 0)?;
    assert!(c > b);
    pa.keep_in_memory(false);

    // scale 1: максимум i32::MAX байт
    let err = cache.enlarge_file_space(3 << 30).expect_err("past the maximum size");
    assert!(matches!(StorageError::of(&err), Some(StorageError::FileFull { .. })));
    cache.close(true)?;
    Ok(())
}

#[test]
fn session_rules() -> Result<()> {
    let root = unique_root("session");
    let base = root.join("db");
    let cfg = simple_cfg()?;

    let closed = DataFileCache::new(&base, cfg.clone())?;
    let err = closed.get(32, &BlobReader, false).expect_err("not open");
    assert!(matches!(StorageError::of(&err), Some(StorageError::NotOpen(_))));
    assert!(closed.open(true).is_err(), "read-only needs an existing file");

    let writer = DataFileCache::new(&base, cfg.clone())?;
    writer.open(false)?;
    assert!(writer.open(false).is_err(), "already open");
    writer.add(BlobRow::new(b"x".to_vec(), 8), 0)?;

    let other = DataFileCache::new(&base, cfg.clone())?;
    assert!(other.open(false).is_err(), "second writer is locked out");
    writer.close(true)?;

    let reader = DataFileCache::new(&base, cfg)?;
    reader.open(true)?;
    let err = reader
        .add(BlobRow::new(b"y".to_vec(), 8), 0)
        .expect_err("read-only session");
    assert!(matches!(StorageError::of(&err), Some(StorageError::ReadOnly)));
    assert!(reader.checkpoint().is_err());
    reader.close(true)?;
    Ok(())
}

#[test]
fn untouched_new_file_is_removed_on_close() -> Result<()> {
    let root = unique_root("untouched");
    let cache = DataFileCache::new(root.join("db"), StoreBuilder::from_default().build()?)?;
    cache.open(false)?;
    assert!(cache.files().data.exists());
    cache.close(true)?;
    assert!(!cache.files().data.exists());
    assert!(!cache.files().backup.exists());
    Ok(())
}
