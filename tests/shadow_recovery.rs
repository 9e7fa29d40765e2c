use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;

use RowQuiver::header::with_flag;
use RowQuiver::consts::{FLAG_190, FLAG_ISSAVED, FLAG_ISSHADOWED};
use RowQuiver::{BlobReader, BlobRow, DataFileCache, DataFileHeader, StoreBuilder, StoreConfig};

fn unique_root(prefix: &str) -> PathBuf {
    static NEXT_ID: AtomicU64 = AtomicU64::new(0);
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let root = std::env::temp_dir().join(format!("rqtest-shadow-{prefix}-{pid}-{t}-{id}"));
    std::fs::create_dir_all(&root).unwrap();
    root
}

fn simple_cfg() -> Result<StoreConfig> {
    StoreBuilder::from_default().space_blocks(false).build()
}

fn payload(cache: &DataFileCache, pos: u64) -> Result<Vec<u8>> {
    Ok(cache.get_row::<BlobRow>(pos, &BlobReader, false)?.payload().to_vec())
}

#[test]
fn crash_after_overwrite_restores_checkpoint_state() -> Result<()> {
    let root = unique_root("overwrite");
    let base = root.join("db");
    let cfg = simple_cfg()?;

    let (pos_a, pos_b) = {
        let cache = DataFileCache::new(&base, cfg.clone())?;
        cache.open(false)?;
        let a = cache.add(BlobRow::new(vec![b'a'; 100], 8), 0)?;
        let b = cache.add(BlobRow::new(vec![b'b'; 100], 8), 0)?;
        cache.close(true)?;
        (a, b)
    };
    let files = DataFileCache::new(&base, cfg.clone())?.files().clone();
    let saved = DataFileHeader::read_path(&files.data)?;
    assert!(saved.is_saved());
    let checkpoint_end = saved.free_pos * cfg.data_file_scale as u64;

    // вторая сессия: место A занимает D, C растит файл; потом "падение"
    {
        let cache = DataFileCache::new(&base, cfg.clone())?;
        cache.open(false)?;
        cache.remove(pos_a, 0)?;
        let pos_d = cache.add(BlobRow::new(vec![b'd'; 100], 8), 0)?;
        assert_eq!(pos_d, pos_a, "freed space is reused first");
        cache.add(BlobRow::new(vec![b'c'; 3000], 8), 0)?;
        cache.flush()?;

        let h = DataFileHeader::read_path(&files.data)?;
        assert!(!h.is_saved());
        assert!(h.is_shadowed());
        assert!(files.backup.exists(), "shadow log is kept on disk");
        cache.close(false)?;
    }

    // read-only не восстанавливает
    let ro = DataFileCache::new(&base, cfg.clone())?;
    assert!(ro.open(true).is_err());

    let cache = DataFileCache::new(&base, cfg)?;
    cache.open(false)?;
    assert_eq!(payload(&cache, pos_a)?, vec![b'a'; 100]);
    assert_eq!(payload(&cache, pos_b)?, vec![b'b'; 100]);
    assert_eq!(cache.stats()?.file_end_bytes, checkpoint_end);
    assert_eq!(std::fs::metadata(&files.data)?.len(), checkpoint_end);
    assert!(!files.backup.exists(), "log is consumed by recovery");
    cache.close(true)?;
    Ok(())
}

#[test]
fn rows_added_after_checkpoint_vanish_on_crash() -> Result<()> {
    let root = unique_root("vanish");
    let base = root.join("db");
    let cfg = StoreBuilder::from_default().build()?;

    let (space, kept) = {
        let cache = DataFileCache::new(&base, cfg.clone())?;
        cache.open(false)?;
        let space = cache.new_table_space_id()?;
        let mut kept = Vec::new();
        for i in 0..20u8 {
            kept.push(cache.add(BlobRow::new(vec![i; 200], 8), space)?);
        }
        cache.close(true)?;
        (space, kept)
    };

    let lost_space = {
        let cache = DataFileCache::new(&base, cfg.clone())?;
        cache.open(false)?;
        let s2 = cache.new_table_space_id()?;
        assert!(s2 > space);
        for i in 0..50u8 {
            cache.add(BlobRow::new(vec![i; 4000], 8), s2)?;
        }
        cache.flush()?;
        cache.close(false)?;
        s2
    };

    let cache = DataFileCache::new(&base, cfg)?;
    cache.open(false)?;
    for (i, p) in kept.iter().enumerate() {
        assert_eq!(payload(&cache, *p)?, vec![i as u8; 200]);
        assert_eq!(cache.find_table_space(*p)?, space);
    }
    // счётчик пространств откатился вместе с метаданными
    assert_eq!(cache.new_table_space_id()?, lost_space);
    cache.close(true)?;
    Ok(())
}

#[test]
fn clean_close_removes_the_shadow_log() -> Result<()> {
    let root = unique_root("clean");
    let base = root.join("db");
    let cfg = simple_cfg()?;
    let cache = DataFileCache::new(&base, cfg.clone())?;
    cache.open(false)?;
    cache.add(BlobRow::new(b"first".to_vec(), 8), 0)?;
    cache.checkpoint()?;
    cache.add(BlobRow::new(b"second".to_vec(), 8), 0)?;
    cache.flush()?;
    cache.close(true)?;

    assert!(!cache.files().backup.exists());
    let h = DataFileHeader::read_path(&cache.files().data)?;
    assert!(h.is_saved());

    // повторное открытие ничего не восстанавливает
    cache.open(true)?;
    assert!(cache.is_readonly());
    assert_eq!(cache.stats()?.rows, 0);
    cache.close(false)?;
    Ok(())
}

#[test]
fn header_fields_survive_encode_decode() -> Result<()> {
    let flags = with_flag(
        with_flag(with_flag(0, FLAG_190, true), FLAG_ISSAVED, true),
        FLAG_ISSHADOWED,
        true,
    );
    let h = DataFileHeader {
        empty_size: 4096,
        free_pos: 1000,
        space_root: 0,
        flags,
    };
    let back = DataFileHeader::decode(&h.encode())?;
    assert_eq!(back, h);
    assert_eq!(back.free_pos, 1000);
    assert!(back.is_saved());
    assert!(back.is_shadowed());

    let old = DataFileHeader { flags: with_flag(flags, FLAG_190, false), ..h };
    assert!(DataFileHeader::decode(&old.encode()).is_err());
    Ok(())
}
