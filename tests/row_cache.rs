use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;

use RowQuiver::{BlobRow, CachedObject, RowCache, RowRef, RowSaver, StorageError};

/// Saver that only records what it was handed (and whether the row was
/// still resident at that moment).
#[derive(Default)]
struct RecordingSaver {
    saved: Vec<u64>,
    resident_when_saved: Vec<bool>,
    batches: Vec<Vec<u64>>,
}

impl RowSaver for RecordingSaver {
    fn save_rows(&mut self, rows: &[RowRef]) -> Result<()> {
        let mut batch = Vec::with_capacity(rows.len());
        for r in rows {
            let pos = r.pos().unwrap_or(u64::MAX);
            batch.push(pos);
            self.saved.push(pos);
            self.resident_when_saved.push(r.is_in_memory());
            r.state().set_changed(false);
            r.state().set_new(false);
        }
        self.batches.push(batch);
        Ok(())
    }
}

fn row(pos: u64, payload_len: usize) -> RowRef {
    let r = BlobRow::new(vec![0x5A; payload_len], 8);
    r.state().set_pos(pos);
    r
}

fn clean_row(pos: u64, payload_len: usize) -> RowRef {
    let r = row(pos, payload_len);
    r.state().set_changed(false);
    r.state().set_new(false);
    r
}

#[test]
fn hit_returns_the_same_object() -> Result<()> {
    let mut cache = RowCache::new(3, 1 << 20);
    let mut saver = RecordingSaver::default();
    let a = row(8, 10);
    let b = row(16, 10);
    cache.put(a.clone(), &mut saver)?;
    cache.put(b.clone(), &mut saver)?;

    let got = cache.get(8).expect("resident");
    assert!(Arc::ptr_eq(&got, &a));
    assert!(cache.get(24).is_none());
    assert_eq!(cache.len(), 2);
    assert!(saver.saved.is_empty(), "no eviction below capacity");
    Ok(())
}

#[test]
fn colder_row_goes_first_under_pressure() -> Result<()> {
    let mut cache = RowCache::new(2, 1 << 20);
    let mut saver = RecordingSaver::default();
    cache.put(row(8, 16), &mut saver)?;
    cache.put(row(16, 16), &mut saver)?;
    // большая строка, место есть только после вытеснения
    cache.put(row(24, 5000), &mut saver)?;

    assert!(cache.len() <= 2);
    assert!(!cache.contains(8), "colder row must be evicted");
    assert!(cache.contains(16));
    assert!(cache.contains(24));
    assert_eq!(saver.saved, vec![8], "dirty victim saved before removal");
    assert_eq!(saver.resident_when_saved, vec![true]);
    Ok(())
}

#[test]
fn pinned_rows_are_never_evicted() -> Result<()> {
    let mut cache = RowCache::new(4, 1 << 20);
    let mut saver = RecordingSaver::default();
    let rows: Vec<RowRef> = (1..=4).map(|i| row(i * 8, 32)).collect();
    for r in &rows {
        cache.put(r.clone(), &mut saver)?;
    }
    assert!(rows[0].keep_in_memory(true));

    cache.clean_up(true, &mut saver)?;
    assert_eq!(cache.len(), 1);
    assert!(cache.contains(8));
    let mut saved = saver.saved.clone();
    saved.sort_unstable();
    assert_eq!(saved, vec![16, 24, 32]);
    assert!(rows[0].has_changed(), "pinned row is not even saved");

    assert!(rows[0].keep_in_memory(false));
    cache.clean_up(true, &mut saver)?;
    assert!(cache.is_empty());
    assert_eq!(cache.total_bytes(), 0);
    Ok(())
}

#[test]
fn cache_full_when_everything_is_pinned() -> Result<()> {
    let mut cache = RowCache::new(2, 1 << 20);
    let mut saver = RecordingSaver::default();
    for pos in [8u64, 16] {
        let r = row(pos, 8);
        r.keep_in_memory(true);
        cache.put(r, &mut saver)?;
    }
    let err = cache
        .put(row(24, 8), &mut saver)
        .expect_err("no room left");
    assert!(StorageError::is_capacity(&err));
    assert_eq!(cache.len(), 2);
    Ok(())
}

#[test]
fn dirty_rows_are_saved_before_removal_clean_ones_are_not() -> Result<()> {
    let mut cache = RowCache::new(8, 1 << 20);
    let mut saver = RecordingSaver::default();
    let mut dirty = HashSet::new();
    for i in 1..=8u64 {
        if i % 2 == 0 {
            cache.put(clean_row(i * 16, 40), &mut saver)?;
        } else {
            dirty.insert(i * 16);
            cache.put(row(i * 16, 40), &mut saver)?;
        }
    }
    cache.put(row(1000, 40), &mut saver)?;

    let gone: Vec<u64> = (1..=8u64)
        .map(|i| i * 16)
        .filter(|p| !cache.contains(*p))
        .collect();
    assert!(!gone.is_empty());
    for p in &gone {
        if dirty.contains(p) {
            assert!(saver.saved.contains(p), "dirty row {} dropped unsaved", p);
        } else {
            assert!(!saver.saved.contains(p), "clean row {} was written", p);
        }
    }
    assert!(saver.resident_when_saved.iter().all(|r| *r));
    Ok(())
}

#[test]
fn release_and_replace_keep_byte_total() -> Result<()> {
    let mut cache = RowCache::new(8, 1 << 20);
    let mut saver = RecordingSaver::default();
    let a = row(8, 100);
    cache.put(a.clone(), &mut saver)?;
    cache.put(row(200, 20), &mut saver)?;
    let before = cache.total_bytes();

    let b = row(8, 300);
    let old = cache.replace(8, b.clone()).expect("position present");
    assert!(Arc::ptr_eq(&old, &a));
    assert!(!a.is_in_memory());
    assert!(b.is_in_memory());
    assert_eq!(
        cache.total_bytes(),
        before - a.storage_size() as u64 + b.storage_size() as u64
    );

    let gone = cache.release(8).expect("resident");
    assert!(Arc::ptr_eq(&gone, &b));
    assert!(!b.is_in_memory());
    assert_eq!(cache.len(), 1);
    assert!(cache.release(8).is_none());
    assert_eq!(cache.release_range(0, 1000), 1);
    assert_eq!(cache.total_bytes(), 0);
    Ok(())
}

#[test]
fn save_all_writes_sorted_fixed_size_batches() -> Result<()> {
    let mut cache = RowCache::new(4096, 1 << 30);
    let mut saver = RecordingSaver::default();
    // позиции в перемешанном порядке
    let mut rng = oorandom::Rand32::new(7);
    let mut positions: Vec<u64> = (1..=2500u64).map(|i| i * 8).collect();
    for i in (1..positions.len()).rev() {
        let j = rng.rand_range(0..(i as u32 + 1)) as usize;
        positions.swap(i, j);
    }
    for p in &positions {
        cache.put(row(*p, 1), &mut saver)?;
    }
    cache.save_all(&mut saver)?;

    let sizes: Vec<usize> = saver.batches.iter().map(|b| b.len()).collect();
    assert_eq!(sizes, vec![1024, 1024, 452]);
    assert!(saver.saved.windows(2).all(|w| w[0] < w[1]));

    // второй проход: всё чисто
    saver.batches.clear();
    cache.save_all(&mut saver)?;
    assert!(saver.batches.is_empty());
    Ok(())
}

#[test]
fn capacity_invariant_holds_for_random_sequences() -> Result<()> {
    const CAP_ROWS: usize = 16;
    const CAP_BYTES: u64 = 4096;

    for seed in [1u64, 42, 1234, 99_999] {
        let mut rng = oorandom::Rand32::new(seed);
        let mut cache = RowCache::new(CAP_ROWS, CAP_BYTES);
        let mut saver = RecordingSaver::default();
        let mut next_pos = 8u64;
        let mut pinned: Vec<RowRef> = Vec::new();

        for _ in 0..2000 {
            match rng.rand_range(0..10) {
                0..=5 => {
                    let r = row(next_pos, rng.rand_range(1..600) as usize);
                    next_pos += 1000;
                    if let Err(e) = cache.put(r, &mut saver) {
                        assert!(StorageError::is_capacity(&e), "unexpected error: {:#}", e);
                    }
                }
                6 => {
                    let p = 8 + 1000 * rng.rand_range(0..((next_pos / 1000) as u32 + 1)) as u64;
                    cache.release(p);
                }
                7 => {
                    let p = 8 + 1000 * rng.rand_range(0..((next_pos / 1000) as u32 + 1)) as u64;
                    if let Some(r) = cache.get(p) {
                        if pinned.len() < 3 && r.keep_in_memory(true) {
                            pinned.push(r);
                        }
                    }
                }
                8 => {
                    if let Some(r) = pinned.pop() {
                        r.keep_in_memory(false);
                    }
                }
                _ => {
                    let p = 8 + 1000 * rng.rand_range(0..((next_pos / 1000) as u32 + 1)) as u64;
                    let _ = cache.get(p);
                }
            }
            assert!(cache.len() <= CAP_ROWS, "rows {} > {}", cache.len(), CAP_ROWS);
            assert!(
                cache.total_bytes() <= CAP_BYTES,
                "bytes {} > {}",
                cache.total_bytes(),
                CAP_BYTES
            );
        }
        for r in pinned.drain(..) {
            r.keep_in_memory(false);
        }
    }
    Ok(())
}
