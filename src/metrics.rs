//! Lightweight global metrics for RowQuiver.
//!
//! Потокобезопасные атомарные счётчики для подсистем:
//! - Row cache (hits / misses / evictions)
//! - Save path (rows, batches)
//! - Shadow log (copies, bytes)
//! - Checkpoint / defrag / backup

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

// ----- Row cache -----
static CACHE_HITS: AtomicU64 = AtomicU64::new(0);
static CACHE_MISSES: AtomicU64 = AtomicU64::new(0);
static CACHE_EVICTIONS: AtomicU64 = AtomicU64::new(0);
static CACHE_CLEANUPS: AtomicU64 = AtomicU64::new(0);
static CACHE_REBASES: AtomicU64 = AtomicU64::new(0);

// ----- Save path -----
static ROWS_SAVED: AtomicU64 = AtomicU64::new(0);
static SAVE_BATCHES: AtomicU64 = AtomicU64::new(0);
static FILE_READS: AtomicU64 = AtomicU64::new(0);

// ----- Shadow log -----
static SHADOW_COPIES: AtomicU64 = AtomicU64::new(0);
static SHADOW_BYTES: AtomicU64 = AtomicU64::new(0);

// ----- Lifecycle -----
static CHECKPOINTS: AtomicU64 = AtomicU64::new(0);
static DEFRAGS: AtomicU64 = AtomicU64::new(0);
static BACKUPS_WRITTEN: AtomicU64 = AtomicU64::new(0);
static RESTORES: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    // Row cache
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    pub cache_cleanups: u64,
    pub cache_rebases: u64,

    // Save path
    pub rows_saved: u64,
    pub save_batches: u64,
    pub file_reads: u64,

    // Shadow log
    pub shadow_copies: u64,
    pub shadow_bytes: u64,

    // Lifecycle
    pub checkpoints: u64,
    pub defrags: u64,
    pub backups_written: u64,
    pub restores: u64,
}

impl MetricsSnapshot {
    pub fn cache_hit_ratio(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }

    pub fn avg_save_batch_rows(&self) -> f64 {
        if self.save_batches == 0 {
            0.0
        } else {
            self.rows_saved as f64 / self.save_batches as f64
        }
    }
}

// ----- Recorders (Row cache) -----
pub fn record_cache_hit() {
    CACHE_HITS.fetch_add(1, Ordering::Relaxed);
}
pub fn record_cache_miss() {
    CACHE_MISSES.fetch_add(1, Ordering::Relaxed);
}
pub fn record_cache_evictions(n: usize) {
    CACHE_EVICTIONS.fetch_add(n as u64, Ordering::Relaxed);
}
pub fn record_cache_cleanup() {
    CACHE_CLEANUPS.fetch_add(1, Ordering::Relaxed);
}
pub fn record_cache_rebase() {
    CACHE_REBASES.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (Save path) -----
pub fn record_save_batch(rows: usize) {
    SAVE_BATCHES.fetch_add(1, Ordering::Relaxed);
    ROWS_SAVED.fetch_add(rows as u64, Ordering::Relaxed);
}
pub fn record_file_read() {
    FILE_READS.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (Shadow log) -----
pub fn record_shadow_copy(bytes: usize) {
    SHADOW_COPIES.fetch_add(1, Ordering::Relaxed);
    SHADOW_BYTES.fetch_add(bytes as u64, Ordering::Relaxed);
}

// ----- Recorders (Lifecycle) -----
pub fn record_checkpoint() {
    CHECKPOINTS.fetch_add(1, Ordering::Relaxed);
}
pub fn record_defrag() {
    DEFRAGS.fetch_add(1, Ordering::Relaxed);
}
pub fn record_backup_written() {
    BACKUPS_WRITTEN.fetch_add(1, Ordering::Relaxed);
}
pub fn record_restore() {
    RESTORES.fetch_add(1, Ordering::Relaxed);
}

/// Снимок всех счётчиков.
pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        cache_hits: CACHE_HITS.load(Ordering::Relaxed),
        cache_misses: CACHE_MISSES.load(Ordering::Relaxed),
        cache_evictions: CACHE_EVICTIONS.load(Ordering::Relaxed),
        cache_cleanups: CACHE_CLEANUPS.load(Ordering::Relaxed),
        cache_rebases: CACHE_REBASES.load(Ordering::Relaxed),

        rows_saved: ROWS_SAVED.load(Ordering::Relaxed),
        save_batches: SAVE_BATCHES.load(Ordering::Relaxed),
        file_reads: FILE_READS.load(Ordering::Relaxed),

        shadow_copies: SHADOW_COPIES.load(Ordering::Relaxed),
        shadow_bytes: SHADOW_BYTES.load(Ordering::Relaxed),

        checkpoints: CHECKPOINTS.load(Ordering::Relaxed),
        defrags: DEFRAGS.load(Ordering::Relaxed),
        backups_written: BACKUPS_WRITTEN.load(Ordering::Relaxed),
        restores: RESTORES.load(Ordering::Relaxed),
    }
}

/// Сброс всех счётчиков (для тестов/бенчей).
pub fn reset() {
    for c in [
        &CACHE_HITS,
        &CACHE_MISSES,
        &CACHE_EVICTIONS,
        &CACHE_CLEANUPS,
        &CACHE_REBASES,
        &ROWS_SAVED,
        &SAVE_BATCHES,
        &FILE_READS,
        &SHADOW_COPIES,
        &SHADOW_BYTES,
        &CHECKPOINTS,
        &DEFRAGS,
        &BACKUPS_WRITTEN,
        &RESTORES,
    ] {
        c.store(0, Ordering::Relaxed);
    }
}
