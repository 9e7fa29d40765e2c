//! Centralized configuration and builder for RowQuiver.
//!
//! Goals:
//! - Single place to collect tunables instead of scattering env lookups.
//! - `StoreConfig::from_env()` reads `RQ_*` variables on top of the defaults.
//! - `StoreBuilder` produces a validated `StoreConfig` that `DataFileCache` consumes.
//!
//! Defaults follow the classic cached-table settings:
//! - cache_rows = 3 * 2^14 rows, cache_bytes = cache_rows * 1 KiB
//! - data_file_scale = 8, file blocks of 1 MiB
//! - incremental (shadow) backup on, memory-mapped backend off

use std::fmt;

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::consts::{LARGE_DATA_FACTOR, MAX_SCALED_POSITION};

#[derive(Clone, Debug, Serialize)]
pub struct StoreConfig {
    /// Row-count capacity of the cache.
    /// Env: RQ_CACHE_ROWS (default 49152)
    pub cache_rows: usize,

    /// Byte capacity of the cache (sum of storage sizes).
    /// Env: RQ_CACHE_BYTES (default cache_rows * 1024)
    pub cache_bytes: u64,

    /// Scale unit of stored positions: 1 or a power of two in 8..=1024.
    /// Env: RQ_DATA_FILE_SCALE (default 8)
    pub data_file_scale: u32,

    /// File block size of the "blocks" allocator in MiB (power of two, 1..=64).
    /// Env: RQ_FILE_BLOCK_MB (default 1)
    pub file_block_mb: u32,

    /// Use the directory/bitmap allocator for files without allocator metadata.
    /// Env: RQ_SPACE_BLOCKS (default true)
    pub space_blocks: bool,

    /// Shadow-copy (incremental) backup instead of a compressed full backup.
    /// Env: RQ_INC_BACKUP (default true)
    pub incremental_backup: bool,

    /// Memory-mapped data file backend.
    /// Env: RQ_NIO (default false)
    pub nio: bool,

    /// Mapped backend falls back to plain file I/O above this size.
    /// Env: RQ_NIO_MAX_BYTES (default 256 MiB)
    pub nio_max_bytes: u64,

    /// Raise the maximum data file size by LARGE_DATA_FACTOR.
    /// Env: RQ_LARGE_DATA (default false)
    pub large_data: bool,

    /// `should_defrag()` fires when lost space exceeds this share of the file (0 = never).
    /// Env: RQ_DEFRAG_LIMIT (default 0)
    pub defrag_limit_percent: u32,

    /// Capacity of in-memory free lists (simple allocator, table-space lookups).
    /// Env: RQ_MAX_FREE_BLOCKS (default 512)
    pub max_free_blocks: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let cache_rows = 3 * (1usize << 14);
        Self {
            cache_rows,
            cache_bytes: cache_rows as u64 * 1024,
            data_file_scale: 8,
            file_block_mb: 1,
            space_blocks: true,
            incremental_backup: true,
            nio: false,
            nio_max_bytes: 256 * 1024 * 1024,
            large_data: false,
            defrag_limit_percent: 0,
            max_free_blocks: 512,
        }
    }
}

#[inline]
fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| {
        let s = v.trim().to_ascii_lowercase();
        s == "1" || s == "true" || s == "yes" || s == "on"
    })
}

#[inline]
fn env_num<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
}

impl StoreConfig {
    /// Defaults overridden by environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(n) = env_num::<usize>("RQ_CACHE_ROWS") {
            cfg.cache_rows = n;
            cfg.cache_bytes = n as u64 * 1024;
        }
        if let Some(n) = env_num::<u64>("RQ_CACHE_BYTES") {
            cfg.cache_bytes = n;
        }
        if let Some(n) = env_num::<u32>("RQ_DATA_FILE_SCALE") {
            cfg.data_file_scale = n;
        }
        if let Some(n) = env_num::<u32>("RQ_FILE_BLOCK_MB") {
            cfg.file_block_mb = n;
        }
        if let Some(on) = env_flag("RQ_SPACE_BLOCKS") {
            cfg.space_blocks = on;
        }
        if let Some(on) = env_flag("RQ_INC_BACKUP") {
            cfg.incremental_backup = on;
        }
        if let Some(on) = env_flag("RQ_NIO") {
            cfg.nio = on;
        }
        if let Some(n) = env_num::<u64>("RQ_NIO_MAX_BYTES") {
            cfg.nio_max_bytes = n;
        }
        if let Some(on) = env_flag("RQ_LARGE_DATA") {
            cfg.large_data = on;
        }
        if let Some(n) = env_num::<u32>("RQ_DEFRAG_LIMIT") {
            cfg.defrag_limit_percent = n;
        }
        if let Some(n) = env_num::<usize>("RQ_MAX_FREE_BLOCKS") {
            cfg.max_free_blocks = n;
        }

        cfg
    }

    pub fn validate(&self) -> Result<()> {
        let s = self.data_file_scale;
        if !(s == 1 || (s.is_power_of_two() && (8..=1024).contains(&s))) {
            return Err(anyhow!(
                "data_file_scale must be 1 or a power of two in [8 .. 1024], got {}",
                s
            ));
        }
        let mb = self.file_block_mb;
        if !(mb.is_power_of_two() && mb <= 64) {
            return Err(anyhow!(
                "file_block_mb must be a power of two in [1 .. 64], got {}",
                mb
            ));
        }
        if self.cache_rows == 0 || self.cache_bytes == 0 {
            return Err(anyhow!("cache capacities must be > 0"));
        }
        if self.max_free_blocks < 2 {
            return Err(anyhow!("max_free_blocks must be >= 2"));
        }
        Ok(())
    }

    /// Largest allowed data file size in bytes.
    pub fn max_data_file_size(&self) -> u64 {
        let base = MAX_SCALED_POSITION * self.data_file_scale as u64;
        if self.large_data {
            base * LARGE_DATA_FACTOR
        } else {
            base
        }
    }

    /// Row padding: rows are stored at multiples of max(8, scale).
    pub fn cached_row_padding(&self) -> u32 {
        self.data_file_scale.max(8)
    }

    pub fn file_block_size(&self) -> u64 {
        self.file_block_mb as u64 * 1024 * 1024
    }

    pub fn with_cache_rows(mut self, rows: usize) -> Self {
        self.cache_rows = rows;
        self
    }

    pub fn with_cache_bytes(mut self, bytes: u64) -> Self {
        self.cache_bytes = bytes;
        self
    }

    pub fn with_data_file_scale(mut self, scale: u32) -> Self {
        self.data_file_scale = scale;
        self
    }

    pub fn with_file_block_mb(mut self, mb: u32) -> Self {
        self.file_block_mb = mb;
        self
    }

    pub fn with_space_blocks(mut self, on: bool) -> Self {
        self.space_blocks = on;
        self
    }

    pub fn with_incremental_backup(mut self, on: bool) -> Self {
        self.incremental_backup = on;
        self
    }

    pub fn with_nio(mut self, on: bool) -> Self {
        self.nio = on;
        self
    }

    pub fn with_nio_max_bytes(mut self, bytes: u64) -> Self {
        self.nio_max_bytes = bytes;
        self
    }

    pub fn with_large_data(mut self, on: bool) -> Self {
        self.large_data = on;
        self
    }

    pub fn with_defrag_limit_percent(mut self, pct: u32) -> Self {
        self.defrag_limit_percent = pct;
        self
    }

    pub fn with_max_free_blocks(mut self, n: usize) -> Self {
        self.max_free_blocks = n;
        self
    }
}

impl fmt::Display for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StoreConfig {{ \
             cache_rows: {}, \
             cache_bytes: {}, \
             data_file_scale: {}, \
             file_block_mb: {}, \
             space_blocks: {}, \
             incremental_backup: {}, \
             nio: {}, \
             nio_max_bytes: {}, \
             large_data: {}, \
             defrag_limit_percent: {}, \
             max_free_blocks: {} \
             }}",
            self.cache_rows,
            self.cache_bytes,
            self.data_file_scale,
            self.file_block_mb,
            self.space_blocks,
            self.incremental_backup,
            self.nio,
            self.nio_max_bytes,
            self.large_data,
            if self.defrag_limit_percent == 0 {
                "off".to_string()
            } else {
                format!("{}%", self.defrag_limit_percent)
            },
            self.max_free_blocks,
        )
    }
}

/// Builder producing a validated StoreConfig.
#[derive(Clone, Debug)]
pub struct StoreBuilder {
    cfg: StoreConfig,
}

impl Default for StoreBuilder {
    fn default() -> Self {
        // Start from env to preserve current behavior, then allow overrides.
        Self {
            cfg: StoreConfig::from_env(),
        }
    }
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a clean default (without reading env).
    pub fn from_default() -> Self {
        Self {
            cfg: StoreConfig::default(),
        }
    }

    pub fn cache_rows(mut self, rows: usize) -> Self {
        self.cfg.cache_rows = rows;
        self
    }

    pub fn cache_bytes(mut self, bytes: u64) -> Self {
        self.cfg.cache_bytes = bytes;
        self
    }

    pub fn data_file_scale(mut self, scale: u32) -> Self {
        self.cfg.data_file_scale = scale;
        self
    }

    pub fn file_block_mb(mut self, mb: u32) -> Self {
        self.cfg.file_block_mb = mb;
        self
    }

    pub fn space_blocks(mut self, on: bool) -> Self {
        self.cfg.space_blocks = on;
        self
    }

    pub fn incremental_backup(mut self, on: bool) -> Self {
        self.cfg.incremental_backup = on;
        self
    }

    pub fn nio(mut self, on: bool) -> Self {
        self.cfg.nio = on;
        self
    }

    pub fn nio_max_bytes(mut self, bytes: u64) -> Self {
        self.cfg.nio_max_bytes = bytes;
        self
    }

    pub fn large_data(mut self, on: bool) -> Self {
        self.cfg.large_data = on;
        self
    }

    pub fn defrag_limit_percent(mut self, pct: u32) -> Self {
        self.cfg.defrag_limit_percent = pct;
        self
    }

    pub fn max_free_blocks(mut self, n: usize) -> Self {
        self.cfg.max_free_blocks = n;
        self
    }

    /// Finish the builder; rejects invalid scales and capacities.
    pub fn build(self) -> Result<StoreConfig> {
        self.cfg.validate()?;
        Ok(self.cfg)
    }
}
