//! Общие константы форматов (data-файл, заголовок, shadow-лог, аллокатор).

// -------- Data file header --------
pub const DATA_MAGIC: &[u8; 4] = b"RQDF";

pub const HDR_OFF_MAGIC: u64 = 0;
pub const HDR_OFF_EMPTY_SIZE: u64 = 4; // u64, lost/free bytes at last checkpoint
pub const HDR_OFF_FREE_POS: u64 = 12; // u64, logical end of allocated space (scale units)
pub const HDR_OFF_RESERVED: u64 = 20; // u32
pub const HDR_OFF_SPACE_ROOT: u64 = 24; // u32, allocator root in FIXED_BLOCK_UNIT units
pub const HDR_OFF_FLAGS: u64 = 28; // u32

/// Minimum free position (bytes): the header occupies [0, 32).
pub const INITIAL_FREE_POS: u64 = 32;

// -------- Header flags (bit numbers) --------
pub const FLAG_ISSHADOWED: u32 = 0;
pub const FLAG_ISSAVED: u32 = 1;
pub const FLAG_ROWINFO: u32 = 2;
pub const FLAG_190: u32 = 3;
pub const FLAG_HX: u32 = 4;

// -------- File names --------
pub const DATA_EXT: &str = "data";
pub const BACKUP_EXT: &str = "backup";
pub const LOCK_EXT: &str = "lck";
pub const NEW_SUFFIX: &str = "new";
pub const OLD_SUFFIX: &str = "old";

// -------- Row I/O --------
/// Initial size of the reusable row input/output buffers. Rows at or above
/// this size count as "large" for eager eviction of new rows.
pub const INIT_IO_BUFFER_SIZE: usize = 4096;

/// Every serialized row starts with its storage size (u32).
pub const ROW_SIZE_PREFIX: usize = 4;

// -------- Row cache --------
/// Rows handed to the saver per batch during eviction / saveAll.
pub const CACHE_SAVE_BATCH: usize = 1024;
/// Access counter ceiling; crossing it triggers a rebase of all counters.
pub const ACCESS_MAX: u64 = (u32::MAX as u64) - ((u32::MAX as u64) >> 3);
/// Upper bound for nested keepInMemory() pins on one row.
pub const MAX_KEEP_PINS: u32 = 8;

// -------- Space manager --------
pub const TABLE_ID_DEFAULT: u32 = 0;
pub const TABLE_ID_DIRECTORY: u32 = 1;
pub const TABLE_ID_EMPTY: u32 = 2;
pub const TABLE_ID_FIRST: u32 = 3;

/// Allocator metadata (root / directory / bitmap objects) is aligned to this unit;
/// directory and root pointers are stored divided by it.
pub const FIXED_BLOCK_UNIT: u64 = 4096;
/// Entries per directory block and directory pointers per root block.
pub const DIR_BLOCK_SIZE: usize = 2048;
/// Stored directory entry width: table id, bitmap address, free units, trailing free units.
pub const DIR_ENTRY_BYTES: usize = 16;

// -------- Shadow log --------
pub const SHADOW_MAGIC: &[u8; 8] = b"RQSHADW1";
pub const SHADOW_HDR_SIZE: u64 = 16; // magic8 + original length u64
/// Record header: [len u32][offset u64][crc32c u32]
pub const SHADOW_REC_HDR_SIZE: usize = 16;
/// Granularity of before-image copies.
pub const SHADOW_PAGE_SIZE: u64 = 1 << 14;

// -------- Limits --------
/// Stored positions are limited to 31 bits (times scale, times large-data factor).
pub const MAX_SCALED_POSITION: u64 = i32::MAX as u64;
pub const LARGE_DATA_FACTOR: u64 = 4;
