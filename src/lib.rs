#![allow(non_snake_case)]

// Базовые модули
pub mod consts;
pub mod error;
pub mod config;
pub mod metrics;
pub mod lock;
pub mod header;

// Файл и строки
pub mod storage;  // src/storage/{mod,raf,mapped}.rs
pub mod row;      // src/row/{mod,state,io,blob}.rs
pub mod cache;    // src/cache/{mod,rank}.rs

// Восстановление
pub mod shadow;   // src/shadow/{mod,restore}.rs
pub mod backup;

// Свободное место
pub mod space;    // src/space/{mod,bitmap,table_space,simple,blocks/}

// Фасад и хранилища строк
pub mod datafile; // src/datafile/{mod,core,open,checkpoint,defrag}.rs
pub mod store;    // src/store/{mod,memory,cached}.rs

// Удобные реэкспорты
pub use cache::{RowCache, RowSaver};
pub use config::{StoreBuilder, StoreConfig};
pub use datafile::{CacheStats, DataFileCache, DefragReport, DefragSource, FileSet, Lifecycle};
pub use error::StorageError;
pub use header::DataFileHeader;
pub use row::{downcast_row, BlobReader, BlobRow, CachedObject, RowReader, RowRef, RowState};
pub use space::{BlockSpaceManager, DataSpaceManager, SimpleSpaceManager};
pub use store::RowStore;
