//! Persistence and network plumbing: the CSV record store, crash-safe
//! checkpoints, the manufacturer mapping file, and paced HTTP fetching.

pub mod checkpoint;
pub mod fetch;
pub mod mapping;
pub mod pacing;
pub mod table;

pub use checkpoint::{
    evict_oldest, sha256_hex, sweep_stale_temps, verify_written, write_atomic, write_json_atomic,
    BackupCatalog, BackupEntry, CheckpointConfig, Checkpointer, PersistenceError, SaveReport,
    DEFAULT_BACKUP_RETENTION,
};
pub use fetch::{FetchError, FetchedPage, HttpClientConfig, HttpFetcher, RetryPolicy};
pub use mapping::{load_mapping_csv, parse_mapping_csv, render_mapping_csv, write_mapping_csv};
pub use pacing::FetchPacer;
pub use table::{ColumnMap, ExcludedRow, RecordStore, SlotColumns, StoreError, Table, TableShape};

pub const CRATE_NAME: &str = "harvest-storage";
