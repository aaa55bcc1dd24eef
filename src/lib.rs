//! Strata Table Engine
//!
//! A columnar, append-only table engine built around Arrow record batches.
//! Ingested batches land in an in-memory log-structured index inside the
//! active table block; when the block crosses a size threshold it is rotated
//! out and persisted as an immutable columnar file while a fresh block takes
//! over. Scans fan row groups out from every live source (memory blocks and
//! persisted files) to a set of parallel callbacks.
//!
//! Core pieces:
//! - `TxClock`: monotonic transaction ids and read snapshots
//! - `Wal`: durable, tx-ordered log of writes and block lifecycle events
//! - `InMemoryIndex`: multi-level append-only index keyed by tx
//! - `Table` / `TableBlock`: block lifecycle, rotation, persistence
//! - `Synchronizer`: multi-producer barrier with exactly-once finish

pub mod config;
pub mod convert;
pub mod index;
pub mod metrics;
pub mod query;
pub mod source;
pub mod store;
pub mod sync;
pub mod table;
pub mod txn;
pub mod wal;

// Re-export main types
pub use config::{LogicalType, SchemaDefinition, SchemaDefinitionV2, SchemaSpec, TableConfig};
pub use index::InMemoryIndex;
pub use metrics::TableMetrics;
pub use query::{Sink, Synchronizer};
pub use source::{DynamicRowGroup, Filter, RowGroupSource, Scalar, ScanItem};
pub use store::{BlockStore, DirBlockStore, MemBlockStore};
pub use sync::Cancellation;
pub use table::block::TableBlock;
pub use table::{Callback, ScanOptions, Table, TableDeps};
pub use txn::TxClock;
pub use wal::{FileWal, MemWal, NopWal, Wal, WalRecord};

/// Table engine error type
#[derive(Debug, thiserror::Error)]
pub enum StrataError {
    #[error("table closing")]
    Closing,

    #[error("no schema")]
    NoSchema,

    #[error("wal: {0}")]
    Wal(String),

    #[error("failed to write batch: {0}")]
    Write(String),

    #[error("failed to read row group: {0}")]
    Read(String),

    #[error("operation canceled")]
    Canceled,

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("internal: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, StrataError>;
