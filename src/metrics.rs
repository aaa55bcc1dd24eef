//! Per-table metrics
//!
//! Lock-free counters and gauges owned by the table instance, plus a small
//! exponential-bucket histogram for insert batch sizes. `export` renders
//! everything under stable metric names with a `table` label so an outer
//! registry can scrape them.

use std::sync::atomic::{AtomicU64, Ordering};

pub const BLOCKS_ROTATED: &str = "table_blocks_rotated_total";
pub const GRANULES_CREATED: &str = "table_granules_created_total";
pub const GRANULES_COMPACTIONS: &str = "table_granules_compactions_total";
pub const GRANULES_SPLITS: &str = "table_granules_splits_total";
pub const GRANULES_COMPACTION_ABORTED: &str = "table_granules_compaction_aborted_total";
pub const ROWS_INSERTED: &str = "table_rows_inserted_total";
pub const ZERO_ROWS_INSERTED: &str = "table_zero_rows_inserted_total";
pub const ROW_INSERT_SIZE: &str = "table_row_insert_size";
pub const LAST_COMPLETED_BLOCK_TX: &str = "table_last_completed_block_tx";
pub const NUM_PARTS: &str = "table_num_parts";
pub const UNSORTED_INSERTS: &str = "table_unsorted_inserts_total";
pub const INDEX_SIZE: &str = "table_index_size";
pub const ACTIVE_BLOCK_SIZE: &str = "table_active_block_size";

const HISTOGRAM_BUCKETS: usize = 10;

/// Histogram with exponential buckets 1, 2, 4, .. 512 plus overflow.
pub struct Histogram {
    buckets: [AtomicU64; HISTOGRAM_BUCKETS],
    overflow: AtomicU64,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: Default::default(),
            overflow: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn observe(&self, value: u64) {
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        for i in 0..HISTOGRAM_BUCKETS {
            if value <= (1u64 << i) {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        self.overflow.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    /// Cumulative bucket counts paired with their upper bounds.
    pub fn cumulative_buckets(&self) -> Vec<(f64, u64)> {
        let mut out = Vec::with_capacity(HISTOGRAM_BUCKETS + 1);
        let mut acc = 0u64;
        for i in 0..HISTOGRAM_BUCKETS {
            acc += self.buckets[i].load(Ordering::Relaxed);
            out.push(((1u64 << i) as f64, acc));
        }
        acc += self.overflow.load(Ordering::Relaxed);
        out.push((f64::INFINITY, acc));
        out
    }
}

/// Counters and gauges for one table.
pub struct TableMetrics {
    blocks_rotated: AtomicU64,
    granules_created: AtomicU64,
    compactions: AtomicU64,
    granule_splits: AtomicU64,
    compactions_aborted: AtomicU64,
    rows_inserted: AtomicU64,
    zero_rows_inserted: AtomicU64,
    row_insert_size: Histogram,
    last_completed_block_tx: AtomicU64,
    num_parts: AtomicU64,
    unsorted_inserts: AtomicU64,
}

impl TableMetrics {
    pub fn new() -> Self {
        Self {
            blocks_rotated: AtomicU64::new(0),
            granules_created: AtomicU64::new(0),
            compactions: AtomicU64::new(0),
            granule_splits: AtomicU64::new(0),
            compactions_aborted: AtomicU64::new(0),
            rows_inserted: AtomicU64::new(0),
            zero_rows_inserted: AtomicU64::new(0),
            row_insert_size: Histogram::new(),
            last_completed_block_tx: AtomicU64::new(0),
            num_parts: AtomicU64::new(0),
            unsorted_inserts: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_blocks_rotated(&self) {
        self.blocks_rotated.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_granules_created(&self) {
        self.granules_created.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_compactions(&self) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_compactions_aborted(&self) {
        self.compactions_aborted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_rows_inserted(&self, rows: u64) {
        self.rows_inserted.fetch_add(rows, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_zero_rows_inserted(&self) {
        self.zero_rows_inserted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn observe_row_insert_size(&self, rows: u64) {
        self.row_insert_size.observe(rows);
    }

    #[inline]
    pub fn set_last_completed_block_tx(&self, tx: u64) {
        self.last_completed_block_tx.store(tx, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_num_parts(&self, parts: u64) {
        self.num_parts.store(parts, Ordering::Relaxed);
    }

    pub fn blocks_rotated(&self) -> u64 {
        self.blocks_rotated.load(Ordering::Relaxed)
    }

    pub fn rows_inserted(&self) -> u64 {
        self.rows_inserted.load(Ordering::Relaxed)
    }

    pub fn zero_rows_inserted(&self) -> u64 {
        self.zero_rows_inserted.load(Ordering::Relaxed)
    }

    pub fn compactions(&self) -> u64 {
        self.compactions.load(Ordering::Relaxed)
    }

    pub fn last_completed_block_tx(&self) -> u64 {
        self.last_completed_block_tx.load(Ordering::Relaxed)
    }

    pub fn row_insert_size(&self) -> &Histogram {
        &self.row_insert_size
    }

    /// Render all metrics under their stable names. `index_size` and
    /// `active_block_size` are computed by the table at export time.
    pub fn export(&self, table: &str, index_size: u64, active_block_size: u64) -> Vec<Metric> {
        let gauge = |name: &'static str, value: u64| Metric {
            name,
            table: table.to_string(),
            value: value as f64,
        };
        vec![
            gauge(BLOCKS_ROTATED, self.blocks_rotated.load(Ordering::Relaxed)),
            gauge(GRANULES_CREATED, self.granules_created.load(Ordering::Relaxed)),
            gauge(GRANULES_COMPACTIONS, self.compactions.load(Ordering::Relaxed)),
            gauge(GRANULES_SPLITS, self.granule_splits.load(Ordering::Relaxed)),
            gauge(
                GRANULES_COMPACTION_ABORTED,
                self.compactions_aborted.load(Ordering::Relaxed),
            ),
            gauge(ROWS_INSERTED, self.rows_inserted.load(Ordering::Relaxed)),
            gauge(
                ZERO_ROWS_INSERTED,
                self.zero_rows_inserted.load(Ordering::Relaxed),
            ),
            gauge(ROW_INSERT_SIZE, self.row_insert_size.count()),
            gauge(
                LAST_COMPLETED_BLOCK_TX,
                self.last_completed_block_tx.load(Ordering::Relaxed),
            ),
            gauge(NUM_PARTS, self.num_parts.load(Ordering::Relaxed)),
            gauge(UNSORTED_INSERTS, self.unsorted_inserts.load(Ordering::Relaxed)),
            gauge(INDEX_SIZE, index_size),
            gauge(ACTIVE_BLOCK_SIZE, active_block_size),
        ]
    }
}

impl Default for TableMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A single exported metric sample.
#[derive(Debug, Clone)]
pub struct Metric {
    pub name: &'static str,
    pub table: String,
    pub value: f64,
}
