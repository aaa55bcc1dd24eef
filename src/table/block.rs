//! Table block
//!
//! The unit of mutable in-memory storage. A block owns an in-memory index
//! plus the counters and wait-groups that make rotation safe: writers and
//! readers register themselves so rotation can drain in-flight writes
//! before persistence and hold back memory release until the last reader
//! is gone.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use ulid::Ulid;

use crate::index::InMemoryIndex;
use crate::metrics::TableMetrics;
use crate::sync::WaitGroup;
use crate::Result;

pub struct TableBlock {
    ulid: Ulid,
    /// Tx at which this block became active.
    min_tx: u64,
    /// The previous block's min tx; 0 for the first block of a table.
    prev_tx: u64,

    /// Cumulative size of admitted batches in bytes. Monotonic while the
    /// block is writable.
    size: AtomicU64,
    /// Size at the time the block last triggered a snapshot. Maintained
    /// for snapshot trigger policies layered on top of the engine.
    last_snapshot_size: AtomicU64,

    index: InMemoryIndex,
    metrics: Arc<TableMetrics>,

    pending_writers: WaitGroup,
    pending_readers: WaitGroup,
}

impl TableBlock {
    pub(crate) fn new(
        table: &str,
        metrics: Arc<TableMetrics>,
        prev_tx: u64,
        min_tx: u64,
        ulid: Ulid,
    ) -> Self {
        Self {
            ulid,
            min_tx,
            prev_tx,
            size: AtomicU64::new(0),
            last_snapshot_size: AtomicU64::new(0),
            index: InMemoryIndex::new(table, Arc::clone(&metrics)),
            metrics,
            pending_writers: WaitGroup::new(),
            pending_readers: WaitGroup::new(),
        }
    }

    pub fn ulid(&self) -> Ulid {
        self.ulid
    }

    pub fn min_tx(&self) -> u64 {
        self.min_tx
    }

    pub fn prev_tx(&self) -> u64 {
        self.prev_tx
    }

    /// Size of all admitted batches in bytes.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    pub fn last_snapshot_size(&self) -> u64 {
        self.last_snapshot_size.load(Ordering::Relaxed)
    }

    pub fn set_last_snapshot_size(&self, size: u64) {
        self.last_snapshot_size.store(size, Ordering::Relaxed);
    }

    pub fn index(&self) -> &InMemoryIndex {
        &self.index
    }

    pub(crate) fn pending_writers(&self) -> &WaitGroup {
        &self.pending_writers
    }

    pub(crate) fn pending_readers(&self) -> &WaitGroup {
        &self.pending_readers
    }

    /// Admit a batch at `tx`. Zero-row batches are counted but never touch
    /// the index.
    pub fn insert_record(&self, tx: u64, batch: RecordBatch) -> Result<()> {
        let rows = batch.num_rows() as u64;
        self.metrics.observe_row_insert_size(rows);

        if rows == 0 {
            self.metrics.inc_zero_rows_inserted();
            return Ok(());
        }

        let bytes = batch.get_array_memory_size() as u64;
        self.index.add(tx, batch);
        self.size.fetch_add(bytes, Ordering::Relaxed);
        self.metrics.add_rows_inserted(rows);
        Ok(())
    }

    /// Merge all index levels down and write the block as a single Arrow
    /// IPC stream.
    pub fn serialize<W: Write>(&self, writer: &mut W) -> Result<()> {
        self.index.serialize(writer)
    }

    /// Force a compaction of the block's index.
    pub fn ensure_compaction(&self) -> Result<()> {
        self.index.ensure_compaction()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema as ArrowSchema};

    fn block() -> TableBlock {
        TableBlock::new("t", Arc::new(TableMetrics::new()), 0, 0, Ulid::new())
    }

    fn batch(values: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(ArrowSchema::new(vec![Field::new(
            "v",
            DataType::Int64,
            true,
        )]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).unwrap()
    }

    #[test]
    fn test_insert_grows_size() {
        let block = block();
        assert_eq!(block.size(), 0);

        block.insert_record(1, batch(vec![1, 2, 3])).unwrap();
        let after_one = block.size();
        assert!(after_one > 0);

        block.insert_record(2, batch(vec![4])).unwrap();
        assert!(block.size() > after_one);
        assert_eq!(block.index().num_rows(), 4);
    }

    #[test]
    fn test_zero_row_insert_skips_index() {
        let metrics = Arc::new(TableMetrics::new());
        let block = TableBlock::new("t", Arc::clone(&metrics), 0, 0, Ulid::new());

        block.insert_record(1, batch(vec![])).unwrap();
        assert_eq!(block.size(), 0);
        assert_eq!(block.index().num_parts(), 0);
        assert_eq!(metrics.zero_rows_inserted(), 1);
        assert_eq!(metrics.rows_inserted(), 0);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let block = block();
        block.insert_record(1, batch(vec![1, 2])).unwrap();
        block.insert_record(2, batch(vec![3])).unwrap();

        let mut buf = Vec::new();
        block.serialize(&mut buf).unwrap();

        let reader =
            arrow::ipc::reader::StreamReader::try_new(std::io::Cursor::new(buf), None).unwrap();
        let rows: usize = reader.map(|b| b.unwrap().num_rows()).sum();
        assert_eq!(rows, 3);
    }
}
