//! In-memory log-structured index
//!
//! Append-only index over record batches, keyed by the tx that admitted
//! them. Batches enter at L0; compaction merges a whole level into one part
//! one level down, bottoming out at L2. Serialization forces everything to
//! L2 and writes a single Arrow IPC stream.
//!
//! All operations are internally synchronized; callers never lock around
//! the index. A scan snapshots every level at once, so each admitted batch
//! is observed exactly once regardless of concurrent merges.

use std::io::Write;
use std::sync::Arc;

use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use parking_lot::RwLock;

use crate::convert::merge_batches;
use crate::metrics::TableMetrics;
use crate::source::{Emit, ScanItem};
use crate::sync::Cancellation;
use crate::Result;

pub const L0: usize = 0;
pub const L1: usize = 1;
pub const L2: usize = 2;
const NUM_LEVELS: usize = 3;

/// L0 part count that triggers an inline merge into L1.
const L0_COMPACT_THRESHOLD: usize = 64;

struct Part {
    /// Highest tx folded into this part.
    tx: u64,
    batch: RecordBatch,
}

/// Multi-level index over record batches.
pub struct InMemoryIndex {
    table: String,
    levels: [RwLock<Vec<Part>>; NUM_LEVELS],
    metrics: Arc<TableMetrics>,
}

impl InMemoryIndex {
    pub fn new(table: impl Into<String>, metrics: Arc<TableMetrics>) -> Self {
        Self {
            table: table.into(),
            levels: std::array::from_fn(|_| RwLock::new(Vec::new())),
            metrics,
        }
    }

    /// Admit a batch at the given tx.
    pub fn add(&self, tx: u64, batch: RecordBatch) {
        let len = {
            let mut l0 = self.levels[L0].write();
            l0.push(Part { tx, batch });
            l0.len()
        };
        self.metrics.inc_granules_created();
        self.metrics.set_num_parts(self.num_parts());

        if len >= L0_COMPACT_THRESHOLD {
            if let Err(e) = self.merge(L0) {
                log::warn!("table {}: L0 merge failed: {}", self.table, e);
            }
        }
    }

    /// Emit every resident batch exactly once.
    pub fn scan(&self, ctx: &Cancellation, emit: Emit<'_>) -> Result<()> {
        // Hold all level locks while snapshotting so a concurrent merge
        // cannot move a part between levels mid-scan.
        let batches: Vec<RecordBatch> = {
            let guards: Vec<_> = self.levels.iter().map(|l| l.read()).collect();
            guards
                .iter()
                .flat_map(|level| level.iter().map(|p| p.batch.clone()))
                .collect()
        };

        for batch in batches {
            ctx.check()?;
            emit(ScanItem::Batch(batch))?;
        }
        Ok(())
    }

    /// Merge every part of `level` into a single part at `level + 1`.
    pub fn merge(&self, level: usize) -> Result<()> {
        assert!(level < L2, "bottom level has nowhere to merge into");

        let mut lower = self.levels[level].write();
        let mut upper = self.levels[level + 1].write();

        if lower.is_empty() {
            self.metrics.inc_compactions_aborted();
            return Ok(());
        }
        self.metrics.inc_compactions();

        let max_tx = lower.iter().map(|p| p.tx).max().unwrap_or(0);
        let batches: Vec<RecordBatch> = lower.iter().map(|p| p.batch.clone()).collect();
        if let Some(merged) = merge_batches(&batches)? {
            upper.push(Part {
                tx: max_tx,
                batch: merged,
            });
        }
        lower.clear();
        drop(upper);
        drop(lower);

        self.metrics.set_num_parts(self.num_parts());
        Ok(())
    }

    /// Merge intermediate levels down. Cheap when already compacted.
    pub fn ensure_compaction(&self) -> Result<()> {
        self.merge(L0)?;
        self.merge(L1)?;
        Ok(())
    }

    /// Force all levels to L2 and write the result as one IPC stream.
    /// An empty index writes nothing.
    pub fn serialize<W: Write>(&self, writer: &mut W) -> Result<()> {
        self.merge(L0)?;
        self.merge(L1)?;

        let mut l2 = self.levels[L2].write();
        if l2.is_empty() {
            return Ok(());
        }
        let max_tx = l2.iter().map(|p| p.tx).max().unwrap_or(0);
        let batches: Vec<RecordBatch> = l2.iter().map(|p| p.batch.clone()).collect();
        let merged = match merge_batches(&batches)? {
            Some(b) => b,
            None => return Ok(()),
        };
        l2.clear();
        l2.push(Part {
            tx: max_tx,
            batch: merged.clone(),
        });
        drop(l2);

        let mut ipc = StreamWriter::try_new(writer, merged.schema().as_ref())?;
        ipc.write(&merged)?;
        ipc.finish()?;
        Ok(())
    }

    /// Total parts across all levels.
    pub fn num_parts(&self) -> u64 {
        self.levels.iter().map(|l| l.read().len() as u64).sum()
    }

    /// Total resident rows across all levels.
    pub fn num_rows(&self) -> u64 {
        self.levels
            .iter()
            .map(|l| l.read().iter().map(|p| p.batch.num_rows() as u64).sum::<u64>())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema as ArrowSchema};
    use std::thread;

    fn batch(values: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(ArrowSchema::new(vec![Field::new(
            "v",
            DataType::Int64,
            true,
        )]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).unwrap()
    }

    fn collect_rows(index: &InMemoryIndex) -> u64 {
        let mut rows = 0u64;
        let mut emit = |item: ScanItem| -> crate::Result<()> {
            if let ScanItem::Batch(b) = item {
                rows += b.num_rows() as u64;
            }
            Ok(())
        };
        index.scan(&Cancellation::new(), &mut emit).unwrap();
        rows
    }

    #[test]
    fn test_add_and_scan() {
        let index = InMemoryIndex::new("t", Arc::new(TableMetrics::new()));
        index.add(1, batch(vec![1, 2, 3]));
        index.add(2, batch(vec![4]));

        assert_eq!(index.num_parts(), 2);
        assert_eq!(collect_rows(&index), 4);
    }

    #[test]
    fn test_merge_preserves_rows() {
        let metrics = Arc::new(TableMetrics::new());
        let index = InMemoryIndex::new("t", metrics.clone());
        for i in 0..10 {
            index.add(i, batch(vec![i as i64]));
        }

        index.merge(L0).unwrap();
        assert_eq!(index.num_parts(), 1);
        assert_eq!(collect_rows(&index), 10);
        assert_eq!(metrics.compactions(), 1);

        // Merging an empty level is a no-op
        index.merge(L0).unwrap();
        assert_eq!(collect_rows(&index), 10);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let index = InMemoryIndex::new("t", Arc::new(TableMetrics::new()));
        index.add(1, batch(vec![1, 2]));
        index.add(2, batch(vec![3]));

        let mut buf = Vec::new();
        index.serialize(&mut buf).unwrap();

        let reader =
            arrow::ipc::reader::StreamReader::try_new(std::io::Cursor::new(buf), None).unwrap();
        let rows: usize = reader.map(|b| b.unwrap().num_rows()).sum();
        assert_eq!(rows, 3);

        // Serialization compacts but keeps the data resident
        assert_eq!(collect_rows(&index), 3);
    }

    #[test]
    fn test_serialize_empty_writes_nothing() {
        let index = InMemoryIndex::new("t", Arc::new(TableMetrics::new()));
        let mut buf = Vec::new();
        index.serialize(&mut buf).unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_concurrent_add_and_scan() {
        let index = Arc::new(InMemoryIndex::new("t", Arc::new(TableMetrics::new())));

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let index = Arc::clone(&index);
                thread::spawn(move || {
                    for i in 0..100 {
                        index.add((w * 100 + i) as u64, batch(vec![i as i64]));
                    }
                })
            })
            .collect();

        // Scans run while writers are active; row counts only grow.
        let mut last = 0;
        for _ in 0..10 {
            let rows = collect_rows(&index);
            assert!(rows >= last);
            last = rows;
        }

        for handle in writers {
            handle.join().unwrap();
        }
        assert_eq!(collect_rows(&index), 400);
    }
}
