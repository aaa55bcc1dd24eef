//! Write-ahead log
//!
//! Every write and block lifecycle event is logged under its transaction id
//! before it takes effect in memory. `log` and `log_record` return only
//! after the entry is durable, so a crash between the WAL append and the
//! index insert is recovered by replay.
//!
//! Entry kinds consumed by the engine:
//! - `Write`: opaque application bytes
//! - `RecordBatch`: an Arrow IPC encoded batch
//! - `BlockCreated`: a new active block, with the table config it was built
//!   with
//! - `BlockPersisted`: a rotated block finished persisting

pub mod file;

use std::collections::BTreeMap;

use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::TableConfig;
use crate::{Result, StrataError};

pub use file::FileWal;

/// A single WAL entry payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalRecord {
    Write {
        table_name: String,
        data: Vec<u8>,
    },
    RecordBatch {
        table_name: String,
        /// Arrow IPC stream encoding of the batch.
        data: Vec<u8>,
    },
    BlockCreated {
        table_name: String,
        block_id: [u8; 16],
        config: TableConfig,
    },
    BlockPersisted {
        table_name: String,
        block_id: [u8; 16],
    },
}

/// Replay callback: receives entries in tx order.
pub type ReplayHandler<'a> = &'a mut dyn FnMut(u64, WalRecord) -> Result<()>;

/// Durable, tx-ordered log.
///
/// Implementations must be safe for concurrent `log` calls from distinct
/// transactions.
pub trait Wal: Send + Sync {
    /// Append an entry at `tx`. Durable when this returns.
    fn log(&self, tx: u64, record: WalRecord) -> Result<()>;

    /// Append a record batch at `tx`, encoded as an Arrow IPC stream.
    fn log_record(&self, tx: u64, table: &str, batch: &RecordBatch) -> Result<()> {
        let data = encode_record_batch(batch)?;
        self.log(
            tx,
            WalRecord::RecordBatch {
                table_name: table.to_string(),
                data,
            },
        )
    }

    /// Replay entries starting at `from_tx`. A `from_tx` of 0 starts at the
    /// WAL's first index; otherwise replay starts at
    /// `max(from_tx, first_index)`. A panicking handler truncates the log
    /// back to the last successfully applied entry.
    fn replay(&self, from_tx: u64, handler: ReplayHandler<'_>) -> Result<()>;

    /// Drop entries below `tx`.
    fn truncate(&self, tx: u64) -> Result<()>;

    fn first_index(&self) -> Result<u64>;

    fn last_index(&self) -> Result<u64>;

    fn close(&self) -> Result<()>;
}

pub fn encode_record_batch(batch: &RecordBatch) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    {
        let mut writer = StreamWriter::try_new(&mut buf, batch.schema().as_ref())?;
        writer.write(batch)?;
        writer.finish()?;
    }
    Ok(buf)
}

pub fn decode_record_batch(data: &[u8]) -> Result<RecordBatch> {
    let mut reader = StreamReader::try_new(std::io::Cursor::new(data), None)?;
    reader
        .next()
        .ok_or_else(|| StrataError::Serialization("empty batch encoding".to_string()))?
        .map_err(StrataError::from)
}

/// WAL that drops everything. Substituted when a table disables the WAL.
pub struct NopWal;

impl Wal for NopWal {
    fn log(&self, _tx: u64, _record: WalRecord) -> Result<()> {
        Ok(())
    }

    fn log_record(&self, _tx: u64, _table: &str, _batch: &RecordBatch) -> Result<()> {
        Ok(())
    }

    fn replay(&self, _from_tx: u64, _handler: ReplayHandler<'_>) -> Result<()> {
        Ok(())
    }

    fn truncate(&self, _tx: u64) -> Result<()> {
        Ok(())
    }

    fn first_index(&self) -> Result<u64> {
        Ok(0)
    }

    fn last_index(&self) -> Result<u64> {
        Ok(0)
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory WAL. Durability ends with the process; useful for embedding
/// and for exercising the engine without a disk.
pub struct MemWal {
    entries: Mutex<BTreeMap<u64, Vec<WalRecord>>>,
}

impl MemWal {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Snapshot of all entries in tx order.
    pub fn entries(&self) -> Vec<(u64, WalRecord)> {
        self.entries
            .lock()
            .iter()
            .flat_map(|(tx, records)| records.iter().map(|r| (*tx, r.clone())))
            .collect()
    }
}

impl Default for MemWal {
    fn default() -> Self {
        Self::new()
    }
}

impl Wal for MemWal {
    fn log(&self, tx: u64, record: WalRecord) -> Result<()> {
        self.entries.lock().entry(tx).or_default().push(record);
        Ok(())
    }

    fn replay(&self, from_tx: u64, handler: ReplayHandler<'_>) -> Result<()> {
        let entries = self.entries();
        let first = entries.first().map(|(tx, _)| *tx).unwrap_or(0);
        let from = if from_tx == 0 { first } else { from_tx.max(first) };
        for (tx, record) in entries {
            if tx < from {
                continue;
            }
            handler(tx, record)?;
        }
        Ok(())
    }

    fn truncate(&self, tx: u64) -> Result<()> {
        self.entries.lock().retain(|entry_tx, _| *entry_tx >= tx);
        Ok(())
    }

    fn first_index(&self) -> Result<u64> {
        Ok(self
            .entries
            .lock()
            .keys()
            .next()
            .copied()
            .unwrap_or(0))
    }

    fn last_index(&self) -> Result<u64> {
        Ok(self
            .entries
            .lock()
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema as ArrowSchema};
    use std::sync::Arc;

    fn write_record(tx: u64) -> WalRecord {
        WalRecord::Write {
            table_name: "t".to_string(),
            data: vec![tx as u8],
        }
    }

    #[test]
    fn test_batch_encoding_roundtrip() {
        let schema = Arc::new(ArrowSchema::new(vec![Field::new(
            "v",
            DataType::Int64,
            false,
        )]));
        let batch =
            RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![1, 2, 3]))]).unwrap();

        let encoded = encode_record_batch(&batch).unwrap();
        let decoded = decode_record_batch(&encoded).unwrap();
        assert_eq!(decoded.num_rows(), 3);
        assert_eq!(decoded.schema(), batch.schema());
    }

    #[test]
    fn test_mem_wal_replay() {
        let wal = MemWal::new();
        for tx in 1..=5 {
            wal.log(tx, write_record(tx)).unwrap();
        }
        assert_eq!(wal.first_index().unwrap(), 1);
        assert_eq!(wal.last_index().unwrap(), 5);

        let mut seen = Vec::new();
        wal.replay(3, &mut |tx, _| {
            seen.push(tx);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![3, 4, 5]);

        // from_tx of 0 starts at the first index
        seen.clear();
        wal.replay(0, &mut |tx, _| {
            seen.push(tx);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_mem_wal_truncate() {
        let wal = MemWal::new();
        for tx in 1..=5 {
            wal.log(tx, write_record(tx)).unwrap();
        }
        wal.truncate(4).unwrap();
        assert_eq!(wal.first_index().unwrap(), 4);
        assert_eq!(wal.last_index().unwrap(), 5);

        let mut seen = Vec::new();
        wal.replay(0, &mut |tx, _| {
            seen.push(tx);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![4, 5]);
    }
}
