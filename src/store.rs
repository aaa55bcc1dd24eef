//! Block persistence
//!
//! A rotated block is written as one immutable Arrow IPC file named by its
//! ULID. The store doubles as a scan source over the files it wrote: the
//! block timestamp embedded in the ULID is compared against the scan's
//! cutoff so rows still resident in memory are never read twice.
//!
//! Layout:
//! ```text
//! root/
//! └── <db>/<table>/
//!     ├── 01H455VB4PEX5C5V2KQW14PCFD.arrow
//!     └── ...
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use arrow::ipc::reader::StreamReader;
use parking_lot::Mutex;
use ulid::Ulid;

use crate::config::Schema;
use crate::source::{DynamicRowGroup, Emit, Filter, RowGroupSource, ScanItem};
use crate::sync::Cancellation;
use crate::table::block::TableBlock;
use crate::Result;

/// Writes a block's index contents as an immutable file.
pub trait BlockStore: Send + Sync {
    /// Persist the block under the table identified by `path`
    /// (`"<dbName>/<tableName>"`). Durable when this returns.
    fn persist(&self, path: &str, block: &TableBlock) -> Result<()>;
}

/// File-backed block store rooted at a directory.
pub struct DirBlockStore {
    root: PathBuf,
}

impl DirBlockStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn table_dir(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

impl BlockStore for DirBlockStore {
    fn persist(&self, path: &str, block: &TableBlock) -> Result<()> {
        let dir = self.table_dir(path);
        std::fs::create_dir_all(&dir)?;

        let file_path = dir.join(format!("{}.arrow", block.ulid()));
        let tmp_path = dir.join(format!("{}.arrow.tmp", block.ulid()));
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::with_capacity(64 * 1024, file);
            block.serialize(&mut writer)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp_path, &file_path)?;
        Ok(())
    }
}

impl RowGroupSource for DirBlockStore {
    fn scan(
        &self,
        ctx: &Cancellation,
        path: &str,
        _schema: Option<&Schema>,
        _filter: Option<&Filter>,
        cutoff_ts: u64,
        emit: Emit<'_>,
    ) -> Result<()> {
        let dir = self.table_dir(path);
        if !dir.exists() {
            return Ok(());
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|x| x == "arrow").unwrap_or(false))
            .collect();
        files.sort();

        for file_path in files {
            ctx.check()?;
            let Some(block_ulid) = parse_block_ulid(&file_path) else {
                continue;
            };
            // Blocks still resident in memory are served from there.
            if cutoff_ts > 0 && block_ulid.timestamp_ms() >= cutoff_ts {
                continue;
            }
            emit_block_file(ctx, &file_path, emit)?;
        }
        Ok(())
    }
}

fn parse_block_ulid(path: &Path) -> Option<Ulid> {
    Ulid::from_string(path.file_stem()?.to_str()?).ok()
}

fn emit_block_file(ctx: &Cancellation, path: &Path, emit: Emit<'_>) -> Result<()> {
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        // An empty block serializes to an empty file.
        return Ok(());
    }
    let reader = StreamReader::try_new(BufReader::new(file), None)?;
    for batch in reader {
        ctx.check()?;
        let batch = batch?;
        emit(ScanItem::RowGroup(DynamicRowGroup::from_record_batch(&batch)))?;
    }
    Ok(())
}

/// In-memory block store for embedding and tests.
pub struct MemBlockStore {
    blocks: Mutex<Vec<PersistedBlock>>,
}

struct PersistedBlock {
    path: String,
    ulid: Ulid,
    data: Vec<u8>,
}

impl MemBlockStore {
    pub fn new() -> Self {
        Self {
            blocks: Mutex::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total rows across all persisted blocks.
    pub fn total_rows(&self) -> u64 {
        let mut rows = 0u64;
        for block in self.blocks.lock().iter() {
            if block.data.is_empty() {
                continue;
            }
            if let Ok(reader) = StreamReader::try_new(std::io::Cursor::new(block.data.clone()), None)
            {
                rows += reader
                    .filter_map(|b| b.ok())
                    .map(|b| b.num_rows() as u64)
                    .sum::<u64>();
            }
        }
        rows
    }
}

impl Default for MemBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStore for MemBlockStore {
    fn persist(&self, path: &str, block: &TableBlock) -> Result<()> {
        let mut data = Vec::new();
        block.serialize(&mut data)?;
        self.blocks.lock().push(PersistedBlock {
            path: path.to_string(),
            ulid: block.ulid(),
            data,
        });
        Ok(())
    }
}

impl RowGroupSource for MemBlockStore {
    fn scan(
        &self,
        ctx: &Cancellation,
        path: &str,
        _schema: Option<&Schema>,
        _filter: Option<&Filter>,
        cutoff_ts: u64,
        emit: Emit<'_>,
    ) -> Result<()> {
        let snapshots: Vec<(Ulid, Vec<u8>)> = self
            .blocks
            .lock()
            .iter()
            .filter(|b| b.path == path)
            .map(|b| (b.ulid, b.data.clone()))
            .collect();

        for (block_ulid, data) in snapshots {
            ctx.check()?;
            if cutoff_ts > 0 && block_ulid.timestamp_ms() >= cutoff_ts {
                continue;
            }
            if data.is_empty() {
                continue;
            }
            let reader = StreamReader::try_new(std::io::Cursor::new(data), None)?;
            for batch in reader {
                let batch = batch?;
                emit(ScanItem::RowGroup(DynamicRowGroup::from_record_batch(&batch)))?;
            }
        }
        Ok(())
    }
}
