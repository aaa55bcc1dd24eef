//! Segmented on-disk WAL
//!
//! File format:
//! ```text
//! +----------------+----------------+----------------+
//! | Header (32B)   | Record 1       | Record 2 ...   |
//! +----------------+----------------+----------------+
//!
//! Header:
//! - magic: 4 bytes "SWAL"
//! - version: 2 bytes
//! - segment_id: 8 bytes
//! - checksum: 4 bytes
//! - reserved: 14 bytes
//!
//! Record:
//! - tx: 8 bytes
//! - payload_len: 4 bytes
//! - payload: variable (bincode serialized WalRecord)
//! - crc32: 4 bytes
//! ```
//!
//! Segments rotate at a size threshold. Records with a corrupt checksum are
//! skipped on read; a panicking replay handler truncates the tail of the
//! log back to the last successfully applied entry.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::{ReplayHandler, Wal, WalRecord};
use crate::{Result, StrataError};

const WAL_MAGIC: &[u8; 4] = b"SWAL";
const WAL_VERSION: u16 = 1;
const WAL_HEADER_SIZE: usize = 32;
/// Maximum WAL segment size (16 MB)
const MAX_WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
struct SegmentHeader {
    segment_id: u64,
}

impl SegmentHeader {
    fn to_bytes(&self) -> [u8; WAL_HEADER_SIZE] {
        let mut buf = [0u8; WAL_HEADER_SIZE];
        buf[0..4].copy_from_slice(WAL_MAGIC);
        buf[4..6].copy_from_slice(&WAL_VERSION.to_le_bytes());
        buf[6..14].copy_from_slice(&self.segment_id.to_le_bytes());
        let checksum = crc32fast::hash(&buf[0..14]);
        buf[14..18].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        if bytes.len() < WAL_HEADER_SIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "header too short"));
        }
        if &bytes[0..4] != WAL_MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "invalid WAL magic"));
        }
        let segment_id = u64::from_le_bytes(bytes[6..14].try_into().unwrap());
        let checksum = u32::from_le_bytes(bytes[14..18].try_into().unwrap());
        if crc32fast::hash(&bytes[0..14]) != checksum {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "header checksum mismatch",
            ));
        }
        Ok(Self { segment_id })
    }
}

struct OpenSegment {
    file: BufWriter<File>,
    size: u64,
}

impl OpenSegment {
    fn create(dir: &Path, segment_id: u64) -> io::Result<Self> {
        let path = segment_path(dir, segment_id);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
        writer.write_all(&SegmentHeader { segment_id }.to_bytes())?;
        writer.flush()?;
        Ok(Self {
            file: writer,
            size: WAL_HEADER_SIZE as u64,
        })
    }

    fn append(&mut self, tx: u64, payload: &[u8]) -> io::Result<()> {
        let crc = crc32fast::hash(payload);
        self.file.write_all(&tx.to_le_bytes())?;
        self.file.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.file.write_all(payload)?;
        self.file.write_all(&crc.to_le_bytes())?;
        self.size += 8 + 4 + payload.len() as u64 + 4;
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_data()
    }

    fn is_full(&self) -> bool {
        self.size >= MAX_WAL_SEGMENT_SIZE
    }
}

fn segment_path(dir: &Path, segment_id: u64) -> PathBuf {
    dir.join(format!("{:06}.wal", segment_id))
}

struct FileWalInner {
    dir: PathBuf,
    segment: Option<OpenSegment>,
    next_segment_id: u64,
    /// `None` while the log is empty. Tx 0 is a legitimate index (block
    /// bootstrap entries live there), so emptiness needs its own state.
    first_index: Option<u64>,
    last_index: Option<u64>,
}

/// Durable segmented WAL in a directory.
pub struct FileWal {
    inner: Mutex<FileWalInner>,
}

impl FileWal {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut next_segment_id = 1u64;
        let mut first_index: Option<u64> = None;
        let mut last_index: Option<u64> = None;
        for path in list_segments(&dir)? {
            if let Some(id) = parse_segment_id(&path) {
                next_segment_id = next_segment_id.max(id + 1);
            }
            for (tx, _) in read_segment(&path)? {
                first_index = Some(match first_index {
                    Some(first) => first.min(tx),
                    None => tx,
                });
                last_index = Some(match last_index {
                    Some(last) => last.max(tx),
                    None => tx,
                });
            }
        }

        Ok(Self {
            inner: Mutex::new(FileWalInner {
                dir,
                segment: None,
                next_segment_id,
                first_index,
                last_index,
            }),
        })
    }

    /// All entries across all segments, sorted by tx.
    fn read_all(inner: &FileWalInner) -> Result<Vec<(u64, WalRecord)>> {
        let mut entries = Vec::new();
        for path in list_segments(&inner.dir)? {
            entries.extend(read_segment(&path)?);
        }
        entries.sort_by_key(|(tx, _)| *tx);
        Ok(entries)
    }

    /// Drop every entry above `last_good` by rewriting the affected segment
    /// and deleting the ones after it. `None` empties the log.
    fn truncate_tail(inner: &mut FileWalInner, last_good: Option<u64>) -> Result<()> {
        inner.segment = None;
        for path in list_segments(&inner.dir)? {
            let entries = read_segment(&path)?;
            let kept: Vec<_> = entries
                .into_iter()
                .filter(|(tx, _)| last_good.map_or(false, |good| *tx <= good))
                .collect();
            if kept.is_empty() {
                std::fs::remove_file(&path)?;
                continue;
            }
            let id = parse_segment_id(&path).unwrap_or(0);
            rewrite_segment(&path, id, &kept)?;
        }
        inner.last_index = last_good;
        inner.first_index = match (inner.first_index, last_good) {
            (Some(first), Some(last)) if first <= last => Some(first),
            _ => None,
        };
        Ok(())
    }
}

impl Wal for FileWal {
    fn log(&self, tx: u64, record: WalRecord) -> Result<()> {
        let payload = bincode::serialize(&record)
            .map_err(|e| StrataError::Serialization(e.to_string()))?;

        let mut inner = self.inner.lock();
        let full = inner.segment.as_ref().map(|s| s.is_full()).unwrap_or(true);
        if full {
            if let Some(segment) = inner.segment.as_mut() {
                segment.sync()?;
            }
            let id = inner.next_segment_id;
            inner.segment = Some(OpenSegment::create(&inner.dir, id)?);
            inner.next_segment_id += 1;
        }

        let segment = inner.segment.as_mut().unwrap();
        segment.append(tx, &payload)?;
        segment.sync()?;

        inner.first_index = Some(match inner.first_index {
            Some(first) => first.min(tx),
            None => tx,
        });
        inner.last_index = Some(match inner.last_index {
            Some(last) => last.max(tx),
            None => tx,
        });
        Ok(())
    }

    fn replay(&self, from_tx: u64, handler: ReplayHandler<'_>) -> Result<()> {
        let mut inner = self.inner.lock();
        let entries = Self::read_all(&inner)?;
        // Segment-granular truncation can leave entries below the logical
        // first index on disk; never hand those to the handler.
        let first = entries
            .first()
            .map(|(tx, _)| *tx)
            .unwrap_or(0)
            .max(inner.first_index.unwrap_or(0));
        let from = if from_tx == 0 { first } else { from_tx.max(first) };

        let mut last_applied: Option<u64> = None;
        for (tx, record) in entries {
            if tx < from {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| handler(tx, record))) {
                Ok(result) => result?,
                Err(_) => {
                    log::error!("wal replay handler panicked at tx {}, truncating tail", tx);
                    return Self::truncate_tail(&mut inner, last_applied);
                }
            }
            last_applied = Some(tx);
        }
        Ok(())
    }

    fn truncate(&self, tx: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        // Close the open segment so it is safe to delete; the next log
        // starts a fresh one.
        if let Some(segment) = inner.segment.as_mut() {
            segment.sync()?;
        }
        inner.segment = None;

        // Segment granular: a segment is removed only once every entry in
        // it is below the truncation point.
        let mut remaining_first: Option<u64> = None;
        for path in list_segments(&inner.dir)? {
            let entries = read_segment(&path)?;
            let all_below = entries.iter().all(|(t, _)| *t < tx);
            if all_below {
                std::fs::remove_file(&path)?;
                continue;
            }
            for (entry_tx, _) in entries {
                if entry_tx >= tx {
                    remaining_first = Some(match remaining_first {
                        Some(first) => first.min(entry_tx),
                        None => entry_tx,
                    });
                }
            }
        }
        inner.first_index = remaining_first;
        Ok(())
    }

    fn first_index(&self) -> Result<u64> {
        Ok(self.inner.lock().first_index.unwrap_or(0))
    }

    fn last_index(&self) -> Result<u64> {
        Ok(self.inner.lock().last_index.unwrap_or(0))
    }

    fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(segment) = inner.segment.as_mut() {
            segment.sync()?;
        }
        inner.segment = None;
        Ok(())
    }
}

fn list_segments(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|x| x == "wal").unwrap_or(false))
        .collect();
    paths.sort();
    Ok(paths)
}

fn parse_segment_id(path: &Path) -> Option<u64> {
    path.file_stem()?.to_str()?.parse().ok()
}

fn read_segment(path: &Path) -> Result<Vec<(u64, WalRecord)>> {
    let mut file = File::open(path)?;
    let mut records = Vec::new();

    let mut header_buf = [0u8; WAL_HEADER_SIZE];
    if file.read_exact(&mut header_buf).is_err() {
        return Ok(records); // empty or truncated segment
    }
    SegmentHeader::from_bytes(&header_buf)?;

    loop {
        let mut tx_buf = [0u8; 8];
        if file.read_exact(&mut tx_buf).is_err() {
            break;
        }
        let tx = u64::from_le_bytes(tx_buf);

        let mut len_buf = [0u8; 4];
        if file.read_exact(&mut len_buf).is_err() {
            break;
        }
        let len = u32::from_le_bytes(len_buf) as usize;

        let mut payload = vec![0u8; len];
        if file.read_exact(&mut payload).is_err() {
            break;
        }

        let mut crc_buf = [0u8; 4];
        if file.read_exact(&mut crc_buf).is_err() {
            break;
        }
        if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
            // Corrupt record, skip it and keep reading.
            continue;
        }

        if let Ok(record) = bincode::deserialize::<WalRecord>(&payload) {
            records.push((tx, record));
        }
    }

    Ok(records)
}

fn rewrite_segment(path: &Path, segment_id: u64, entries: &[(u64, WalRecord)]) -> Result<()> {
    let tmp = path.with_extension("wal.tmp");
    {
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
        writer.write_all(&SegmentHeader { segment_id }.to_bytes())?;
        for (tx, record) in entries {
            let payload = bincode::serialize(record)
                .map_err(|e| StrataError::Serialization(e.to_string()))?;
            let crc = crc32fast::hash(&payload);
            writer.write_all(&tx.to_le_bytes())?;
            writer.write_all(&(payload.len() as u32).to_le_bytes())?;
            writer.write_all(&payload)?;
            writer.write_all(&crc.to_le_bytes())?;
        }
        writer.flush()?;
        writer.get_ref().sync_data()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}
