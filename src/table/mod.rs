//! Table
//!
//! Owns the block lifecycle: one active (writable) block, a set of pending
//! blocks rotated out but not yet persisted, and the completed-block
//! watermark. Writers are admitted against the active block under the table
//! read lock; rotation swaps the active block under the write lock and
//! hands the old one to a background persistence task.
//!
//! Write path: assign tx, append to the WAL, insert into the active block's
//! index, commit. Scan path: snapshot the resident blocks, fan row groups
//! from every source out to N callback workers over a bounded channel.

pub mod block;


use std::sync::{Arc, Weak};
use std::thread;

use ahash::AHashMap;
use arrow::array::StringArray;
use arrow::datatypes::{DataType, Field, Schema as ArrowSchema};
use arrow::record_batch::RecordBatch;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use ulid::Ulid;

use crate::config::{Schema, TableConfig};
use crate::convert::Converter;
use crate::metrics::{Metric, TableMetrics};
use crate::source::{Filter, RowGroupSource, ScanItem};
use crate::store::BlockStore;
use crate::sync::{Cancellation, WaitGuard};
use crate::txn::TxClock;
use crate::wal::{decode_record_batch, NopWal, Wal, WalRecord};
use crate::{Result, StrataError};

use block::TableBlock;

/// Per-batch scan callback. The engine hands batch ownership to the
/// callback; chaining without copies is the callback's business.
pub type Callback = Box<dyn FnMut(RecordBatch) -> Result<()> + Send>;

/// Hook invoked with the rotation tx after a block rotation completes.
/// Snapshot policies plug in here; the engine never triggers one itself.
pub type RotationHook = Box<dyn Fn(u64) + Send + Sync>;

/// Rows buffered in a worker's converter before flushing to the callback.
const CONVERT_BUFFER_SIZE: usize = 1024;

/// Scan options.
#[derive(Default)]
pub struct ScanOptions {
    /// Pushdown predicate forwarded to scan sources.
    pub filter: Option<Filter>,
}

/// External collaborators handed to a table at construction. No process
/// globals: the clock, WAL and store are always explicit.
pub struct TableDeps {
    pub wal: Arc<dyn Wal>,
    pub clock: Arc<TxClock>,
    pub store: Arc<dyn BlockStore>,
    /// Sources over persisted data, scanned in addition to the in-memory
    /// blocks.
    pub sources: Vec<Arc<dyn RowGroupSource>>,
    pub rotation_hook: Option<RotationHook>,
}

#[derive(Debug, Clone, Copy)]
struct CompletedBlock {
    prev_tx: u64,
    tx: u64,
}

struct TableState {
    active: Option<Arc<TableBlock>>,
    pending: AHashMap<Ulid, Arc<TableBlock>>,
    completed: Vec<CompletedBlock>,
    last_completed: u64,
    closing: bool,
}

pub struct Table {
    self_ref: Weak<Table>,

    db_name: String,
    name: String,
    config: TableConfig,
    schema: Option<Schema>,

    wal: Arc<dyn Wal>,
    clock: Arc<TxClock>,
    store: Arc<dyn BlockStore>,
    sources: Vec<Arc<dyn RowGroupSource>>,
    rotation_hook: Option<RotationHook>,

    metrics: Arc<TableMetrics>,
    ulids: Mutex<ulid::Generator>,

    state: RwLock<TableState>,
}

impl Table {
    /// Create a table. A table configured without a schema is read-only:
    /// it serves scans over the external sources but rejects writes.
    ///
    /// A fresh WAL gets the table's first block created (and logged) here.
    /// A WAL that already carries history belongs to a table being
    /// recovered: construction leaves the block set empty and `recover`
    /// rebuilds it from the log.
    pub fn new(
        db_name: &str,
        name: &str,
        config: TableConfig,
        deps: TableDeps,
    ) -> Result<Arc<Self>> {
        let TableDeps {
            wal,
            clock,
            store,
            sources,
            rotation_hook,
        } = deps;
        let wal: Arc<dyn Wal> = if config.disable_wal { Arc::new(NopWal) } else { wal };

        let schema = config.schema.as_ref().map(Schema::from_spec).transpose()?;
        let metrics = Arc::new(TableMetrics::new());

        let table = Arc::new_cyclic(|weak| Table {
            self_ref: weak.clone(),
            db_name: db_name.to_string(),
            name: name.to_string(),
            config,
            schema,
            wal,
            clock,
            store,
            sources,
            rotation_hook,
            metrics,
            ulids: Mutex::new(ulid::Generator::new()),
            state: RwLock::new(TableState {
                active: None,
                pending: AHashMap::new(),
                completed: Vec::new(),
                last_completed: 0,
                closing: false,
            }),
        });

        if table.schema.is_some()
            && table.wal.first_index()? == 0
            && table.wal.last_index()? == 0
        {
            table.new_table_block()?;
        }
        Ok(table)
    }

    /// Create the table's first block and make its creation durable. The
    /// block exists from tx 0 so it precedes every write in the log.
    fn new_table_block(&self) -> Result<()> {
        let id = self.next_ulid();
        self.wal
            .log(
                0,
                WalRecord::BlockCreated {
                    table_name: self.name.clone(),
                    block_id: id.to_bytes(),
                    config: self.config.clone(),
                },
            )
            .map_err(|e| StrataError::Wal(e.to_string()))?;
        let block = Arc::new(TableBlock::new(
            &self.name,
            Arc::clone(&self.metrics),
            0,
            0,
            id,
        ));
        self.state.write().active = Some(block);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Source path of this table, `"<dbName>/<tableName>"`.
    pub fn path(&self) -> String {
        format!("{}/{}", self.db_name, self.name)
    }

    pub fn schema(&self) -> Option<&Schema> {
        self.schema.as_ref()
    }

    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<TableMetrics> {
        &self.metrics
    }

    pub fn active_block(&self) -> Option<Arc<TableBlock>> {
        self.state.read().active.clone()
    }

    /// Highest tx such that every block with a lower min tx has persisted.
    pub fn last_completed_tx(&self) -> u64 {
        self.state.read().last_completed
    }

    pub fn pending_blocks_len(&self) -> usize {
        self.state.read().pending.len()
    }

    /// Render this table's metrics under their stable names.
    pub fn export_metrics(&self) -> Vec<Metric> {
        let (index_size, active_size) = match self.active_block() {
            Some(block) => (block.index().num_parts(), block.size()),
            None => (0, 0),
        };
        self.metrics.export(&self.name, index_size, active_size)
    }

    /// Force a compaction of the active block.
    pub fn ensure_compaction(&self) -> Result<()> {
        self.active_block()
            .ok_or(StrataError::NoSchema)?
            .ensure_compaction()
    }

    /// Stop accepting writes once in-flight writers have drained.
    pub fn close(&self) {
        let mut state = self.state.write();
        if let Some(active) = &state.active {
            active.pending_writers().wait();
        }
        state.closing = true;
    }

    /// Insert a batch. Returns the tx the write was assigned.
    ///
    /// The WAL append happens before the index insert; a WAL failure
    /// rejects the write with no side effect on the index. After the WAL
    /// append the write always commits its tx, even on failure, so the tx
    /// sequence stays contiguous.
    pub fn insert_record(&self, ctx: &Cancellation, batch: RecordBatch) -> Result<u64> {
        ctx.check()?;
        let (active, _write_guard) = self.appender()?;
        let (tx, _commit) = self.clock.begin();

        // Zero-row batches are counted but not logged as data records.
        if batch.num_rows() > 0 {
            self.wal
                .log_record(tx, &self.name, &batch)
                .map_err(|e| StrataError::Wal(e.to_string()))?;
        }

        active
            .insert_record(tx, batch)
            .map_err(|e| StrataError::Write(e.to_string()))?;
        Ok(tx)
    }

    /// Acquire the active block for writing, rotating it first when it has
    /// reached the configured size threshold. Rotation is writer driven:
    /// there is no background timer.
    fn appender(&self) -> Result<(Arc<TableBlock>, WaitGuard)> {
        loop {
            let (active, guard) = self.active_write_block()?;
            if active.size() < self.config.active_memory_size {
                return Ok((active, guard));
            }
            // Rotation needs the write lock, so give up the writer slot
            // and retry against the new block.
            drop(guard);
            self.rotate_block(&active)?;
        }
    }

    fn active_write_block(&self) -> Result<(Arc<TableBlock>, WaitGuard)> {
        let state = self.state.read();
        if state.closing {
            return Err(StrataError::Closing);
        }
        let active = state.active.clone().ok_or(StrataError::NoSchema)?;
        let guard = active.pending_writers().enter();
        Ok((active, guard))
    }

    /// Swap in a fresh active block if `block` is still active, then persist
    /// `block` in the background. Idempotent: a stale `block` is a no-op, so
    /// concurrent writers may race to rotate without coordination.
    pub fn rotate_block(&self, block: &Arc<TableBlock>) -> Result<()> {
        let mut state = self.state.write();
        let active = match state.active.clone() {
            Some(active) => active,
            None => return Ok(()),
        };
        if !Arc::ptr_eq(&active, block) {
            return Ok(());
        }

        log::debug!(
            "table {}: rotating block {}, size {}",
            self.name,
            active.ulid(),
            active.size()
        );

        let (tx, _commit) = self.clock.begin();
        let id = self.next_ulid();

        // The new block's creation must be durable before it accepts its
        // first write.
        self.wal
            .log(
                tx,
                WalRecord::BlockCreated {
                    table_name: self.name.clone(),
                    block_id: id.to_bytes(),
                    config: self.config.clone(),
                },
            )
            .map_err(|e| StrataError::Wal(e.to_string()))?;

        let new_block = Arc::new(TableBlock::new(
            &self.name,
            Arc::clone(&self.metrics),
            active.min_tx(),
            tx,
            id,
        ));
        state.pending.insert(active.ulid(), Arc::clone(&active));
        state.active = Some(new_block);
        self.metrics.inc_blocks_rotated();
        self.metrics.set_num_parts(0);
        drop(state);

        if let Some(table) = self.self_ref.upgrade() {
            let old = Arc::clone(&active);
            thread::spawn(move || table.write_block(old));
        }
        if let Some(hook) = &self.rotation_hook {
            hook(tx);
        }

        log::debug!("table {}: done rotating block", self.name);
        Ok(())
    }

    /// Persistence task for a rotated block.
    fn write_block(&self, block: Arc<TableBlock>) {
        log::debug!("table {}: syncing block {}", self.name, block.ulid());
        block.pending_writers().wait();
        // From here on the block is no longer modified.
        log::debug!("table {}: done syncing block {}", self.name, block.ulid());

        if let Err(e) = self.store.persist(&self.path(), &block) {
            log::error!(
                "table {}: failed to persist block {}: {}",
                self.name,
                block.ulid(),
                e
            );
            self.drop_pending_block(&block);
            return;
        }

        // The persisted entry must be durable before the block can leave
        // the pending set.
        let (tx, _commit) = self.clock.begin();
        if let Err(e) = self.wal.log(
            tx,
            WalRecord::BlockPersisted {
                table_name: self.name.clone(),
                block_id: block.ulid().to_bytes(),
            },
        ) {
            log::error!(
                "table {}: failed to record block persistence in WAL: {}",
                self.name,
                e
            );
            self.drop_pending_block(&block);
            return;
        }

        self.drop_pending_block(&block);

        let mut state = self.state.write();
        state.completed.push(CompletedBlock {
            prev_tx: block.prev_tx(),
            tx: block.min_tx(),
        });
        state.completed.sort_by_key(|c| c.prev_tx);
        // Advance the watermark through the contiguous prefix; blocks that
        // persisted out of order wait for their predecessor.
        while let Some(head) = state.completed.first().copied() {
            if head.prev_tx != state.last_completed {
                break;
            }
            state.last_completed = head.tx;
            self.metrics.set_last_completed_block_tx(head.tx);
            state.completed.remove(0);
        }
    }

    fn drop_pending_block(&self, block: &Arc<TableBlock>) {
        let mut state = self.state.write();
        state.pending.remove(&block.ulid());
        // Holding the lock keeps new readers out while outstanding ones
        // finish with the block's memory.
        block.pending_readers().wait();
    }

    fn next_ulid(&self) -> Ulid {
        self.ulids.lock().generate().unwrap_or_else(|_| Ulid::new())
    }

    /// Run a scan at the given read snapshot, dispatching row groups to the
    /// callbacks concurrently. Fails fast on the first callback or source
    /// error. No ordering across row groups is guaranteed; operators that
    /// need sorted input re-sort downstream.
    pub fn iterator(
        &self,
        ctx: &Cancellation,
        tx: u64,
        mut callbacks: Vec<Callback>,
        options: ScanOptions,
    ) -> Result<()> {
        self.run_scan(ctx, tx, &mut callbacks, &options, scan_worker)
    }

    /// Scan variant that emits one single-column `name` batch per observed
    /// row group, carrying the field names seen across the table.
    pub fn schema_iterator(
        &self,
        ctx: &Cancellation,
        tx: u64,
        mut callbacks: Vec<Callback>,
        options: ScanOptions,
    ) -> Result<()> {
        self.run_scan(ctx, tx, &mut callbacks, &options, schema_worker)
    }

    fn run_scan(
        &self,
        ctx: &Cancellation,
        tx: u64,
        callbacks: &mut [Callback],
        options: &ScanOptions,
        worker: fn(&Receiver<ScanItem>, &Cancellation, &mut Callback) -> Result<()>,
    ) -> Result<()> {
        if callbacks.is_empty() {
            return Err(StrataError::Internal("no callbacks provided".to_string()));
        }

        // A worker failure cancels the pipeline without touching the
        // caller's token.
        let pipeline = ctx.child();
        // Buffer up to 4 row groups per callback.
        let (sender, receiver) = crossbeam_channel::bounded::<ScanItem>(callbacks.len() * 4);

        let mut results: Vec<Result<()>> = Vec::new();
        thread::scope(|s| {
            let mut handles = Vec::new();
            for callback in callbacks.iter_mut() {
                let rx = receiver.clone();
                let pl = pipeline.clone();
                handles.push(s.spawn(move || {
                    let result = worker(&rx, &pl, callback);
                    if result.is_err() {
                        pl.cancel();
                    }
                    result
                }));
            }
            drop(receiver);

            let pl = pipeline.clone();
            let filter = options.filter.as_ref();
            let producer = s.spawn(move || {
                let result = self.collect_row_groups(&pl, tx, filter, &sender);
                drop(sender);
                if result.is_err() {
                    pl.cancel();
                }
                result
            });

            for handle in handles {
                results.push(handle.join().unwrap_or_else(|_| {
                    Err(StrataError::Internal("scan worker panicked".to_string()))
                }));
            }
            results.push(producer.join().unwrap_or_else(|_| {
                Err(StrataError::Internal("scan producer panicked".to_string()))
            }));
        });

        let mut canceled = false;
        for result in results {
            match result {
                Ok(()) => {}
                Err(StrataError::Canceled) => canceled = true,
                Err(e) => return Err(e),
            }
        }
        if canceled {
            return Err(StrataError::Canceled);
        }
        Ok(())
    }

    /// Push every row group visible to this scan into the channel: external
    /// sources first, then the snapshotted in-memory blocks. Reader slots
    /// taken on the snapshot are released on every exit path.
    fn collect_row_groups(
        &self,
        ctx: &Cancellation,
        _tx: u64,
        filter: Option<&Filter>,
        channel: &Sender<ScanItem>,
    ) -> Result<()> {
        let (blocks, cutoff) = self.memory_blocks();
        let path = self.path();

        let mut emit = |item: ScanItem| -> Result<()> {
            ctx.check()?;
            // A send fails only when every worker is gone.
            channel.send(item).map_err(|_| StrataError::Canceled)
        };

        for source in &self.sources {
            source.scan(ctx, &path, self.schema.as_ref(), filter, cutoff, &mut emit)?;
        }
        for (block, _reader_guard) in &blocks {
            block.index().scan(ctx, &mut emit)?;
        }
        Ok(())
    }

    /// Snapshot the active and pending blocks, taking a reader slot on each.
    /// Also returns the minimum block creation timestamp, which external
    /// sources use to skip files still covered by memory. Pending blocks may
    /// finish uploading while the scan runs; the cutoff keeps them from
    /// being read twice.
    fn memory_blocks(&self) -> (Vec<(Arc<TableBlock>, WaitGuard)>, u64) {
        let state = self.state.read();
        let active = match state.active.clone() {
            Some(active) => active,
            // Read-only table.
            None => return (Vec::new(), 0),
        };

        let mut cutoff = active.ulid().timestamp_ms();
        let guard = active.pending_readers().enter();
        let mut blocks = vec![(active, guard)];
        for block in state.pending.values() {
            let ts = block.ulid().timestamp_ms();
            if ts < cutoff {
                cutoff = ts;
            }
            let guard = block.pending_readers().enter();
            blocks.push((Arc::clone(block), guard));
        }
        (blocks, cutoff)
    }

    /// Apply one replayed WAL entry. Data records are inserted at their
    /// original tx. The log's first block creation entry establishes the
    /// active block; each later one is a replayed rotation that swaps in a
    /// new block and re-persists the old one (idempotent in the store).
    /// Persisted markers need no action here for the same reason.
    pub fn replay_record(&self, tx: u64, record: WalRecord) -> Result<()> {
        self.clock.catch_up(tx);
        match record {
            WalRecord::Write { .. } => Ok(()),
            WalRecord::RecordBatch { table_name, data } => {
                if table_name != self.name {
                    return Ok(());
                }
                let batch = decode_record_batch(&data)?;
                let active = self.active_block().ok_or(StrataError::NoSchema)?;
                active
                    .insert_record(tx, batch)
                    .map_err(|e| StrataError::Write(e.to_string()))
            }
            WalRecord::BlockCreated {
                table_name,
                block_id,
                ..
            } => {
                if table_name != self.name {
                    return Ok(());
                }
                if self.schema.is_none() {
                    return Err(StrataError::NoSchema);
                }
                let id = Ulid::from_bytes(block_id);
                let mut state = self.state.write();
                let active = match state.active.clone() {
                    Some(active) => active,
                    None => {
                        state.active = Some(Arc::new(TableBlock::new(
                            &self.name,
                            Arc::clone(&self.metrics),
                            0,
                            tx,
                            id,
                        )));
                        return Ok(());
                    }
                };
                if active.ulid() == id {
                    // Already applied.
                    return Ok(());
                }
                let new_block = Arc::new(TableBlock::new(
                    &self.name,
                    Arc::clone(&self.metrics),
                    active.min_tx(),
                    tx,
                    id,
                ));
                state.active = Some(new_block);
                if active.size() > 0 {
                    state.pending.insert(active.ulid(), Arc::clone(&active));
                    drop(state);
                    if let Some(table) = self.self_ref.upgrade() {
                        thread::spawn(move || table.write_block(active));
                    }
                }
                Ok(())
            }
            WalRecord::BlockPersisted { .. } => Ok(()),
        }
    }

    /// Replay the whole WAL into this table, then make sure an active
    /// block exists: a log with no block history for this table still
    /// needs one before writes are admitted.
    pub fn recover(&self) -> Result<()> {
        let wal = Arc::clone(&self.wal);
        wal.replay(0, &mut |tx, record| self.replay_record(tx, record))?;
        if self.schema.is_some() && self.active_block().is_none() {
            self.new_table_block()?;
        }
        Ok(())
    }
}

/// Scan worker: batches go straight to the callback, row groups pass
/// through the converter and flush at the buffer threshold. The residual is
/// flushed when the channel closes.
fn scan_worker(
    rx: &Receiver<ScanItem>,
    ctx: &Cancellation,
    callback: &mut Callback,
) -> Result<()> {
    let mut converter = Converter::new();
    loop {
        ctx.check()?;
        match rx.recv() {
            Err(_) => {
                // Channel closed: every source has drained.
                ctx.check()?;
                if let Some(batch) = converter.flush()? {
                    if batch.num_rows() > 0 {
                        callback(batch)?;
                    }
                }
                return Ok(());
            }
            Ok(ScanItem::Batch(batch)) => callback(batch)?,
            Ok(ScanItem::RowGroup(row_group)) => {
                converter.convert(row_group)?;
                if converter.num_fields() == 0 {
                    // Nothing relevant in this row group.
                    continue;
                }
                if converter.num_rows() >= CONVERT_BUFFER_SIZE {
                    if let Some(batch) = converter.flush()? {
                        callback(batch)?;
                    }
                }
            }
        }
    }
}

/// Schema scan worker: each item becomes one batch of observed field names.
fn schema_worker(
    rx: &Receiver<ScanItem>,
    ctx: &Cancellation,
    callback: &mut Callback,
) -> Result<()> {
    let schema = Arc::new(ArrowSchema::new(vec![Field::new(
        "name",
        DataType::Utf8,
        false,
    )]));
    loop {
        ctx.check()?;
        match rx.recv() {
            Err(_) => {
                ctx.check()?;
                return Ok(());
            }
            Ok(item) => {
                let names: Vec<String> = match &item {
                    ScanItem::Batch(batch) => batch
                        .schema()
                        .fields()
                        .iter()
                        .map(|f| f.name().clone())
                        .collect(),
                    ScanItem::RowGroup(row_group) => row_group
                        .schema()
                        .fields()
                        .iter()
                        .map(|f| f.name().clone())
                        .collect(),
                };
                let array = StringArray::from(names);
                let batch = RecordBatch::try_new(Arc::clone(&schema), vec![Arc::new(array)])?;
                callback(batch)?;
            }
        }
    }
}
