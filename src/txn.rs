//! Transaction clock
//!
//! Hands out monotonically increasing 64-bit transaction ids for writes and
//! exposes a read snapshot: the highest tx such that it and every tx below
//! it has committed. Commits may arrive out of order; the watermark only
//! advances through the contiguous prefix.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Monotonic transaction id source shared by all writers of a database.
///
/// Not a process-level singleton: each table receives its clock explicitly.
pub struct TxClock {
    next: AtomicU64,
    /// Highest contiguously committed tx, readable without the lock.
    watermark: AtomicU64,
    /// Committed txs above the watermark, waiting for the gap to close.
    out_of_order: Mutex<BTreeSet<u64>>,
}

impl TxClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next: AtomicU64::new(1),
            watermark: AtomicU64::new(0),
            out_of_order: Mutex::new(BTreeSet::new()),
        })
    }

    /// Start a write transaction. The returned guard commits the tx when
    /// dropped (or explicitly via `commit`), keeping the sequence contiguous
    /// even when the write itself fails.
    pub fn begin(self: &Arc<Self>) -> (u64, TxCommit) {
        let tx = self.next.fetch_add(1, Ordering::SeqCst);
        (
            tx,
            TxCommit {
                clock: Arc::clone(self),
                tx,
            },
        )
    }

    /// Snapshot for reads: every tx at or below this value has committed.
    pub fn begin_read(&self) -> u64 {
        self.watermark.load(Ordering::Acquire)
    }

    /// Fold a replayed tx into the clock so fresh writes continue above it.
    pub fn catch_up(&self, tx: u64) {
        self.next.fetch_max(tx + 1, Ordering::SeqCst);
        self.watermark.fetch_max(tx, Ordering::SeqCst);
    }

    fn commit(&self, tx: u64) {
        let mut pending = self.out_of_order.lock();
        let mut watermark = self.watermark.load(Ordering::Acquire);
        if tx == watermark + 1 {
            watermark = tx;
            // Drain any successors that committed early.
            while pending.remove(&(watermark + 1)) {
                watermark += 1;
            }
            self.watermark.store(watermark, Ordering::Release);
        } else if tx > watermark {
            pending.insert(tx);
        }
    }
}

/// Commit handle for a write tx - commits on drop
pub struct TxCommit {
    clock: Arc<TxClock>,
    tx: u64,
}

impl TxCommit {
    /// Commit eagerly instead of waiting for drop.
    pub fn commit(self) {}
}

impl Drop for TxCommit {
    fn drop(&mut self) {
        self.clock.commit(self.tx);
    }
}
