//! Multi-producer barrier over a shared sink
//!
//! Each producer calls `callback` any number of times and then `finish`
//! exactly once. The barrier guarantees to the sink:
//! - callback and finish calls are strictly serialized
//! - finish is invoked exactly once, after every producer finished
//!
//! Producers register before their first interaction with the barrier.

use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;

use super::Sink;
use crate::{Result, StrataError};

struct SynchronizerInner {
    next: Option<Box<dyn Sink>>,
    /// Goes negative if finish is called without a registration; the sink
    /// only fires on an exact return to zero.
    producers: i64,
    finished: bool,
}

/// Barrier forwarding per-batch callbacks to a downstream sink and firing
/// its terminal callback exactly once.
pub struct Synchronizer {
    inner: Mutex<SynchronizerInner>,
}

impl Synchronizer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SynchronizerInner {
                next: None,
                producers: 0,
                finished: false,
            }),
        }
    }

    /// Bind the downstream sink.
    pub fn set_next(&self, sink: Box<dyn Sink>) {
        self.inner.lock().next = Some(sink);
    }

    /// Register one producer. Must happen before that producer's first
    /// `callback`.
    pub fn register(&self) {
        self.inner.lock().producers += 1;
    }

    /// Forward a batch to the sink. Sink calls are serialized under the
    /// barrier's lock, so they never overlap.
    pub fn callback(&self, batch: RecordBatch) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.next.as_mut() {
            Some(sink) => sink.callback(batch),
            None => Err(StrataError::Internal("synchronizer has no sink".to_string())),
        }
    }

    /// Mark one producer as done. The last one to finish triggers the
    /// sink's terminal callback and returns its result.
    pub fn finish(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.producers -= 1;
        if inner.producers != 0 || inner.finished {
            return Ok(());
        }
        inner.finished = true;
        match inner.next.as_mut() {
            Some(sink) => sink.finish(),
            None => Err(StrataError::Internal("synchronizer has no sink".to_string())),
        }
    }
}

impl Default for Synchronizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    struct CountingSink {
        callbacks: Arc<AtomicUsize>,
        finishes: Arc<AtomicUsize>,
    }

    impl Sink for CountingSink {
        fn callback(&mut self, _batch: RecordBatch) -> Result<()> {
            // Relaxed on purpose: serialization is the barrier's job, and
            // a race here would show up as a wrong final count.
            let n = self.callbacks.load(Ordering::Relaxed);
            self.callbacks.store(n + 1, Ordering::Relaxed);
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            self.finishes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn empty_batch() -> RecordBatch {
        use arrow::array::Int64Array;
        use arrow::datatypes::{DataType, Field, Schema as ArrowSchema};
        let schema = Arc::new(ArrowSchema::new(vec![Field::new(
            "v",
            DataType::Int64,
            false,
        )]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![0i64]))]).unwrap()
    }

    #[test]
    fn test_two_producers_single_finish() {
        let callbacks = Arc::new(AtomicUsize::new(0));
        let finishes = Arc::new(AtomicUsize::new(0));

        let sync = Arc::new(Synchronizer::new());
        sync.set_next(Box::new(CountingSink {
            callbacks: Arc::clone(&callbacks),
            finishes: Arc::clone(&finishes),
        }));

        let (tx, rx) = crossbeam_channel::unbounded::<RecordBatch>();
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let sync = Arc::clone(&sync);
                let rx = rx.clone();
                sync.register();
                thread::spawn(move || {
                    for batch in rx.iter() {
                        sync.callback(batch).unwrap();
                    }
                    sync.finish().unwrap();
                })
            })
            .collect();
        drop(rx);

        // Two producers splitting 20000 batches between them.
        for _ in 0..20000 {
            tx.send(empty_batch()).unwrap();
        }

        // No finish until the sources dry up
        thread::sleep(Duration::from_millis(50));
        assert_eq!(finishes.load(Ordering::SeqCst), 0);

        drop(tx);
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(callbacks.load(Ordering::Relaxed), 20000);
        assert_eq!(finishes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_many_producers_counts() {
        let callbacks = Arc::new(AtomicUsize::new(0));
        let finishes = Arc::new(AtomicUsize::new(0));

        let sync = Arc::new(Synchronizer::new());
        sync.set_next(Box::new(CountingSink {
            callbacks: Arc::clone(&callbacks),
            finishes: Arc::clone(&finishes),
        }));

        for _ in 0..8 {
            sync.register();
        }

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let sync = Arc::clone(&sync);
                thread::spawn(move || {
                    for _ in 0..(100 * (i + 1)) {
                        sync.callback(empty_batch()).unwrap();
                    }
                    sync.finish().unwrap();
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        // sum of 100 * (1..=8)
        assert_eq!(callbacks.load(Ordering::Relaxed), 3600);
        assert_eq!(finishes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_finish_without_sink_errors() {
        let sync = Synchronizer::new();
        sync.register();
        assert!(sync.finish().is_err());
    }

    #[test]
    fn test_finish_without_registration_never_fires() {
        let callbacks = Arc::new(AtomicUsize::new(0));
        let finishes = Arc::new(AtomicUsize::new(0));

        let sync = Synchronizer::new();
        sync.set_next(Box::new(CountingSink {
            callbacks,
            finishes: Arc::clone(&finishes),
        }));

        // No producer ever registered: the terminal callback stays unfired.
        sync.finish().unwrap();
        assert_eq!(finishes.load(Ordering::SeqCst), 0);
    }
}
