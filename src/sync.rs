//! Concurrency primitives shared across the engine
//!
//! - `WaitGroup`: counts in-flight operations and lets one side block until
//!   all of them have finished. Entering returns an RAII guard so a writer
//!   or reader that aborts early still releases its slot.
//! - `Cancellation`: cooperative cancellation token checked at blocking
//!   points. Tokens can be chained so an internal pipeline can abort without
//!   canceling the caller's token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

struct WaitGroupInner {
    count: Mutex<usize>,
    cond: Condvar,
}

/// Counts active participants; `wait` blocks until the count drains to zero.
///
/// Safe for concurrent enter/drop from any number of threads.
#[derive(Clone)]
pub struct WaitGroup {
    inner: Arc<WaitGroupInner>,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(WaitGroupInner {
                count: Mutex::new(0),
                cond: Condvar::new(),
            }),
        }
    }

    /// Register a participant. The returned guard releases the slot on drop.
    pub fn enter(&self) -> WaitGuard {
        *self.inner.count.lock() += 1;
        WaitGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Block until every outstanding guard has been dropped.
    pub fn wait(&self) {
        let mut count = self.inner.count.lock();
        while *count > 0 {
            self.inner.cond.wait(&mut count);
        }
    }

    /// Number of outstanding guards.
    pub fn count(&self) -> usize {
        *self.inner.count.lock()
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for a wait-group slot - releases on drop
pub struct WaitGuard {
    inner: Arc<WaitGroupInner>,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        let mut count = self.inner.count.lock();
        *count -= 1;
        if *count == 0 {
            self.inner.cond.notify_all();
        }
    }
}

/// Cooperative cancellation token.
///
/// Cloning shares the underlying flag. `child` creates a token that observes
/// the parent's cancellation but can be canceled independently.
#[derive(Clone)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
    parent: Option<Box<Cancellation>>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: None,
        }
    }

    /// A token canceled when either it or `self` is canceled.
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Box::new(self.clone())),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        if self.flag.load(Ordering::Acquire) {
            return true;
        }
        self.parent.as_ref().map(|p| p.is_canceled()).unwrap_or(false)
    }

    /// Returns `Err(Canceled)` if the token has been canceled.
    pub fn check(&self) -> crate::Result<()> {
        if self.is_canceled() {
            Err(crate::StrataError::Canceled)
        } else {
            Ok(())
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}
