//! Query-side operator plumbing
//!
//! The engine drives user callbacks from several workers at once. When those
//! callbacks feed a shared downstream operator, the `Synchronizer` barrier
//! serializes the calls and fires the operator's terminal `finish` exactly
//! once, after the last producer is done.

pub mod synchronizer;

use arrow::record_batch::RecordBatch;

use crate::Result;

/// A downstream operator fed by one or more producers.
pub trait Sink: Send {
    /// Handle one batch. Never invoked concurrently with itself or with
    /// `finish` when driven through a `Synchronizer`.
    fn callback(&mut self, batch: RecordBatch) -> Result<()>;

    /// Terminal call, invoked once all upstream producers are exhausted.
    fn finish(&mut self) -> Result<()>;
}

pub use synchronizer::Synchronizer;
