//! Cooperative cancellation for pipeline suspension points.
//!
//! A single [`CancellationToken`] is created (or supplied) when a pipeline is
//! built and observed at every suspension point: queue reads and writes,
//! admission waits and scope acquisition.

mod token;

pub use token::{CancelCallback, CancellationToken};
