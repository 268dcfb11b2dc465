//! Bounded FIFO conduits between pipeline stages.

mod bounded;

pub use bounded::BoundedQueue;
