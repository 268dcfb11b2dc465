//! Fixed-capacity async queue with close semantics.

use crate::cancellation::CancellationToken;
use crate::errors::{QueueError, ReadCancelled, TryReadError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::Notify;

/// Slots reserved up front; the deque grows on demand up to `capacity`.
const INITIAL_RESERVE: usize = 16;

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// A capacity-bounded, multi-producer multi-consumer FIFO.
///
/// Writers suspend while the queue is full and readers suspend while it is
/// empty. Items from a single writer keep their relative order; there is no
/// ordering guarantee across writers. Closing the queue lets readers drain
/// what is left, after which every read returns `None` immediately.
pub struct BoundedQueue<T> {
    state: Mutex<QueueState<T>>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
}

impl<T> BoundedQueue<T> {
    /// Creates a queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero. Pipeline validation rejects zero
    /// capacities before any queue is constructed.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(INITIAL_RESERVE)),
                closed: false,
            }),
            capacity,
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// Enqueues an item, suspending while the queue is full.
    ///
    /// Returns the item in `QueueError::Closed` if the queue is closed before
    /// space frees up.
    pub async fn write(&self, item: T) -> Result<(), QueueError<T>> {
        self.write_inner(item, None).await
    }

    /// Like [`write`](Self::write), but gives up when `token` is cancelled.
    ///
    /// An already-cancelled token fails immediately, even if space is free.
    pub async fn write_cancellable(&self, item: T, token: &CancellationToken) -> Result<(), QueueError<T>> {
        self.write_inner(item, Some(token)).await
    }

    /// Enqueues an item without suspending.
    pub fn try_write(&self, item: T) -> Result<(), QueueError<T>> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(QueueError::Closed(item));
            }
            if state.items.len() >= self.capacity {
                return Err(QueueError::Full(item));
            }
            state.items.push_back(item);
        }
        self.not_empty.notify_one();
        Ok(())
    }

    /// Enqueues an item without suspending, evicting the oldest item if full.
    ///
    /// Returns the evicted item, if any, so the caller can dispose of it.
    pub fn force_write(&self, item: T) -> Result<Option<T>, QueueError<T>> {
        let evicted = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(QueueError::Closed(item));
            }
            let evicted = if state.items.len() >= self.capacity {
                state.items.pop_front()
            } else {
                None
            };
            state.items.push_back(item);
            evicted
        };
        self.not_empty.notify_one();
        Ok(evicted)
    }

    /// Dequeues an item, suspending while the queue is empty and open.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn read(&self) -> Option<T> {
        match self.read_inner(None).await {
            Ok(item) => item,
            Err(ReadCancelled) => None,
        }
    }

    /// Like [`read`](Self::read), but gives up when `token` is cancelled.
    ///
    /// An already-cancelled token fails immediately, even if items remain.
    pub async fn read_cancellable(&self, token: &CancellationToken) -> Result<Option<T>, ReadCancelled> {
        self.read_inner(Some(token)).await
    }

    /// Dequeues an item without suspending.
    pub fn try_read(&self) -> Result<T, TryReadError> {
        let item = {
            let mut state = self.state.lock();
            match state.items.pop_front() {
                Some(item) => item,
                None if state.closed => return Err(TryReadError::Closed),
                None => return Err(TryReadError::Empty),
            }
        };
        self.not_full.notify_one();
        Ok(item)
    }

    /// Signals that no more writes will occur. Idempotent.
    ///
    /// Suspended writers get their item back as `QueueError::Closed`;
    /// suspended readers drain what is left and then observe end-of-stream.
    pub fn close(&self) {
        let was_closed = std::mem::replace(&mut self.state.lock().closed, true);
        if !was_closed {
            self.not_empty.notify_waiters();
            self.not_full.notify_waiters();
        }
    }

    /// Returns true once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Returns the number of items currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Returns true if no items are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Returns true if the queue is at capacity.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.state.lock().items.len() >= self.capacity
    }

    /// Returns the fixed capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    async fn write_inner(&self, mut item: T, token: Option<&CancellationToken>) -> Result<(), QueueError<T>> {
        loop {
            if token.is_some_and(CancellationToken::is_cancelled) {
                // A wakeup consumed by this writer belongs to someone else now.
                if !self.is_full() {
                    self.not_full.notify_one();
                }
                return Err(QueueError::Cancelled(item));
            }

            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_write(item) {
                Ok(()) => return Ok(()),
                Err(QueueError::Full(back)) => item = back,
                Err(other) => return Err(other),
            }

            tokio::select! {
                () = &mut notified => {}
                () = wait_cancelled(token) => {}
            }
        }
    }

    async fn read_inner(&self, token: Option<&CancellationToken>) -> Result<Option<T>, ReadCancelled> {
        loop {
            if token.is_some_and(CancellationToken::is_cancelled) {
                if !self.is_empty() {
                    self.not_empty.notify_one();
                }
                return Err(ReadCancelled);
            }

            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_read() {
                Ok(item) => return Ok(Some(item)),
                Err(TryReadError::Closed) => return Ok(None),
                Err(TryReadError::Empty) => {}
            }

            tokio::select! {
                () = &mut notified => {}
                () = wait_cancelled(token) => {}
            }
        }
    }
}

async fn wait_cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BoundedQueue")
            .field("len", &state.items.len())
            .field("capacity", &self.capacity)
            .field("closed", &state.closed)
            .finish()
    }
}
