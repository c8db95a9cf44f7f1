use crossbeam_queue::ArrayQueue;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Result of attempting to enqueue.
///
/// # Example
/// ```rust
/// use aperture_core::prelude::{bounded, SendOutcome};
///
/// let (tx, _rx) = bounded::<u8>(1);
/// assert_eq!(tx.send(1), SendOutcome::Ok);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Value was accepted.
    Ok,
    /// Queue is full.
    Full,
    /// Queue is closed.
    Closed,
}

/// Result of attempting to dequeue.
///
/// # Example
/// ```rust
/// use aperture_core::prelude::{bounded, RecvOutcome};
///
/// let (_tx, rx) = bounded::<u8>(1);
/// match rx.recv() {
///     RecvOutcome::Empty | RecvOutcome::Closed | RecvOutcome::Data(_) => {}
/// }
/// ```
#[derive(Debug)]
pub enum RecvOutcome<T> {
    /// Received value.
    Data(T),
    /// Queue has been closed and drained.
    Closed,
    /// Queue currently empty.
    Empty,
}

/// Bounded sender handle.
#[derive(Clone)]
pub struct BoundedTx<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> BoundedTx<T> {
    /// Attempt to send without blocking.
    pub fn send(&self, value: T) -> SendOutcome {
        if self.inner.closed.load(Ordering::Acquire) {
            return SendOutcome::Closed;
        }
        self.inner
            .queue
            .push(value)
            .map(|_| SendOutcome::Ok)
            .unwrap_or(SendOutcome::Full)
    }

    /// Close the queue to further sends.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

/// Bounded receiver handle.
#[derive(Clone)]
pub struct BoundedRx<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> BoundedRx<T> {
    /// Attempt to receive without blocking.
    pub fn recv(&self) -> RecvOutcome<T> {
        match self.inner.queue.pop() {
            Some(value) => RecvOutcome::Data(value),
            None => {
                if self.inner.closed.load(Ordering::Acquire) {
                    RecvOutcome::Closed
                } else {
                    RecvOutcome::Empty
                }
            }
        }
    }

    /// Mark the queue as closed; senders will see `Closed` and exit.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

struct QueueInner<T> {
    queue: ArrayQueue<T>,
    closed: AtomicBool,
}

/// Create a bounded queue with the given capacity.
///
/// # Example
/// ```rust
/// use aperture_core::prelude::{bounded, RecvOutcome, SendOutcome};
///
/// let (tx, rx) = bounded::<u8>(1);
/// assert_eq!(tx.send(1), SendOutcome::Ok);
/// match rx.recv() {
///     RecvOutcome::Data(_) | RecvOutcome::Empty | RecvOutcome::Closed => {}
/// }
/// ```
pub fn bounded<T>(capacity: usize) -> (BoundedTx<T>, BoundedRx<T>) {
    let inner = Arc::new(QueueInner {
        queue: ArrayQueue::new(capacity),
        closed: AtomicBool::new(false),
    });
    (
        BoundedTx {
            inner: inner.clone(),
        },
        BoundedRx { inner },
    )
}

/// Two-lane queue carrying finished work from a driver thread to a consumer.
///
/// The `done` lane receives completed items from the producing (driver)
/// thread; the `free` lane hands recycled items back. Both lanes are
/// lock-free and both push and pop are O(1) and allocation-free, so the
/// done side is safe to call from latency-sensitive driver callbacks.
///
/// `close` flips a shared flag: pushes start reporting `Closed`, while pops
/// keep draining whatever is already queued.
///
/// # Example
/// ```rust
/// use aperture_core::prelude::{CompletionQueue, RecvOutcome, SendOutcome};
///
/// let queue = CompletionQueue::new(2);
/// assert_eq!(queue.push_done(7u32), SendOutcome::Ok);
/// assert!(matches!(queue.pop_done(), RecvOutcome::Data(7)));
/// assert!(matches!(queue.pop_done(), RecvOutcome::Empty));
/// ```
pub struct CompletionQueue<T> {
    done: ArrayQueue<T>,
    free: ArrayQueue<T>,
    closed: AtomicBool,
}

impl<T> CompletionQueue<T> {
    /// Create a queue where each lane holds up to `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self {
            done: ArrayQueue::new(capacity.max(1)),
            free: ArrayQueue::new(capacity.max(1)),
            closed: AtomicBool::new(false),
        }
    }

    /// Push a completed item onto the done lane.
    pub fn push_done(&self, value: T) -> SendOutcome {
        if self.closed.load(Ordering::Acquire) {
            return SendOutcome::Closed;
        }
        self.done
            .push(value)
            .map(|_| SendOutcome::Ok)
            .unwrap_or(SendOutcome::Full)
    }

    /// Pop the oldest completed item; drains even after close.
    pub fn pop_done(&self) -> RecvOutcome<T> {
        match self.done.pop() {
            Some(value) => RecvOutcome::Data(value),
            None => {
                if self.closed.load(Ordering::Acquire) {
                    RecvOutcome::Closed
                } else {
                    RecvOutcome::Empty
                }
            }
        }
    }

    /// Push a recycled item onto the free lane.
    pub fn push_free(&self, value: T) -> SendOutcome {
        if self.closed.load(Ordering::Acquire) {
            return SendOutcome::Closed;
        }
        self.free
            .push(value)
            .map(|_| SendOutcome::Ok)
            .unwrap_or(SendOutcome::Full)
    }

    /// Pop a recycled item; drains even after close.
    pub fn pop_free(&self) -> RecvOutcome<T> {
        match self.free.pop() {
            Some(value) => RecvOutcome::Data(value),
            None => {
                if self.closed.load(Ordering::Acquire) {
                    RecvOutcome::Closed
                } else {
                    RecvOutcome::Empty
                }
            }
        }
    }

    /// Number of items waiting on the done lane.
    pub fn done_len(&self) -> usize {
        self.done.len()
    }

    /// Number of items waiting on the free lane.
    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Refuse further pushes on both lanes.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_full_and_closed() {
        let (tx, rx) = bounded::<u8>(1);
        assert_eq!(tx.send(1), SendOutcome::Ok);
        assert_eq!(tx.send(2), SendOutcome::Full);
        tx.close();
        assert_eq!(tx.send(3), SendOutcome::Closed);
        assert!(matches!(rx.recv(), RecvOutcome::Data(1)));
        assert!(matches!(rx.recv(), RecvOutcome::Closed));
    }

    #[test]
    fn completion_lanes_are_independent() {
        let queue = CompletionQueue::new(2);
        assert_eq!(queue.push_done(1u8), SendOutcome::Ok);
        assert_eq!(queue.push_free(9u8), SendOutcome::Ok);
        assert_eq!(queue.done_len(), 1);
        assert_eq!(queue.free_len(), 1);
        assert!(matches!(queue.pop_free(), RecvOutcome::Data(9)));
        assert!(matches!(queue.pop_done(), RecvOutcome::Data(1)));
    }

    #[test]
    fn completion_close_drains_pending() {
        let queue = CompletionQueue::new(2);
        assert_eq!(queue.push_done(1u8), SendOutcome::Ok);
        queue.close();
        assert_eq!(queue.push_done(2u8), SendOutcome::Closed);
        assert!(matches!(queue.pop_done(), RecvOutcome::Data(1)));
        assert!(matches!(queue.pop_done(), RecvOutcome::Closed));
    }

    #[test]
    fn completion_done_lane_reports_full() {
        let queue = CompletionQueue::new(1);
        assert_eq!(queue.push_done(1u8), SendOutcome::Ok);
        assert_eq!(queue.push_done(2u8), SendOutcome::Full);
    }
}
