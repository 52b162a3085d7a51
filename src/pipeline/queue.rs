//! Bounded FIFO queue shared by a pool of consumers.
//!
//! Producers never wait: [`BoundedQueue::try_push`] fails immediately when the
//! queue is at capacity and hands the item back. Consumers call
//! [`BoundedQueue::pop`], which suspends until an item is available.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, mpsc};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError<T> {
    /// The queue holds `capacity` items; the rejected item is returned.
    #[error("queue is full")]
    Full(T),

    #[error("queue is closed")]
    Closed(T),
}

impl<T> QueueError<T> {
    pub fn into_inner(self) -> T {
        match self {
            QueueError::Full(item) | QueueError::Closed(item) => item,
        }
    }
}

/// Multi-producer, multi-consumer bounded queue.
///
/// Cloning yields another handle to the same queue.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    tx: mpsc::Sender<T>,
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
    capacity: usize,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        BoundedQueue {
            tx: self.tx.clone(),
            rx: Arc::clone(&self.rx),
            capacity: self.capacity,
        }
    }
}

impl<T: Send + 'static> BoundedQueue<T> {
    /// Creates a queue; a capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        BoundedQueue {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            capacity,
        }
    }

    pub fn try_push(&self, item: T) -> Result<(), QueueError<T>> {
        self.tx.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(item) => QueueError::Full(item),
            mpsc::error::TrySendError::Closed(item) => QueueError::Closed(item),
        })
    }

    /// Waits for the next item. Returns `None` once the queue is closed and
    /// drained.
    ///
    /// Consumers are served one at a time; a consumer cancelled while
    /// waiting loses nothing.
    pub async fn pop(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }

    /// Rejects further pushes and discards whatever is still queued.
    ///
    /// Must only be called once no consumer is waiting in [`pop`](Self::pop).
    pub async fn close(&self) -> usize {
        let mut rx = self.rx.lock().await;
        rx.close();
        let mut discarded = 0;
        while rx.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }

    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
