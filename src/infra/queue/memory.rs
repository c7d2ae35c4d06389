//! Bounded in-memory FIFO queue shared by the producer and consumers.

use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};

use crate::core::task::Task;

/// Outcome of a blocking queue operation.
#[derive(Debug, PartialEq, Eq)]
pub enum QueueSignal<T> {
    /// The operation completed.
    Done(T),
    /// The shutdown channel fired first.
    Shutdown,
}

/// Fixed-capacity FIFO of tasks.
///
/// Clones share the same underlying channel.
#[derive(Debug, Clone)]
pub struct BoundedTaskQueue {
    tx: Sender<Task>,
    rx: Receiver<Task>,
    capacity: usize,
}

impl BoundedTaskQueue {
    /// Create a queue holding at most `capacity` tasks.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Insert without blocking; hands the task back when the queue is full.
    ///
    /// # Errors
    ///
    /// Returns the task if it could not be inserted.
    pub fn offer(&self, task: Task) -> Result<(), Task> {
        self.tx.try_send(task).map_err(|e| match e {
            TrySendError::Full(task) | TrySendError::Disconnected(task) => task,
        })
    }

    /// Insert, waiting for room unless `shutdown` disconnects first.
    pub fn put(&self, task: Task, shutdown: &Receiver<()>) -> QueueSignal<()> {
        select! {
            send(self.tx, task) -> res => match res {
                Ok(()) => QueueSignal::Done(()),
                Err(_) => QueueSignal::Shutdown,
            },
            recv(shutdown) -> _ => QueueSignal::Shutdown,
        }
    }

    /// Remove the oldest task, waiting unless `shutdown` disconnects first.
    pub fn take(&self, shutdown: &Receiver<()>) -> QueueSignal<Task> {
        select! {
            recv(self.rx) -> msg => msg.map_or(QueueSignal::Shutdown, QueueSignal::Done),
            recv(shutdown) -> _ => QueueSignal::Shutdown,
        }
    }

    /// Remove everything queued without blocking.
    pub fn drain(&self) -> Vec<Task> {
        self.rx.try_iter().collect()
    }

    /// Tasks currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Nothing queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Maximum number of queued tasks.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}
