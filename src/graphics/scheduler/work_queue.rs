use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::graphics::error::{Error, Result};

/// Unbounded multi-producer, multi-consumer queue. Closing it lets consumers
/// drain what is left and then stop.
#[derive(Debug)]
pub(crate) struct WorkQueue<T> {
    sender: Mutex<Option<Sender<T>>>,
    receiver: Receiver<T>,
}

impl<T> WorkQueue<T> {
    pub(crate) fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();

        Self {
            sender: Mutex::new(Some(sender)),
            receiver,
        }
    }

    pub(crate) fn push(&self, item: T) -> Result<()> {
        match &*self.sender.lock() {
            Some(sender) => sender.send(item).map_err(|_| Error::QueueClosed),
            None => Err(Error::QueueClosed),
        }
    }

    /// Blocks for the next item. `None` once the queue is closed and empty.
    pub(crate) fn pop(&self) -> Option<T> {
        self.receiver.recv().ok()
    }

    pub(crate) fn close(&self) {
        self.sender.lock().take();
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.receiver.len()
    }
}

/// Counts work items that were enqueued but are not recorded yet.
#[derive(Debug, Default)]
pub(crate) struct CountEvent {
    count: Mutex<usize>,
    zero: Condvar,
}

impl CountEvent {
    pub(crate) fn increment(&self) {
        *self.count.lock() += 1;
    }

    pub(crate) fn signal(&self) {
        let mut count = self.count.lock();
        debug_assert!(*count > 0, "CountEvent signalled more often than incremented");

        *count = count.saturating_sub(1);
        if *count == 0 {
            self.zero.notify_all();
        }
    }

    pub(crate) fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.zero.wait(&mut count);
        }
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        *self.count.lock()
    }
}
