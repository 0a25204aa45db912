//! Bounded event queue between the network thread and the dispatcher.
//!
//! FIFO, backpressured: `push` blocks while the queue is full, `pop` blocks
//! while it is empty. Shutdown is an in-band `DrainAndStop` marker, so every
//! event pushed before the stop request is still delivered.

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::events::Event;

/// Items travelling through the queue.
#[derive(Debug)]
pub(crate) enum QueueItem {
    /// An event tagged with the connection attempt that produced it.
    Event { epoch: u64, event: Event },
    /// Deliver everything queued so far, then stop.
    DrainAndStop,
}

/// The dispatcher is gone and nothing will consume further items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueueClosed;

/// Producer side.
#[derive(Clone)]
pub(crate) struct EventSender {
    tx: Sender<QueueItem>,
}

/// Consumer side.
pub(crate) struct EventReceiver {
    rx: Receiver<QueueItem>,
}

/// Create a queue holding at most `depth` items.
pub(crate) fn event_queue(depth: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = bounded(depth.max(1));
    (EventSender { tx }, EventReceiver { rx })
}

impl EventSender {
    /// Enqueue an event, blocking while the queue is full.
    pub fn push(&self, epoch: u64, event: Event) -> Result<(), QueueClosed> {
        self.tx
            .send(QueueItem::Event { epoch, event })
            .map_err(|_| QueueClosed)
    }

    /// Enqueue the drain-and-stop marker.
    pub fn request_stop(&self) -> Result<(), QueueClosed> {
        self.tx.send(QueueItem::DrainAndStop).map_err(|_| QueueClosed)
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(0)
    }
}

impl EventReceiver {
    /// Wait for the next event.
    ///
    /// Returns `None` once the drain-and-stop marker is reached or every
    /// sender has been dropped.
    pub fn pop(&self) -> Option<(u64, Event)> {
        match self.rx.recv() {
            Ok(QueueItem::Event { epoch, event }) => Some((epoch, event)),
            Ok(QueueItem::DrainAndStop) | Err(_) => None,
        }
    }
}
