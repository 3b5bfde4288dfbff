//! Typed event queues with priority drain.
//!
//! Each worker owns three queues. A counting semaphore tracks the
//! total number of undelivered messages across all three; the worker
//! takes one permit per wake and drains exactly one message, always
//! preferring VLAN notifications over normal events over bulk
//! address callbacks. This keeps VLAN reconfiguration ahead of any
//! flood of client events.

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Semaphore;

use std::sync::Arc;
use std::sync::Mutex;

use crate::error::{PacError, PacResult};

/// Which queue a message is issued to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueClass {
    /// VLAN collaborator notifications; drained first.
    Vlan,
    /// Config changes, interface events, ticks, method callbacks.
    Normal,
    /// Batched unauthenticated-address callbacks; drained last.
    Bulk,
}

/// Sending half, cloneable across tasks and collaborator callbacks.
pub struct BusSender<E> {
    vlan: UnboundedSender<E>,
    normal: UnboundedSender<E>,
    bulk: UnboundedSender<E>,
    task_sync: Arc<Semaphore>,
}

impl<E> Clone for BusSender<E> {
    fn clone(&self) -> Self {
        Self {
            vlan: self.vlan.clone(),
            normal: self.normal.clone(),
            bulk: self.bulk.clone(),
            task_sync: Arc::clone(&self.task_sync),
        }
    }
}

impl<E> BusSender<E> {
    /// Enqueues `event` on the given queue and posts the semaphore.
    pub fn issue(&self, class: QueueClass, event: E) -> PacResult<()> {
        let q = match class {
            QueueClass::Vlan => &self.vlan,
            QueueClass::Normal => &self.normal,
            QueueClass::Bulk => &self.bulk,
        };
        q.send(event)
            .map_err(|_| PacError::failure("event queue closed"))?;
        self.task_sync.add_permits(1);
        Ok(())
    }
}

/// Receiving half, owned by the worker.
pub struct BusReceiver<E> {
    vlan: Mutex<UnboundedReceiver<E>>,
    normal: Mutex<UnboundedReceiver<E>>,
    bulk: Mutex<UnboundedReceiver<E>>,
    task_sync: Arc<Semaphore>,
}

impl<E> BusReceiver<E> {
    /// Blocks until a message is available, then returns exactly one,
    /// in priority order VLAN, Normal, Bulk.
    pub async fn recv(&self) -> Option<E> {
        let permit = self.task_sync.acquire().await.ok()?;
        permit.forget();
        self.pop()
    }

    /// Non-blocking variant; returns one message if any queue is
    /// non-empty.
    pub fn try_next(&self) -> Option<E> {
        let permit = self.task_sync.try_acquire().ok()?;
        permit.forget();
        self.pop()
    }

    fn pop(&self) -> Option<E> {
        if let Ok(e) = {
            let mut q = self.vlan.lock().expect("bus queue poisoned");
            q.try_recv()
        } {
            return Some(e);
        }
        if let Ok(e) = {
            let mut q = self.normal.lock().expect("bus queue poisoned");
            q.try_recv()
        } {
            return Some(e);
        }
        let mut q = self.bulk.lock().expect("bus queue poisoned");
        q.try_recv().ok()
    }
}

/// Creates a connected sender/receiver pair.
pub fn event_bus<E>() -> (BusSender<E>, BusReceiver<E>) {
    let (vtx, vrx) = unbounded_channel();
    let (ntx, nrx) = unbounded_channel();
    let (btx, brx) = unbounded_channel();
    let task_sync = Arc::new(Semaphore::new(0));
    (
        BusSender {
            vlan: vtx,
            normal: ntx,
            bulk: btx,
            task_sync: Arc::clone(&task_sync),
        },
        BusReceiver {
            vlan: Mutex::new(vrx),
            normal: Mutex::new(nrx),
            bulk: Mutex::new(brx),
            task_sync,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_drain_order() {
        let (tx, rx) = event_bus::<&'static str>();
        tx.issue(QueueClass::Bulk, "bulk").unwrap();
        tx.issue(QueueClass::Normal, "normal").unwrap();
        tx.issue(QueueClass::Vlan, "vlan").unwrap();

        assert_eq!(rx.try_next(), Some("vlan"));
        assert_eq!(rx.try_next(), Some("normal"));
        assert_eq!(rx.try_next(), Some("bulk"));
        assert_eq!(rx.try_next(), None);
    }

    #[test]
    fn test_fifo_within_queue() {
        let (tx, rx) = event_bus::<u32>();
        for i in 0..5 {
            tx.issue(QueueClass::Normal, i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(rx.try_next(), Some(i));
        }
    }

    #[test]
    fn test_one_message_per_permit() {
        let (tx, rx) = event_bus::<u32>();
        tx.issue(QueueClass::Normal, 1).unwrap();
        assert!(rx.try_next().is_some());
        // the semaphore is drained even though queues are checked lazily
        assert!(rx.try_next().is_none());
    }

    #[tokio::test]
    async fn test_async_recv() {
        let (tx, rx) = event_bus::<u32>();
        let sender = tx.clone();
        tokio::spawn(async move {
            sender.issue(QueueClass::Normal, 9).unwrap();
        });
        assert_eq!(rx.recv().await, Some(9));
    }
}
