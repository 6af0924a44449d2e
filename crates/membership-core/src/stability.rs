//! Asynchronous delivery of view changes.
//!
//! Producers (the gossip round) `put` without blocking; one dedicated consumer
//! thread delivers each change to every subscribed [`ViewListener`] in FIFO
//! order. A listener that panics is logged and skipped, delivery continues.

use crate::view::{ViewChange, ViewListener};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

struct Queue {
    pending: VecDeque<ViewChange>,
    active: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    ready: Condvar,
    listeners: RwLock<Vec<(usize, Arc<dyn ViewListener>)>>,
    next_id: AtomicUsize,
}

impl Shared {
    /// Waits out a delivery that is cloning the listener list. The read lock
    /// is never held across a callback.
    fn unsubscribe(&self, id: usize) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(i, _)| *i != id);
    }

    fn deliver(&self, change: &ViewChange) {
        let listeners: Vec<_> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            let result = panic::catch_unwind(AssertUnwindSafe(|| listener.on_view_change(change)));
            if result.is_err() {
                error!(
                    "View listener panicked on view {} (number {})",
                    format_members(change),
                    change.view_number
                );
            }
        }
    }
}

fn format_members(change: &ViewChange) -> String {
    format!("{:?}", change.view.members)
}

/// Handle that unsubscribes its listener when dropped.
pub struct Subscription {
    shared: Weak<Shared>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.unsubscribe(self.id);
        }
    }
}

pub struct StabilityQueue {
    shared: Arc<Shared>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl StabilityQueue {
    /// Create the queue and start its consumer thread.
    pub fn start() -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                pending: VecDeque::new(),
                active: true,
            }),
            ready: Condvar::new(),
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        });

        let consumer_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("view-notifier".into())
            .spawn(move || consume(&consumer_shared))?;

        Ok(Self {
            shared,
            consumer: Mutex::new(Some(handle)),
        })
    }

    pub fn subscribe(&self, listener: Arc<dyn ViewListener>) -> Subscription {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, listener));
        Subscription {
            shared: Arc::downgrade(&self.shared),
            id,
        }
    }

    /// Enqueue a change for delivery. Never blocks on listeners.
    ///
    /// Returns false once the queue has been deactivated.
    pub fn put(&self, change: ViewChange) -> bool {
        let mut queue = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
        if !queue.active {
            return false;
        }
        queue.pending.push_back(change);
        self.shared.ready.notify_one();
        true
    }

    pub fn is_active(&self) -> bool {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .active
    }

    /// Stop the consumer. Pending changes are discarded. Idempotent.
    ///
    /// Waits for an in-progress delivery to finish unless called from a
    /// listener on the consumer thread itself.
    pub fn deactivate(&self) {
        {
            let mut queue = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
            if queue.active {
                queue.active = false;
                if !queue.pending.is_empty() {
                    debug!("Discarding {} pending view changes", queue.pending.len());
                    queue.pending.clear();
                }
            }
            self.shared.ready.notify_all();
        }

        let handle = self
            .consumer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for StabilityQueue {
    fn drop(&mut self) {
        self.deactivate();
    }
}

fn consume(shared: &Shared) {
    loop {
        let change = {
            let mut queue = shared.queue.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                if !queue.active {
                    return;
                }
                if let Some(change) = queue.pending.pop_front() {
                    break change;
                }
                queue = shared.ready.wait(queue).unwrap_or_else(|e| e.into_inner());
            }
        };
        shared.deliver(&change);
    }
}
