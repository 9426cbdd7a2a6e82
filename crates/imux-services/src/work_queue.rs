//! Multi-producer, multi-consumer handoff queue.
//!
//! Producers `push` items; any number of consumers `pop` concurrently and each
//! item goes to exactly one of them. A consumer that fails to process an item
//! gives it back with `requeue`, which puts it at the front so it is the next
//! item handed out.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    ready: Notify,
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            ready: Notify::new(),
        }
    }

    /// Append an item. Returns false if the queue is closed.
    pub fn push(&self, item: T) -> bool {
        self.insert(item, false)
    }

    /// Return an item to the front of the queue.
    ///
    /// Accepted even after `close`, so an item taken before shutdown is still
    /// drained by the remaining consumers.
    pub fn requeue(&self, item: T) {
        self.insert(item, true);
    }

    fn insert(&self, item: T, front: bool) -> bool {
        {
            let mut state = self.lock();
            if state.closed && !front {
                return false;
            }
            if front {
                state.items.push_front(item);
            } else {
                state.items.push_back(item);
            }
        }
        self.ready.notify_one();
        true
    }

    /// Wait for the next item. Returns `None` once the queue is closed and
    /// empty.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(item) = state.items.pop_front() {
                    let more = !state.items.is_empty();
                    drop(state);
                    if more {
                        // Pass the wakeup on; notify_one may have coalesced.
                        self.ready.notify_one();
                    }
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Take an item if one is ready, without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Stop accepting pushes and wake every waiting consumer.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState<T>> {
        // A panic while holding this lock leaves the deque consistent, so a
        // poisoned guard is still safe to use.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
