//! Mailbox: FIFO message queue guarded by a mutex and a condition variable.
//!
//! Senders insert at the front, the owning process consumes from the back,
//! so messages from one sender arrive in the order they were posted. The
//! owner blocks in [`Mailbox::wait_pop`] while the queue is empty; closing
//! the mailbox wakes it for shutdown.
//!
//! # Example
//!
//! ```rust
//! use kestrel_runtime::mailbox::Mailbox;
//!
//! let mailbox = Mailbox::new();
//! mailbox.post("hello".to_string());
//! assert_eq!(mailbox.wait_pop(), Some("hello".to_string()));
//! assert!(mailbox.is_empty());
//! ```

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;

// ---------------------------------------------------------------------------
// Mailbox
// ---------------------------------------------------------------------------

struct Inner<T> {
    queue: VecDeque<T>,
    closed: bool,
}

pub struct Mailbox<T> {
    inner: Mutex<Inner<T>>,
    ready: Condvar,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Mailbox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Mailbox")
            .field("pending", &inner.queue.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Enqueue a message and wake the owner. Returns `false` (dropping the
    /// message) if the mailbox has been closed.
    pub fn post(&self, msg: T) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        inner.queue.push_front(msg);
        drop(inner);
        self.ready.notify_one();
        true
    }

    /// Non-blocking receive.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().queue.pop_back()
    }

    /// Block until a message arrives. Returns `None` once the mailbox is
    /// closed, even if messages are still queued.
    pub fn wait_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return None;
            }
            if let Some(msg) = inner.queue.pop_back() {
                return Some(msg);
            }
            self.ready.wait(&mut inner);
        }
    }

    /// Close the mailbox and wake every waiter.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
