//! Bounded blocking work queue.
//!
//! Producers offer items with a timeout; consumers block in [`TaskQueue::take`]
//! until an item arrives or the queue is closed. Consumers report finished
//! items with [`TaskQueue::done`] so producers can wait for the queue to go
//! idle.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Why an offer was refused. The item is handed back.
#[derive(Debug)]
pub enum OfferError<T> {
    /// The queue stayed full for the whole timeout.
    Full(T),
    /// The queue has been closed.
    Closed(T),
}

impl<T> OfferError<T> {
    /// Returns the refused item.
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(item) | Self::Closed(item) => item,
        }
    }
}

struct State<T> {
    items: VecDeque<T>,
    in_flight: usize,
    closed: bool,
}

/// A bounded multi-producer, multi-consumer queue.
pub struct TaskQueue<T> {
    capacity: usize,
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    idle: Condvar,
}

impl<T> TaskQueue<T> {
    /// Creates a queue holding at most `capacity` items.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(State {
                items: VecDeque::new(),
                in_flight: 0,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            idle: Condvar::new(),
        }
    }

    /// Queues `item`, waiting up to `timeout` for space.
    pub fn offer(&self, item: T, timeout: Duration) -> Result<(), OfferError<T>> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(OfferError::Closed(item));
            }
            if state.items.len() < self.capacity {
                state.items.push_back(item);
                self.not_empty.notify_one();
                return Ok(());
            }
            let timed_out = match deadline {
                Some(deadline) => self.not_full.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.not_full.wait(&mut state);
                    false
                }
            };
            if timed_out && state.items.len() >= self.capacity {
                return Err(if state.closed {
                    OfferError::Closed(item)
                } else {
                    OfferError::Full(item)
                });
            }
        }
    }

    /// Takes the next item, blocking until one is available. Returns `None`
    /// once the queue is closed and empty.
    ///
    /// Every item taken must be reported with [`done`](Self::done).
    pub fn take(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                state.in_flight += 1;
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Reports that an item returned by [`take`](Self::take) is finished.
    pub fn done(&self) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.items.is_empty() && state.in_flight == 0 {
            self.idle.notify_all();
        }
    }

    /// Closes the queue. Queued items are still handed out; new offers are
    /// refused.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Removes and returns every item not yet taken.
    pub fn drain_pending(&self) -> Vec<T> {
        let mut state = self.state.lock();
        let pending: Vec<T> = state.items.drain(..).collect();
        self.not_full.notify_all();
        if state.in_flight == 0 {
            self.idle.notify_all();
        }
        pending
    }

    /// Returns true once the queue is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Waits until every queued item has been taken and finished. Returns
    /// false if that did not happen within `timeout`.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        while !state.items.is_empty() || state.in_flight > 0 {
            match deadline {
                Some(deadline) => {
                    if self.idle.wait_until(&mut state, deadline).timed_out() {
                        return state.items.is_empty() && state.in_flight == 0;
                    }
                }
                None => self.idle.wait(&mut state),
            }
        }
        true
    }

    /// Returns the number of queued items, not counting items in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
