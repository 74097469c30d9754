//! Wake-ups for consumers waiting on newly activated chunks.
//!
//! Thread-based waiters block on a condition variable; async waiters (server
//! sessions) await a [`tokio::sync::Notify`]. Both are driven by the same
//! generation counter so a waiter can tell whether anything happened since it
//! last looked.

use parking_lot::{Condvar, Mutex};
use std::time::Instant;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct ActivationSignal {
    generation: Mutex<u64>,
    condvar: Condvar,
    notify: Notify,
}

impl ActivationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every waiter.
    pub fn notify(&self) {
        {
            let mut generation = self.generation.lock();
            *generation = generation.wrapping_add(1);
        }
        self.condvar.notify_all();
        self.notify.notify_waiters();
    }

    pub fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    /// Block until the generation moves past `seen` or `deadline` passes.
    ///
    /// Returns true if a notification arrived.
    pub fn wait_past(&self, seen: u64, deadline: Instant) -> bool {
        let mut generation = self.generation.lock();
        while *generation == seen {
            if self.condvar.wait_until(&mut generation, deadline).timed_out() {
                return *generation != seen;
            }
        }
        true
    }

    /// Future resolving on the next notification.
    ///
    /// Only notifications after the future is enabled (or first polled) are
    /// seen, so call [`Notified::enable`] before checking for data.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }
}
