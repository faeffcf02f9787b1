//! Requesting collections.
//!
//! Mutators (and the runtime's explicit-GC surface) signal the collector
//! thread here. Synchronous requesters wait for the cycle counter to
//! move, polling with an exponentially backed-off timeout. The collector
//! never cancels mid-cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub struct GcRequester {
    pending: Mutex<bool>,
    /// The collector thread parks here between cycles.
    wake: Condvar,
    /// Synchronous requesters park here until the cycle counter moves.
    done: Condvar,
    /// Outside the mutex so mutators can elide repeat requests cheaply.
    request_flag: AtomicBool,
}

impl GcRequester {
    pub fn new() -> GcRequester {
        GcRequester {
            pending: Mutex::new(false),
            wake: Condvar::new(),
            done: Condvar::new(),
            request_flag: AtomicBool::new(false),
        }
    }

    /// Ask for a collection. Duplicate requests while one is pending are
    /// collapsed.
    pub fn request(&self) {
        if self.request_flag.load(Ordering::Relaxed) {
            return;
        }
        let mut pending = self.pending.lock().unwrap();
        if !self.request_flag.load(Ordering::Relaxed) {
            self.request_flag.store(true, Ordering::Relaxed);
            *pending = true;
            self.wake.notify_one();
        }
    }

    /// Block the collector thread until a request arrives, then consume
    /// it.
    pub fn wait_for_request(&self) {
        let mut pending = self.pending.lock().unwrap();
        while !*pending {
            pending = self.wake.wait(pending).unwrap();
        }
        *pending = false;
        self.request_flag.store(false, Ordering::Relaxed);
    }

    /// Wake everyone waiting on cycle completion.
    pub fn notify_cycle_done(&self) {
        let _pending = self.pending.lock().unwrap();
        self.done.notify_all();
    }

    /// Wait until `cycle()` differs from `was`, with exponential-backoff
    /// polling.
    pub fn wait_for_cycle_change(&self, cycle: impl Fn() -> usize, was: usize) {
        let mut timeout = Duration::from_millis(100);
        let mut pending = self.pending.lock().unwrap();
        while cycle() == was {
            let (guard, _) = self.done.wait_timeout(pending, timeout).unwrap();
            pending = guard;
            timeout *= 2;
        }
    }
}

impl Default for GcRequester {
    fn default() -> Self {
        Self::new()
    }
}
