use std::sync::atomic::{AtomicUsize, Ordering};

/// Global counter of client connections currently in the relay phase.
pub static ACTIVE_RELAYS: AtomicUsize = AtomicUsize::new(0);

/// RAII guard that keeps the active-relay counter honest on every exit path.
pub struct ConnectionGuard {
    counter: &'static AtomicUsize,
}

impl ConnectionGuard {
    /// Create a new guard and increment the global counter
    pub fn new() -> Self {
        Self::with_counter(&ACTIVE_RELAYS)
    }

    fn with_counter(counter: &'static AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self { counter }
    }

    /// Get the current active relay count
    pub fn active_count() -> usize {
        ACTIVE_RELAYS.load(Ordering::Relaxed)
    }
}

impl Default for ConnectionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}
