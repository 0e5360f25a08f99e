//! Allocation accounting for device-resident buffers
//!
//! Every device-resident tensor registers itself here at construction and
//! reports back when released. The counters make leaks and double releases
//! observable without instrumenting the runtime itself.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Tracks the lifecycle of device-resident tensor buffers.
#[derive(Debug, Default)]
pub struct ReleaseLedger {
    allocated: AtomicUsize,
    released: AtomicUsize,
    double_released: AtomicUsize,
    leaked: AtomicUsize,
}

impl ReleaseLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn note_alloc(&self) {
        self.allocated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_release(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_double_release(&self) {
        self.double_released.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_leak(&self) {
        self.leaked.fetch_add(1, Ordering::Relaxed);
    }

    /// Total device buffers ever handed out
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Buffers released exactly as intended
    pub fn released(&self) -> usize {
        self.released.load(Ordering::Relaxed)
    }

    /// Release calls on already-released buffers
    pub fn double_released(&self) -> usize {
        self.double_released.load(Ordering::Relaxed)
    }

    /// Buffers dropped without an explicit release
    pub fn leaked(&self) -> usize {
        self.leaked.load(Ordering::Relaxed)
    }

    /// Buffers still owned somewhere (allocated minus released minus leaked)
    pub fn live(&self) -> usize {
        self.allocated()
            .saturating_sub(self.released())
            .saturating_sub(self.leaked())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_accounting() {
        let ledger = ReleaseLedger::new();
        ledger.note_alloc();
        ledger.note_alloc();
        assert_eq!(ledger.live(), 2);

        ledger.note_release();
        assert_eq!(ledger.live(), 1);
        assert_eq!(ledger.released(), 1);

        ledger.note_leak();
        assert_eq!(ledger.live(), 0);
        assert_eq!(ledger.leaked(), 1);
    }
}
