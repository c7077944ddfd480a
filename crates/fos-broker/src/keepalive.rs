//! Keep-alive accounting.
//!
//! The registry calls these hooks outside its lock whenever its entry count
//! moves between zero and one. Calls from one registry never overlap and
//! arrive in transition order; hooks must not call back into the registry.

use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Hooks fired on 0 <-> 1 transitions of the registry's entry count.
pub trait KeepAlive: Send + Sync {
    /// The registry went from empty to holding at least one entry.
    fn on_became_nonempty(&self);

    /// The registry went from holding entries to empty.
    fn on_became_empty(&self);
}

/// Keep-alive that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoKeepAlive;

impl KeepAlive for NoKeepAlive {
    fn on_became_nonempty(&self) {}
    fn on_became_empty(&self) {}
}

/// Reference-counted keep-alive handle.
///
/// The hosting module stays loaded while `is_locked()` is true. Several
/// registries may share one lock; each holds at most one reference.
#[derive(Debug, Default)]
pub struct ModuleLock {
    count: AtomicUsize,
}

impl ModuleLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current number of references held.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_locked(&self) -> bool {
        self.count() > 0
    }
}

impl KeepAlive for ModuleLock {
    fn on_became_nonempty(&self) {
        let count = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(count, "Module locked");
    }

    fn on_became_empty(&self) {
        // Never wrap below zero, even on an unbalanced unlock.
        let prev = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
            .unwrap_or(0);
        debug!(count = prev.saturating_sub(1), "Module unlocked");
    }
}
