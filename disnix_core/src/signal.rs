//! Cooperative cancellation (§5, §9 design note). The coordinator is single
//! threaded and runs no raw signal handlers; instead a background task awaits
//! `tokio::signal::ctrl_c()` and flips one flag, which the locking phase (C8)
//! and the scheduler's (C5) outer loops check at the head of every pass.
//!
//! Grounded on `tokio::signal::ctrl_c()` usage in the pack (e.g.
//! `exonum-exonum`'s CLI, which spawns a future awaiting it alongside the
//! node's main run loop rather than installing a libc handler).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A clonable handle onto one process-wide interrupt flag.
#[derive(Debug, Clone)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
}

impl Interrupt {
    pub fn new() -> Self {
        Interrupt {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawns a background task that sets the flag the first time Ctrl-C is
    /// observed. Returns immediately; the coordinator's own loops are
    /// responsible for noticing `is_set()` and winding down.
    pub fn install(&self) {
        let flag = self.flag.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, finishing in-flight work before aborting");
                flag.store(true, Ordering::SeqCst);
            }
        });
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Used by tests to simulate an interrupt without a real Ctrl-C.
    pub fn trip(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_interrupt_is_not_set() {
        let i = Interrupt::new();
        assert!(!i.is_set());
    }

    #[test]
    fn trip_sets_the_flag_and_clones_observe_it() {
        let i = Interrupt::new();
        let j = i.clone();
        i.trip();
        assert!(j.is_set());
    }
}
