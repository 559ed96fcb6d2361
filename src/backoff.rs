//! Exponential backoff for CAS retry loops.
//!
//! Not correctness-critical: every loop that uses [`Backoff`] would
//! eventually make progress by spinning bare. It exists only so that a
//! thread contending on a hot atomic backs off instead of flooding the
//! cache-coherence fabric with retries.

use std::cell::Cell;
use std::sync::atomic;

/// Number of busy-spin steps before the backoff starts yielding the thread
/// to the scheduler instead.
const SPIN_LIMIT: u32 = 6;

/// Number of yielding steps after which `is_completed` reports `true`.
const YIELD_LIMIT: u32 = 10;

/// Stateful exponential backoff.
///
/// Each call to [`Backoff::once`] waits for roughly twice as long as the
/// previous call, up to a point, then switches from busy-spinning to
/// `std::thread::yield_now`. Create a fresh `Backoff` at the top of a
/// CAS-retry loop and call `once()` on every failed attempt.
pub struct Backoff {
    step: Cell<u32>,
}

impl Backoff {
    /// Creates a backoff in its initial (no delay) state.
    pub fn new() -> Self {
        Self { step: Cell::new(0) }
    }

    /// Resets the backoff to its initial state.
    pub fn reset(&self) {
        self.step.set(0);
    }

    /// Backs off once. Busy-spins for the first [`SPIN_LIMIT`] calls (a
    /// doubling number of `spin_loop` hints each time), then yields the
    /// thread for subsequent calls.
    pub fn once(&self) {
        let step = self.step.get();
        if step <= SPIN_LIMIT {
            for _ in 0..1u32 << step {
                atomic::spin_loop();
            }
        } else {
            std::thread::yield_now();
        }

        if step <= YIELD_LIMIT {
            self.step.set(step + 1);
        }
    }

    /// Whether this backoff has exhausted its spinning budget and is now
    /// purely yielding. Callers that want a hard upper bound on local
    /// retries (rather than a pure liveness reliance on lock-freedom) can
    /// use this as a hint to fall back to a heavier strategy.
    pub fn is_completed(&self) -> bool {
        self.step.get() > YIELD_LIMIT
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::Backoff;

    #[test]
    fn spins_then_completes() {
        let backoff = Backoff::new();
        for _ in 0..super::YIELD_LIMIT {
            assert!(!backoff.is_completed());
            backoff.once();
        }
        assert!(backoff.is_completed());
    }

    #[test]
    fn reset_restarts_the_schedule() {
        let backoff = Backoff::new();
        for _ in 0..super::YIELD_LIMIT + 1 {
            backoff.once();
        }
        assert!(backoff.is_completed());
        backoff.reset();
        assert!(!backoff.is_completed());
    }
}
