//! Configuration errors (spec §7, §10.3).
//!
//! The hot path (`find`/`mem`/`add`/`remove`/`elements`) never fails —
//! per spec §7 there are no user-visible error conditions once a map
//! exists. The only fallible operation is constructing one with a
//! misconfigured `load` factor.

use thiserror::Error;

/// Misconfiguration rejected at construction time (spec §7: `load < 1` is
/// a programming error). `nb_bucket < 2` is rejected at compile time
/// instead, via `static_assertions::const_assert!` on the `NB_BUCKET`
/// const generic, since it is a property of the type rather than a value.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MapConfigError {
    /// `load` must be at least 1 (average bucket depth can't shrink the
    /// table below one element per bucket before triggering a resize).
    #[error("load factor must be >= 1, got {0}")]
    InvalidLoadFactor(usize),
}
