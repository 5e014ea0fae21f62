//! Reconciliation primitives.
//!
//! Helpers shared by every workflow that converges runtime reality toward a
//! desired state:
//!
//! - **Retry pipeline**: a bounded, cancellable retry loop that short-circuits
//!   on errors classified as non-retryable ([`RetryPolicy`], [`Retryable`]).
//! - **Single-flight**: concurrent callers for the same key share one
//!   in-flight execution ([`SingleFlight`]).
//! - **Outcomes**: how a convergence pass reached the desired state
//!   ([`ConvergenceOutcome`]).
//!
//! # Invariants
//!
//! - An operation is attempted at most `max_attempts` times
//! - A non-retryable error is returned after the attempt that produced it
//! - Once cancelled, no further attempt starts

mod retry;
mod single_flight;

pub use retry::{Cancelled, RetryPolicy, Retryable};
pub use single_flight::SingleFlight;

use std::time::Duration;

/// How a convergence pass reached the desired state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceOutcome {
    /// An existing runtime object was restarted in place.
    Restarted,

    /// The runtime object was (re)created from scratch.
    Created,
}

impl ConvergenceOutcome {
    /// Returns true if a new runtime object was created.
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created)
    }
}

impl std::fmt::Display for ConvergenceOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Restarted => write!(f, "restarted"),
            Self::Created => write!(f, "created"),
        }
    }
}

/// Default number of attempts (first try included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default pause between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::ZERO;
