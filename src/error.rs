//! Error kinds surfaced to users of the multiplexer.

use std::fmt;

/// A failure reported by the [`Listener`](crate::listener) for the current
/// Redis connection. Always recoverable: the Multiplexer's reconnect loop
/// takes over as soon as this is observed, the caller need take no action
/// beyond whatever local cleanup `on_disconnect` triggers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    #[error("redis connection error: {0}")]
    Redis(String),
    #[error("redis protocol error: {0}")]
    Protocol(String),
}

/// Raised by [`PromiseSubscription::new_promise`](crate::PromiseSubscription::new_promise)
/// when the underlying pattern subscription is not currently active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("pattern subscription is not currently active")]
pub struct InactiveSubscription;

/// Raised by `wait_for_activation`, `wait_for_new_promise`, and a pending
/// [`Promise`](crate::Promise) when the owning subscription or the
/// Multiplexer itself has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("subscription was closed")]
pub struct SubscriptionClosed;

impl fmt::Display for PromiseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromiseOutcome::Resolved(payload) => write!(f, "Resolved({} bytes)", payload.len()),
            PromiseOutcome::TimedOut => write!(f, "TimedOut"),
            PromiseOutcome::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// The single terminal state of a [`Promise`](crate::Promise). A promise
/// settles exactly once, into exactly one of these three outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromiseOutcome {
    /// The first message published on `prefix + suffix` after the promise was created.
    Resolved(bytes::Bytes),
    /// The promise's timeout elapsed with no matching message.
    TimedOut,
    /// The owning `PromiseSubscription` was closed, a disconnect occurred
    /// before resolution, or the caller cancelled the await.
    Cancelled,
}
