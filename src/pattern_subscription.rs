//! A handle bound to a single immutable glob pattern.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;

use crate::callbacks::Callbacks;
use crate::multiplexer::Multiplexer;

/// Created with a pattern fixed at construction. Matching is delegated
/// entirely to Redis's native `PSUBSCRIBE` glob semantics; `on_message`
/// receives the concrete channel a message arrived on, not the pattern.
#[derive(Clone)]
pub struct PatternSubscription {
    mux: Multiplexer,
    id: crate::ids::SubId,
    pattern: Bytes,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for PatternSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternSubscription")
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}

impl PatternSubscription {
    pub(crate) async fn new_with_callbacks(mux: Multiplexer, pattern: Bytes, callbacks: Callbacks) -> Self {
        let id = mux.register_pattern_subscription(pattern.clone(), callbacks).await;
        Self {
            mux,
            id,
            pattern,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The pattern this handle was constructed with.
    pub fn pattern(&self) -> &Bytes {
        &self.pattern
    }

    /// Removes this handle's interest in the pattern from the Multiplexer.
    /// Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.mux.close_pattern_subscription(self.id);
    }
}
