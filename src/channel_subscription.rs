//! A handle representing interest in a dynamic set of channels.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;

use crate::callbacks::Callbacks;
use crate::multiplexer::Multiplexer;

/// Tracks zero or more channels. `add`/`remove` are idempotent and become
/// no-ops once [`close`](Self::close) has run.
#[derive(Clone)]
pub struct ChannelSubscription {
    mux: Multiplexer,
    id: crate::ids::SubId,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for ChannelSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSubscription").finish_non_exhaustive()
    }
}

impl ChannelSubscription {
    pub(crate) async fn new_with_callbacks(mux: Multiplexer, callbacks: Callbacks) -> Self {
        let id = mux.register_channel_subscription(callbacks).await;
        Self {
            mux,
            id,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Adding a channel already present on this handle is a no-op; no
    /// duplicate callback registration and no second `SUBSCRIBE` is issued.
    pub fn add(&self, channel: impl Into<Bytes>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.mux.add_channel(self.id, channel.into());
    }

    /// Removing an absent channel is a no-op.
    pub fn remove(&self, channel: impl Into<Bytes>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.mux.remove_channel(self.id, channel.into());
    }

    /// Removes every channel held by this handle from the Multiplexer and
    /// refuses subsequent `add`/`remove`. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.mux.close_channel_subscription(self.id);
    }
}
