//! Concrete callback shapes used throughout the public API.

use bytes::Bytes;

use crate::callback::Callback;
use crate::error::ConnectionError;

/// `on_message(channel, payload)`.
pub type OnMessage = Callback<(Bytes, Bytes)>;
/// `on_activation(channel)` — the channel or pattern that just became active.
pub type OnActivation = Callback<Bytes>;
/// `on_disconnect(error)`.
pub type OnDisconnect = Callback<ConnectionError>;

/// The callback triple a registered subscription carries, plus an
/// internal-only hook used by [`PromiseSubscription`](crate::PromiseSubscription)
/// to learn about Multiplexer shutdown specifically (as opposed to a
/// recoverable disconnect) so it can release `wait_for_activation` waiters
/// with `SubscriptionClosed` rather than leaving them blocked.
#[derive(Clone, Debug, Default)]
pub(crate) struct Callbacks {
    pub on_message: OnMessage,
    pub on_disconnect: OnDisconnect,
    pub on_activation: OnActivation,
    pub on_mux_closed: Callback<()>,
}
