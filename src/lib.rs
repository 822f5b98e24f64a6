//! A multiplexer over a single Redis Pub/Sub connection: reference-counted
//! channel/pattern subscriptions, dispatch, and automatic reconnect with
//! full-jitter exponential backoff.
//!
//! The [`Multiplexer`] owns exactly one Redis connection and a
//! reference-counted interest table; [`ChannelSubscription`] and
//! [`PatternSubscription`] are cheap handles into it, and
//! [`PromiseSubscription`] layers a timed single-delivery rendezvous on top
//! of a pattern subscription. See each type's documentation for its
//! operations and invariants.

mod backoff;
mod callback;
mod callbacks;
mod channel_subscription;
mod config;
mod error;
mod ids;
mod listener;
mod multiplexer;
mod pattern_subscription;
mod promise;

pub use backoff::{Backoff, BackoffConfig};
pub use callback::Callback;
pub use callbacks::{OnActivation, OnDisconnect, OnMessage};
pub use channel_subscription::ChannelSubscription;
pub use config::Config;
pub use error::{ConnectionError, InactiveSubscription, PromiseOutcome, SubscriptionClosed};
pub use multiplexer::{ConnectionFactory, Multiplexer};
pub use pattern_subscription::PatternSubscription;
pub use promise::{Promise, PromiseSubscription};
