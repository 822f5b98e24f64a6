//! Connection configuration accepted by [`Multiplexer::new`](crate::Multiplexer::new)
//! and its variants. There is no process entry point to parse flags for —
//! this crate is embedded as a library — so configuration is built up
//! through a plain constructor and builder methods instead of a CLI parser.

use std::sync::Arc;

use crate::backoff::BackoffConfig;
use crate::error::ConnectionError;
use crate::multiplexer::ConnectionFactory;

/// Bundles everything the Multiplexer needs to (re)connect. Treated as an
/// opaque token by the core: it is only ever forwarded to the connection
/// factory, never inspected.
#[derive(Clone, Debug)]
pub struct Config {
    redis_url: String,
    backoff: BackoffConfig,
}

impl Config {
    /// Connects to `redis_url` on every (re)connect attempt, with default backoff.
    pub fn new(redis_url: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
            backoff: BackoffConfig::default(),
        }
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn backoff(&self) -> BackoffConfig {
        self.backoff
    }

    /// Builds a [`ConnectionFactory`] that opens a fresh `redis::Client`
    /// against this config's URL on every call.
    ///
    /// # Errors
    /// Returns [`ConnectionError`] if `redis_url` is not a valid Redis connection string.
    pub fn connection_factory(&self) -> Result<ConnectionFactory, ConnectionError> {
        let url = self.redis_url.clone();
        let client = redis::Client::open(url.clone()).map_err(|e| ConnectionError::Redis(e.to_string()))?;
        Ok(Arc::new(move || client.clone()))
    }
}
