//! Tagged callback value with a single "invoke" operation that adapts both
//! synchronous and asynchronous user callbacks.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A nullable, synchronous-or-asynchronous callback.
///
/// Synchronous callbacks run inline on the Multiplexer's actor task and must
/// not block; asynchronous callbacks are submitted to the runtime as an
/// independent task so dispatch is never blocked on a slow subscriber.
pub enum Callback<T> {
    None,
    Sync(Arc<dyn Fn(T) + Send + Sync>),
    Async(Arc<dyn Fn(T) -> BoxFuture + Send + Sync>),
}

impl<T> Clone for Callback<T> {
    fn clone(&self) -> Self {
        match self {
            Self::None => Self::None,
            Self::Sync(f) => Self::Sync(Arc::clone(f)),
            Self::Async(f) => Self::Async(Arc::clone(f)),
        }
    }
}

impl<T> fmt::Debug for Callback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::None => "None",
            Self::Sync(_) => "Sync(..)",
            Self::Async(_) => "Async(..)",
        };
        write!(f, "Callback::{label}")
    }
}

impl<T> Default for Callback<T> {
    fn default() -> Self {
        Self::None
    }
}

impl<T: Send + 'static> Callback<T> {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(f))
    }

    pub fn asynchronous<F, Fut>(f: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::Async(Arc::new(move |value| Box::pin(f(value)) as BoxFuture))
    }

    /// Invokes the callback with `value`, adapting to whichever shape it is.
    /// A panic inside a synchronous callback is caught and logged rather
    /// than propagated: a misbehaving subscriber must never take down dispatch
    /// for every other subscriber sharing the same Multiplexer.
    pub fn invoke(&self, value: T) {
        match self {
            Self::None => {}
            Self::Sync(f) => {
                let f = Arc::clone(f);
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(value))).is_err() {
                    tracing::warn!("subscription callback panicked; ignoring");
                }
            }
            Self::Async(f) => {
                let fut = f(value);
                tokio::spawn(async move {
                    fut.await;
                });
            }
        }
    }
}
