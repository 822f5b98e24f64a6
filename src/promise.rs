//! Timed single-delivery rendezvous built on an internal `prefix + "*"`
//! PatternSubscription.
//!
//! Pending promises and waiters need their own serialized state distinct
//! from the Multiplexer's, so this owns a second small actor task fed by
//! the inner pattern subscription's callbacks — the same handle-plus-task
//! shape used for the Multiplexer and Listener themselves.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::callback::Callback;
use crate::callbacks::Callbacks;
use crate::error::{InactiveSubscription, PromiseOutcome, SubscriptionClosed};
use crate::multiplexer::Multiplexer;
use crate::pattern_subscription::PatternSubscription;

struct PendingEntry {
    id: u64,
    sender: oneshot::Sender<PromiseOutcome>,
}

enum PromiseCommand {
    Activate,
    Disconnect,
    Closed,
    Message {
        suffix: Bytes,
        payload: Bytes,
    },
    NewPromise {
        suffix: Bytes,
        reply: oneshot::Sender<Result<(u64, oneshot::Receiver<PromiseOutcome>), InactiveSubscription>>,
    },
    WaitForActivation {
        reply: oneshot::Sender<Result<(), SubscriptionClosed>>,
    },
    WaitForNewPromise {
        suffix: Bytes,
        reply: oneshot::Sender<Result<(u64, oneshot::Receiver<PromiseOutcome>), SubscriptionClosed>>,
    },
    Timeout {
        suffix: Bytes,
        id: u64,
    },
    Cancel {
        suffix: Bytes,
        id: u64,
    },
}

/// A single-use, timed rendezvous with one future Pub/Sub message on a
/// specific channel. Resolves to exactly one of [`PromiseOutcome::Resolved`],
/// [`PromiseOutcome::TimedOut`], or [`PromiseOutcome::Cancelled`].
pub struct Promise {
    id: u64,
    suffix: Bytes,
    commands: mpsc::UnboundedSender<PromiseCommand>,
    rx: oneshot::Receiver<PromiseOutcome>,
}

impl std::fmt::Debug for Promise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise").field("suffix", &self.suffix).finish_non_exhaustive()
    }
}

impl Future for Promise {
    type Output = PromiseOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(PromiseOutcome::Cancelled),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Promise {
    /// Detaches this promise from the pending set without side effects on
    /// other waiters sharing the same suffix.
    fn drop(&mut self) {
        let _ = self.commands.send(PromiseCommand::Cancel {
            suffix: self.suffix.clone(),
            id: self.id,
        });
    }
}

/// Tracks activation of a `prefix + "*"` pattern and dispatches Pub/Sub
/// messages into pending [`Promise`]s keyed by the channel's suffix.
pub struct PromiseSubscription {
    prefix: Bytes,
    commands: mpsc::UnboundedSender<PromiseCommand>,
    pattern: PatternSubscription,
}

impl std::fmt::Debug for PromiseSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromiseSubscription").field("prefix", &self.prefix).finish_non_exhaustive()
    }
}

impl PromiseSubscription {
    pub(crate) async fn new(mux: Multiplexer, prefix: Bytes) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(
            PromiseState {
                closed: false,
                active: false,
                next_id: 0,
                pending: HashMap::new(),
                activation_waiters: Vec::new(),
                new_promise_waiters: Vec::new(),
            }
            .run(rx),
        );

        let mut glob = Vec::with_capacity(prefix.len() + 1);
        glob.extend_from_slice(&prefix);
        glob.push(b'*');
        let glob = Bytes::from(glob);
        let prefix_len = prefix.len();

        let message_cmds = tx.clone();
        let on_message = Callback::sync(move |(channel, payload): (Bytes, Bytes)| {
            let suffix = channel.slice(prefix_len..);
            let _ = message_cmds.send(PromiseCommand::Message { suffix, payload });
        });

        let activation_cmds = tx.clone();
        let on_activation = Callback::sync(move |_channel: Bytes| {
            let _ = activation_cmds.send(PromiseCommand::Activate);
        });

        let disconnect_cmds = tx.clone();
        let on_disconnect = Callback::sync(move |_error: crate::error::ConnectionError| {
            let _ = disconnect_cmds.send(PromiseCommand::Disconnect);
        });

        let closed_cmds = tx.clone();
        let on_mux_closed = Callback::sync(move |()| {
            let _ = closed_cmds.send(PromiseCommand::Closed);
        });

        let callbacks = Callbacks {
            on_message,
            on_disconnect,
            on_activation,
            on_mux_closed,
        };
        let pattern = PatternSubscription::new_with_callbacks(mux, glob, callbacks).await;

        Self { prefix, commands: tx, pattern }
    }

    /// Suspends until the underlying pattern becomes active in the current
    /// generation, returning immediately if already active. All concurrent
    /// waiters are released together on activation.
    pub async fn wait_for_activation(&self) -> Result<(), SubscriptionClosed> {
        let (reply, reply_rx) = oneshot::channel();
        if self.commands.send(PromiseCommand::WaitForActivation { reply }).is_err() {
            return Err(SubscriptionClosed);
        }
        reply_rx.await.unwrap_or(Err(SubscriptionClosed))
    }

    /// Synchronously creates a [`Promise`] listening on `prefix + suffix`;
    /// the timeout clock starts now.
    pub async fn new_promise(&self, suffix: impl Into<Bytes>, timeout: Duration) -> Result<Promise, InactiveSubscription> {
        let suffix = suffix.into();
        let (reply, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(PromiseCommand::NewPromise { suffix: suffix.clone(), reply })
            .is_err()
        {
            return Err(InactiveSubscription);
        }
        let (id, rx) = reply_rx.await.unwrap_or(Err(InactiveSubscription))?;
        Ok(self.finish_promise(suffix, id, rx, timeout))
    }

    /// Equivalent to [`wait_for_activation`](Self::wait_for_activation) then
    /// [`new_promise`](Self::new_promise), atomic with respect to a
    /// concurrent close. The timeout clock starts only once the promise has
    /// actually been created.
    pub async fn wait_for_new_promise(&self, suffix: impl Into<Bytes>, timeout: Duration) -> Result<Promise, SubscriptionClosed> {
        let suffix = suffix.into();
        let (reply, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(PromiseCommand::WaitForNewPromise { suffix: suffix.clone(), reply })
            .is_err()
        {
            return Err(SubscriptionClosed);
        }
        let (id, rx) = reply_rx.await.unwrap_or(Err(SubscriptionClosed))?;
        Ok(self.finish_promise(suffix, id, rx, timeout))
    }

    fn finish_promise(&self, suffix: Bytes, id: u64, rx: oneshot::Receiver<PromiseOutcome>, timeout: Duration) -> Promise {
        let timeout_cmds = self.commands.clone();
        let timeout_suffix = suffix.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = timeout_cmds.send(PromiseCommand::Timeout { suffix: timeout_suffix, id });
        });
        Promise { id, suffix, commands: self.commands.clone(), rx }
    }

    /// Cancels all pending promises, releases all waiters with
    /// `SubscriptionClosed`, and closes the inner PatternSubscription.
    pub fn close(&self) {
        let _ = self.commands.send(PromiseCommand::Closed);
        self.pattern.close();
    }
}

struct PromiseState {
    closed: bool,
    active: bool,
    next_id: u64,
    pending: HashMap<Bytes, Vec<PendingEntry>>,
    activation_waiters: Vec<oneshot::Sender<Result<(), SubscriptionClosed>>>,
    new_promise_waiters: Vec<(Bytes, oneshot::Sender<Result<(u64, oneshot::Receiver<PromiseOutcome>), SubscriptionClosed>>)>,
}

impl PromiseState {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<PromiseCommand>) {
        while let Some(cmd) = commands.recv().await {
            self.handle(cmd);
        }
    }

    fn handle(&mut self, cmd: PromiseCommand) {
        match cmd {
            PromiseCommand::Activate => self.on_activate(),
            PromiseCommand::Disconnect => self.on_disconnect(),
            PromiseCommand::Closed => self.on_closed(),
            PromiseCommand::Message { suffix, payload } => self.on_message(suffix, payload),
            PromiseCommand::NewPromise { suffix, reply } => {
                let result = if self.active {
                    Ok(self.create_promise(suffix))
                } else {
                    Err(InactiveSubscription)
                };
                let _ = reply.send(result);
            }
            PromiseCommand::WaitForActivation { reply } => {
                if self.closed {
                    let _ = reply.send(Err(SubscriptionClosed));
                } else if self.active {
                    let _ = reply.send(Ok(()));
                } else {
                    self.activation_waiters.push(reply);
                }
            }
            PromiseCommand::WaitForNewPromise { suffix, reply } => {
                if self.closed {
                    let _ = reply.send(Err(SubscriptionClosed));
                } else if self.active {
                    let _ = reply.send(Ok(self.create_promise(suffix)));
                } else {
                    self.new_promise_waiters.push((suffix, reply));
                }
            }
            PromiseCommand::Timeout { suffix, id } => self.settle_one(&suffix, id, PromiseOutcome::TimedOut),
            PromiseCommand::Cancel { suffix, id } => {
                if let Some(entries) = self.pending.get_mut(&suffix) {
                    entries.retain(|entry| entry.id != id);
                    if entries.is_empty() {
                        self.pending.remove(&suffix);
                    }
                }
            }
        }
    }

    fn create_promise(&mut self, suffix: Bytes) -> (u64, oneshot::Receiver<PromiseOutcome>) {
        let id = self.next_id;
        self.next_id += 1;
        let (sender, receiver) = oneshot::channel();
        self.pending.entry(suffix).or_default().push(PendingEntry { id, sender });
        (id, receiver)
    }

    fn settle_one(&mut self, suffix: &Bytes, id: u64, outcome: PromiseOutcome) {
        let Some(entries) = self.pending.get_mut(suffix) else { return };
        let Some(pos) = entries.iter().position(|entry| entry.id == id) else { return };
        let entry = entries.remove(pos);
        if entries.is_empty() {
            self.pending.remove(suffix);
        }
        let _ = entry.sender.send(outcome);
    }

    fn on_activate(&mut self) {
        if self.closed {
            return;
        }
        self.active = true;
        for waiter in self.activation_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        for (suffix, reply) in std::mem::take(&mut self.new_promise_waiters) {
            let promise = self.create_promise(suffix);
            let _ = reply.send(Ok(promise));
        }
    }

    /// A disconnect cancels in-flight promises and new-promise waiters, but
    /// `wait_for_activation` waiters stay blocked until reactivation or close.
    fn on_disconnect(&mut self) {
        if self.closed {
            return;
        }
        self.active = false;
        for (_, entries) in self.pending.drain() {
            for entry in entries {
                let _ = entry.sender.send(PromiseOutcome::Cancelled);
            }
        }
        for (_, reply) in std::mem::take(&mut self.new_promise_waiters) {
            let _ = reply.send(Err(SubscriptionClosed));
        }
    }

    fn on_closed(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.active = false;
        for (_, entries) in self.pending.drain() {
            for entry in entries {
                let _ = entry.sender.send(PromiseOutcome::Cancelled);
            }
        }
        for waiter in self.activation_waiters.drain(..) {
            let _ = waiter.send(Err(SubscriptionClosed));
        }
        for (_, reply) in self.new_promise_waiters.drain(..) {
            let _ = reply.send(Err(SubscriptionClosed));
        }
    }

    fn on_message(&mut self, suffix: Bytes, payload: Bytes) {
        let Some(entries) = self.pending.remove(&suffix) else { return };
        for entry in entries {
            let _ = entry.sender.send(PromiseOutcome::Resolved(payload.clone()));
        }
    }
}
