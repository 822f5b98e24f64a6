//! Reference-counted registry of channel/pattern interest, dispatch, and the
//! reconnect state machine.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::backoff::{Backoff, BackoffConfig};
use crate::callbacks::Callbacks;
use crate::channel_subscription::ChannelSubscription;
use crate::error::ConnectionError;
use crate::ids::{IdGenerator, SubId};
use crate::listener::{self, ListenerHandle, TaggedEvent};
use crate::pattern_subscription::PatternSubscription;
use crate::promise::PromiseSubscription;

/// A connection factory: produces a fresh, unconnected `redis::Client` for
/// each (re)connect attempt. Connection configuration is an opaque bundle
/// the core only forwards, never inspects.
pub type ConnectionFactory = Arc<dyn Fn() -> redis::Client + Send + Sync>;

struct ChannelSubEntry {
    callbacks: Callbacks,
    channels: HashSet<Bytes>,
}

struct PatternSubEntry {
    callbacks: Callbacks,
    pattern: Bytes,
}

pub(crate) enum MuxCommand {
    NewChannelSubscription {
        callbacks: Callbacks,
        reply: oneshot::Sender<SubId>,
    },
    NewPatternSubscription {
        pattern: Bytes,
        callbacks: Callbacks,
        reply: oneshot::Sender<SubId>,
    },
    AddChannel {
        sub: SubId,
        channel: Bytes,
    },
    RemoveChannel {
        sub: SubId,
        channel: Bytes,
    },
    CloseChannelSubscription {
        sub: SubId,
    },
    ClosePatternSubscription {
        sub: SubId,
    },
    ListenerEvent(TaggedEvent),
    ListenerConnected {
        generation: u64,
        handle: ListenerHandle,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running Multiplexer actor. Cheap to clone; every
/// subscription type holds one of these rather than a reference into the
/// actor's own state, so there is no reference cycle to break on drop.
#[derive(Clone)]
pub struct Multiplexer {
    pub(crate) commands: mpsc::UnboundedSender<MuxCommand>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer").finish_non_exhaustive()
    }
}

impl Multiplexer {
    /// Spawns the actor task and an initial connection attempt.
    pub fn new(factory: ConnectionFactory) -> Self {
        Self::with_backoff(factory, BackoffConfig::default())
    }

    pub fn with_backoff(factory: ConnectionFactory, backoff_config: BackoffConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let state = MuxState {
            channel_refs: HashMap::new(),
            channel_active: HashSet::new(),
            pattern_refs: HashMap::new(),
            pattern_active: HashSet::new(),
            channel_subs: HashMap::new(),
            pattern_subs: HashMap::new(),
            ids: IdGenerator::default(),
            generation: 0,
            listener: None,
            closed: false,
            factory,
            backoff_config,
            reconnect_flag: Arc::clone(&closed),
            commands: tx.clone(),
            events: events_tx,
        };

        tokio::spawn(state.run(rx, events_rx));

        Self { commands: tx }
    }

    pub async fn new_channel_subscription(
        &self,
        on_message: crate::callbacks::OnMessage,
        on_disconnect: crate::callbacks::OnDisconnect,
        on_activation: crate::callbacks::OnActivation,
    ) -> ChannelSubscription {
        let callbacks = Callbacks {
            on_message,
            on_disconnect,
            on_activation,
            on_mux_closed: crate::callback::Callback::None,
        };
        ChannelSubscription::new_with_callbacks(self.clone(), callbacks).await
    }

    pub async fn new_pattern_subscription(
        &self,
        pattern: impl Into<Bytes>,
        on_message: crate::callbacks::OnMessage,
        on_disconnect: crate::callbacks::OnDisconnect,
        on_activation: crate::callbacks::OnActivation,
    ) -> PatternSubscription {
        let callbacks = Callbacks {
            on_message,
            on_disconnect,
            on_activation,
            on_mux_closed: crate::callback::Callback::None,
        };
        PatternSubscription::new_with_callbacks(self.clone(), pattern.into(), callbacks).await
    }

    pub async fn new_promise_subscription(&self, prefix: impl Into<Bytes>) -> PromiseSubscription {
        PromiseSubscription::new(self.clone(), prefix.into()).await
    }

    pub(crate) async fn register_channel_subscription(&self, callbacks: Callbacks) -> SubId {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.commands.send(MuxCommand::NewChannelSubscription { callbacks, reply: reply_tx });
        reply_rx.await.unwrap_or_else(|_| SubId::dead())
    }

    pub(crate) async fn register_pattern_subscription(&self, pattern: Bytes, callbacks: Callbacks) -> SubId {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.commands.send(MuxCommand::NewPatternSubscription { pattern, callbacks, reply: reply_tx });
        reply_rx.await.unwrap_or_else(|_| SubId::dead())
    }

    pub(crate) fn add_channel(&self, sub: SubId, channel: Bytes) {
        let _ = self.commands.send(MuxCommand::AddChannel { sub, channel });
    }

    pub(crate) fn remove_channel(&self, sub: SubId, channel: Bytes) {
        let _ = self.commands.send(MuxCommand::RemoveChannel { sub, channel });
    }

    pub(crate) fn close_channel_subscription(&self, sub: SubId) {
        let _ = self.commands.send(MuxCommand::CloseChannelSubscription { sub });
    }

    pub(crate) fn close_pattern_subscription(&self, sub: SubId) {
        let _ = self.commands.send(MuxCommand::ClosePatternSubscription { sub });
    }

    /// Idempotent: closes every registered subscription, terminates the
    /// Listener, and releases resources.
    pub async fn close(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(MuxCommand::Close { reply: reply_tx }).is_ok() {
            let _ = reply_rx.await;
        }
    }
}

struct MuxState {
    channel_refs: HashMap<Bytes, HashSet<SubId>>,
    channel_active: HashSet<Bytes>,
    pattern_refs: HashMap<Bytes, HashSet<SubId>>,
    pattern_active: HashSet<Bytes>,
    channel_subs: HashMap<SubId, ChannelSubEntry>,
    pattern_subs: HashMap<SubId, PatternSubEntry>,
    ids: IdGenerator,
    generation: u64,
    listener: Option<ListenerHandle>,
    closed: bool,
    factory: ConnectionFactory,
    backoff_config: BackoffConfig,
    reconnect_flag: Arc<AtomicBool>,
    commands: mpsc::UnboundedSender<MuxCommand>,
    events: mpsc::UnboundedSender<TaggedEvent>,
}

impl MuxState {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<MuxCommand>, mut events: mpsc::UnboundedReceiver<TaggedEvent>) {
        self.begin_connect();

        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(MuxCommand::Close { reply }) => {
                            self.handle_close();
                            let _ = reply.send(());
                            return;
                        }
                        Some(cmd) => self.handle_command(cmd),
                        None => return,
                    }
                }
                Some(tagged) = events.recv() => {
                    self.handle_listener_event(tagged);
                }
            }
        }
    }

    fn begin_connect(&mut self) {
        spawn_reconnect(
            self.generation,
            Arc::clone(&self.factory),
            self.backoff_config,
            self.events.clone(),
            self.commands.clone(),
            Arc::clone(&self.reconnect_flag),
        );
    }

    fn handle_command(&mut self, cmd: MuxCommand) {
        match cmd {
            MuxCommand::NewChannelSubscription { callbacks, reply } => {
                let id = self.ids.next();
                self.channel_subs.insert(
                    id,
                    ChannelSubEntry {
                        callbacks,
                        channels: HashSet::new(),
                    },
                );
                let _ = reply.send(id);
            }
            MuxCommand::NewPatternSubscription { pattern, callbacks, reply } => {
                let id = self.ids.next();
                self.pattern_subs.insert(
                    id,
                    PatternSubEntry {
                        callbacks,
                        pattern: pattern.clone(),
                    },
                );
                self.add_pattern(id, pattern);
                let _ = reply.send(id);
            }
            MuxCommand::AddChannel { sub, channel } => self.add_channel(sub, channel),
            MuxCommand::RemoveChannel { sub, channel } => self.remove_channel(sub, channel),
            MuxCommand::CloseChannelSubscription { sub } => self.close_channel_subscription(sub),
            MuxCommand::ClosePatternSubscription { sub } => self.close_pattern_subscription(sub),
            MuxCommand::ListenerEvent(tagged) => self.handle_listener_event(tagged),
            MuxCommand::ListenerConnected { generation, handle } => self.handle_connected(generation, handle),
            MuxCommand::Close { .. } => unreachable!("Close is handled in run()"),
        }
    }

    fn add_channel(&mut self, sub: SubId, channel: Bytes) {
        if self.closed {
            return;
        }
        if let Some(entry) = self.channel_subs.get_mut(&sub) {
            if !entry.channels.insert(channel.clone()) {
                return; // already locally present: idempotent no-op (property 3)
            }
        } else {
            return;
        }

        let set = self.channel_refs.entry(channel.clone()).or_default();
        let first = set.is_empty();
        set.insert(sub);

        if first {
            if let Some(listener) = &self.listener {
                listener.subscribe(channel);
            }
        } else if self.channel_active.contains(&channel)
            && let Some(entry) = self.channel_subs.get(&sub)
        {
            entry.callbacks.on_activation.invoke(channel);
        }
    }

    fn remove_channel(&mut self, sub: SubId, channel: Bytes) {
        if let Some(entry) = self.channel_subs.get_mut(&sub) {
            entry.channels.remove(&channel);
        }
        self.drop_channel_ref(sub, &channel);
    }

    fn drop_channel_ref(&mut self, sub: SubId, channel: &Bytes) {
        let Some(set) = self.channel_refs.get_mut(channel) else { return };
        set.remove(&sub);
        if set.is_empty() {
            self.channel_refs.remove(channel);
            self.channel_active.remove(channel);
            if let Some(listener) = &self.listener {
                listener.unsubscribe(channel.clone());
            }
        }
    }

    fn add_pattern(&mut self, sub: SubId, pattern: Bytes) {
        if self.closed {
            return;
        }
        let set = self.pattern_refs.entry(pattern.clone()).or_default();
        let first = set.is_empty();
        set.insert(sub);

        if first {
            if let Some(listener) = &self.listener {
                listener.psubscribe(pattern);
            }
        } else if self.pattern_active.contains(&pattern)
            && let Some(entry) = self.pattern_subs.get(&sub)
        {
            entry.callbacks.on_activation.invoke(pattern);
        }
    }

    fn drop_pattern_ref(&mut self, sub: SubId, pattern: &Bytes) {
        let Some(set) = self.pattern_refs.get_mut(pattern) else { return };
        set.remove(&sub);
        if set.is_empty() {
            self.pattern_refs.remove(pattern);
            self.pattern_active.remove(pattern);
            if let Some(listener) = &self.listener {
                listener.punsubscribe(pattern.clone());
            }
        }
    }

    fn close_channel_subscription(&mut self, sub: SubId) {
        let Some(entry) = self.channel_subs.remove(&sub) else { return };
        for channel in entry.channels {
            self.drop_channel_ref(sub, &channel);
        }
    }

    fn close_pattern_subscription(&mut self, sub: SubId) {
        let Some(entry) = self.pattern_subs.remove(&sub) else { return };
        self.drop_pattern_ref(sub, &entry.pattern);
    }

    fn handle_connected(&mut self, generation: u64, handle: ListenerHandle) {
        if self.closed || generation != self.generation {
            return; // a newer disconnect/close superseded this attempt
        }
        for channel in self.channel_refs.keys() {
            handle.subscribe(channel.clone());
        }
        for pattern in self.pattern_refs.keys() {
            handle.psubscribe(pattern.clone());
        }
        self.listener = Some(handle);
    }

    fn handle_listener_event(&mut self, tagged: TaggedEvent) {
        if tagged.generation != self.generation {
            return; // stale event from a Listener that has since been replaced
        }
        match tagged.event {
            listener::ListenerEvent::Message { channel, payload } => self.dispatch_message(&channel, payload),
            listener::ListenerEvent::PMessage { pattern, channel, payload } => {
                self.dispatch_pmessage(&pattern, channel, payload);
            }
            listener::ListenerEvent::SubscribeAck { channel } => self.activate_channel(channel),
            listener::ListenerEvent::PSubscribeAck { pattern } => self.activate_pattern(pattern),
            listener::ListenerEvent::UnsubscribeAck { .. } | listener::ListenerEvent::PUnsubscribeAck { .. } => {}
            listener::ListenerEvent::Disconnected { error } => self.handle_disconnect(error),
        }
    }

    fn dispatch_message(&self, channel: &Bytes, payload: Bytes) {
        let Some(subs) = self.channel_refs.get(channel) else { return };
        for sub in subs {
            if let Some(entry) = self.channel_subs.get(sub)
                && entry.channels.contains(channel)
            {
                entry.callbacks.on_message.invoke((channel.clone(), payload.clone()));
            }
        }
    }

    fn dispatch_pmessage(&self, pattern: &Bytes, channel: Bytes, payload: Bytes) {
        let Some(subs) = self.pattern_refs.get(pattern) else { return };
        for sub in subs {
            if let Some(entry) = self.pattern_subs.get(sub) {
                entry.callbacks.on_message.invoke((channel.clone(), payload.clone()));
            }
        }
    }

    fn activate_channel(&mut self, channel: Bytes) {
        let Some(subs) = self.channel_refs.get(&channel) else { return };
        self.channel_active.insert(channel.clone());
        for sub in subs {
            if let Some(entry) = self.channel_subs.get(sub) {
                entry.callbacks.on_activation.invoke(channel.clone());
            }
        }
    }

    fn activate_pattern(&mut self, pattern: Bytes) {
        let Some(subs) = self.pattern_refs.get(&pattern) else { return };
        self.pattern_active.insert(pattern.clone());
        for sub in subs {
            if let Some(entry) = self.pattern_subs.get(sub) {
                entry.callbacks.on_activation.invoke(pattern.clone());
            }
        }
    }

    fn handle_disconnect(&mut self, error: ConnectionError) {
        if self.closed {
            return;
        }
        self.generation += 1;
        self.channel_active.clear();
        self.pattern_active.clear();
        self.listener = None;

        for entry in self.channel_subs.values() {
            entry.callbacks.on_disconnect.invoke(error.clone());
        }
        for entry in self.pattern_subs.values() {
            entry.callbacks.on_disconnect.invoke(error.clone());
        }

        self.begin_connect();
    }

    fn handle_close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.reconnect_flag.store(true, Ordering::SeqCst);
        self.listener = None;

        for (_, entry) in self.channel_subs.drain() {
            entry.callbacks.on_mux_closed.invoke(());
        }
        for (_, entry) in self.pattern_subs.drain() {
            entry.callbacks.on_mux_closed.invoke(());
        }
        self.channel_refs.clear();
        self.pattern_refs.clear();
        self.channel_active.clear();
        self.pattern_active.clear();
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_reconnect(
    target_generation: u64,
    factory: ConnectionFactory,
    backoff_config: BackoffConfig,
    events: mpsc::UnboundedSender<TaggedEvent>,
    commands: mpsc::UnboundedSender<MuxCommand>,
    cancelled: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        let mut backoff = Backoff::new(backoff_config);
        loop {
            if cancelled.load(Ordering::SeqCst) {
                return;
            }
            let client = (factory)();
            match listener::spawn(client, target_generation, events.clone()).await {
                Ok(handle) => {
                    let _ = commands.send(MuxCommand::ListenerConnected {
                        generation: target_generation,
                        handle,
                    });
                    return;
                }
                Err(error) => {
                    tracing::warn!(%error, "redis reconnect attempt failed, backing off");
                    tokio::time::sleep(backoff.next()).await;
                }
            }
        }
    });
}
