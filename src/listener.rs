//! Owns one Redis connection; issues (P)SUBSCRIBE/(P)UNSUBSCRIBE and
//! classifies inbound frames for the Multiplexer.
//!
//! Built on a RESP3 multiplexed connection from the `redis` crate with a
//! registered push sink, so ordinary subscribe/unsubscribe acknowledgements
//! and asynchronous `message`/`pmessage` frames share one connection and are
//! told apart by `redis::PushKind`.

use bytes::Bytes;
use redis::aio::MultiplexedConnection;
use redis::{PushInfo, PushKind, Value};
use tokio::sync::mpsc;

use crate::error::ConnectionError;

/// A frame surfaced by the Listener, tagged with the connection generation
/// it was observed on so the Multiplexer can discard stale events from a
/// Listener that has since been replaced.
#[derive(Debug, Clone)]
pub(crate) struct TaggedEvent {
    pub generation: u64,
    pub event: ListenerEvent,
}

#[derive(Debug, Clone)]
pub(crate) enum ListenerEvent {
    Message { channel: Bytes, payload: Bytes },
    PMessage { pattern: Bytes, channel: Bytes, payload: Bytes },
    SubscribeAck { channel: Bytes },
    PSubscribeAck { pattern: Bytes },
    UnsubscribeAck { channel: Bytes },
    PUnsubscribeAck { pattern: Bytes },
    /// Reported exactly once; the Listener is terminal afterwards.
    Disconnected { error: ConnectionError },
}

#[derive(Debug)]
enum ListenerCommand {
    Subscribe(Bytes),
    Unsubscribe(Bytes),
    PSubscribe(Bytes),
    PUnsubscribe(Bytes),
}

/// A lightweight, cloneable handle to a running Listener task.
#[derive(Debug, Clone)]
pub(crate) struct ListenerHandle {
    commands: mpsc::UnboundedSender<ListenerCommand>,
}

impl ListenerHandle {
    /// Enqueues the command and returns immediately; the ack arrives later
    /// as a [`ListenerEvent`] on the Multiplexer's event channel.
    pub fn subscribe(&self, channel: Bytes) {
        let _ = self.commands.send(ListenerCommand::Subscribe(channel));
    }

    pub fn unsubscribe(&self, channel: Bytes) {
        let _ = self.commands.send(ListenerCommand::Unsubscribe(channel));
    }

    pub fn psubscribe(&self, pattern: Bytes) {
        let _ = self.commands.send(ListenerCommand::PSubscribe(pattern));
    }

    pub fn punsubscribe(&self, pattern: Bytes) {
        let _ = self.commands.send(ListenerCommand::PUnsubscribe(pattern));
    }
}

/// Connects to Redis and spawns the Listener's command/read loop. Returns
/// once the connection is established; a failure here is what drives the
/// Multiplexer's reconnect backoff.
pub(crate) async fn spawn(
    client: redis::Client,
    generation: u64,
    events: mpsc::UnboundedSender<TaggedEvent>,
) -> Result<ListenerHandle, ConnectionError> {
    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| ConnectionError::Redis(e.to_string()))?;

    let (push_tx, push_rx) = mpsc::unbounded_channel();
    conn.set_push_manager(redis::PushManager::new(push_tx));

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    tokio::spawn(run(conn, generation, cmd_rx, push_rx, events));

    Ok(ListenerHandle { commands: cmd_tx })
}

async fn run(
    mut conn: MultiplexedConnection,
    generation: u64,
    mut commands: mpsc::UnboundedReceiver<ListenerCommand>,
    mut pushes: mpsc::UnboundedReceiver<PushInfo>,
    events: mpsc::UnboundedSender<TaggedEvent>,
) {
    loop {
        tokio::select! {
            biased;

            push = pushes.recv() => {
                match push {
                    Some(push) => {
                        if let Some(event) = classify(push)
                            && events.send(TaggedEvent { generation, event }).is_err()
                        {
                            return;
                        }
                    }
                    None => {
                        report_disconnect(&events, generation, "push channel closed");
                        return;
                    }
                }
            }

            cmd = commands.recv() => {
                match cmd {
                    Some(cmd) => {
                        if let Err(e) = run_command(&mut conn, cmd).await {
                            report_disconnect(&events, generation, &e.to_string());
                            return;
                        }
                    }
                    None => return, // all handles dropped; nothing left to serve
                }
            }
        }
    }
}

async fn run_command(conn: &mut MultiplexedConnection, cmd: ListenerCommand) -> redis::RedisResult<()> {
    match cmd {
        ListenerCommand::Subscribe(channel) => {
            redis::cmd("SUBSCRIBE").arg(&channel[..]).query_async::<()>(conn).await
        }
        ListenerCommand::Unsubscribe(channel) => {
            redis::cmd("UNSUBSCRIBE").arg(&channel[..]).query_async::<()>(conn).await
        }
        ListenerCommand::PSubscribe(pattern) => {
            redis::cmd("PSUBSCRIBE").arg(&pattern[..]).query_async::<()>(conn).await
        }
        ListenerCommand::PUnsubscribe(pattern) => {
            redis::cmd("PUNSUBSCRIBE").arg(&pattern[..]).query_async::<()>(conn).await
        }
    }
}

fn classify(push: PushInfo) -> Option<ListenerEvent> {
    let mut data = push.data.into_iter();
    match push.kind {
        PushKind::Message => Some(ListenerEvent::Message {
            channel: bytes_arg(data.next()?)?,
            payload: bytes_arg(data.next()?)?,
        }),
        PushKind::PMessage => Some(ListenerEvent::PMessage {
            pattern: bytes_arg(data.next()?)?,
            channel: bytes_arg(data.next()?)?,
            payload: bytes_arg(data.next()?)?,
        }),
        PushKind::Subscribe => Some(ListenerEvent::SubscribeAck {
            channel: bytes_arg(data.next()?)?,
        }),
        PushKind::PSubscribe => Some(ListenerEvent::PSubscribeAck {
            pattern: bytes_arg(data.next()?)?,
        }),
        PushKind::Unsubscribe => Some(ListenerEvent::UnsubscribeAck {
            channel: bytes_arg(data.next()?)?,
        }),
        PushKind::PUnsubscribe => Some(ListenerEvent::PUnsubscribeAck {
            pattern: bytes_arg(data.next()?)?,
        }),
        _ => None,
    }
}

fn bytes_arg(value: Value) -> Option<Bytes> {
    match value {
        Value::BulkString(bytes) => Some(Bytes::from(bytes)),
        _ => None,
    }
}

fn report_disconnect(events: &mpsc::UnboundedSender<TaggedEvent>, generation: u64, message: &str) {
    let _ = events.send(TaggedEvent {
        generation,
        event: ListenerEvent::Disconnected {
            error: ConnectionError::Redis(message.to_string()),
        },
    });
}
