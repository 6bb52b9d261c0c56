// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-WebSocket connection: a reader task turning frames into commands, a
//! writer task serializing outbound envelopes, a heartbeat, and the map of
//! channels multiplexed over the socket.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::broker::Broker;
use crate::cable::Cable;
use crate::channel::{Channel, ChannelDescription};
use crate::protocol::{Command, ServerMessage};
use crate::socket::Socket;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Broadcasting name of a connection's hidden internal channel.
pub(crate) fn internal_broadcasting(identity: &Value) -> String {
    format!("action_cable/{}", identity_string(identity))
}

/// String identities print bare; other JSON values print in their compact
/// form.
fn identity_string(identity: &Value) -> String {
    match identity {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

struct ConnectionState {
    // Monotonic: a closed connection never reopens and accepts no channels.
    closed: bool,
    initialized: bool,
    /// Channel name -> subscription identifier -> channel.
    channels: HashMap<String, HashMap<String, Arc<Channel>>>,
    internal: Option<Arc<Channel>>,
}

/// One accepted WebSocket.
pub struct Connection {
    id: u64,
    identity: Option<Value>,
    cable: Arc<Cable>,
    socket: Arc<dyn Socket>,
    send_tx: mpsc::UnboundedSender<ServerMessage>,
    send_rx: Mutex<Option<mpsc::UnboundedReceiver<ServerMessage>>>,
    done: CancellationToken,
    state: Mutex<ConnectionState>,
}

impl Connection {
    pub(crate) fn new(
        cable: Arc<Cable>,
        identity: Option<Value>,
        socket: Arc<dyn Socket>,
    ) -> Arc<Self> {
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            identity,
            cable,
            socket,
            send_tx,
            send_rx: Mutex::new(Some(send_rx)),
            done: CancellationToken::new(),
            state: Mutex::new(ConnectionState {
                closed: false,
                initialized: false,
                channels: HashMap::new(),
                internal: None,
            }),
        })
    }

    /// Identity bound by the authenticator, if any.
    pub fn identity(&self) -> Option<&Value> {
        self.identity.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn broker(&self) -> &Arc<dyn Broker> {
        self.cable.broker()
    }

    /// Idempotent startup: spawn the writer, reader, and heartbeat tasks,
    /// enqueue the welcome frame, and register the internal channel.
    pub async fn setup(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            if state.initialized {
                return;
            }
            state.initialized = true;
        }

        if let Some(receiver) = self.send_rx.lock().unwrap().take() {
            tokio::spawn(write_loop(Arc::clone(&self.socket), receiver, self.done.clone()));
        }
        // Welcome goes on the pipe before the reader can accept any command,
        // so it is always the first frame on the wire.
        self.enqueue(ServerMessage::welcome());
        tokio::spawn(Arc::clone(self).read_loop());

        self.subscribe_internal_channel().await;
        self.spawn_heartbeat();
    }

    /// Enqueue an outbound envelope.  The writer task serializes emission in
    /// enqueue order; after close the envelope is silently dropped.
    pub(crate) fn enqueue(&self, message: ServerMessage) {
        let _ = self.send_tx.send(message);
    }

    /// Tear the connection down.  Idempotent: the first caller wins.
    pub async fn close(self: &Arc<Self>, reason: &str) {
        debug!(reason, "closing connection");
        let (channels, internal) = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                debug!("the connection has already been closed");
                return;
            }
            state.closed = true;
            (std::mem::take(&mut state.channels), state.internal.take())
        };

        self.cable.remove_connection(self.id);

        for per_name in channels.into_values() {
            for channel in per_name.into_values() {
                channel.unsubscribe().await;
            }
        }
        if let Some(internal) = internal {
            internal.unsubscribe().await;
        }

        self.done.cancel();

        let farewell = ServerMessage::disconnect(reason, false);
        if let Ok(text) = serde_json::to_string(&farewell) {
            let _ = self.socket.send(text).await;
        }
        self.socket.close().await;
    }

    async fn read_loop(self: Arc<Self>) {
        loop {
            let frame = tokio::select! {
                _ = self.done.cancelled() => return,
                frame = self.socket.recv() => frame,
            };
            let Some(text) = frame else {
                self.close("close by client.").await;
                return;
            };

            let cmd: Command = match serde_json::from_str(&text) {
                Ok(cmd) => cmd,
                Err(e) => {
                    error!(frame = %text, err = %e, "cannot decode inbound frame");
                    continue;
                }
            };

            let dispatch = AssertUnwindSafe(self.execute_command(cmd)).catch_unwind();
            if let Err(payload) = dispatch.await {
                (self.cable.config().rescuer)(Arc::clone(&self), payload);
            }
        }
    }

    async fn execute_command(self: &Arc<Self>, cmd: Command) {
        debug!(command = %cmd.command, identifier = %cmd.identifier, "received command");

        #[derive(Deserialize)]
        struct ChannelKey {
            #[serde(default)]
            channel: String,
        }

        let key: ChannelKey = match serde_json::from_str(&cmd.identifier) {
            Ok(key) => key,
            Err(e) => {
                error!(identifier = %cmd.identifier, err = %e, "cannot decode identifier");
                return;
            }
        };
        if key.channel.is_empty() {
            error!(identifier = %cmd.identifier, "identifier names no channel");
            return;
        }

        match cmd.command.as_str() {
            "subscribe" => self.add_subscription(&key.channel, cmd.identifier).await,
            "unsubscribe" => self.remove_subscription(&key.channel, &cmd.identifier).await,
            "message" => self.perform_action(&key.channel, &cmd.identifier, cmd.data).await,
            other => error!(command = other, "received unrecognized command"),
        }
    }

    async fn add_subscription(self: &Arc<Self>, channel_name: &str, identifier: String) {
        let Some(description) = self.cable.description(channel_name) else {
            error!(channel = channel_name, "subscribe failed: channel not registered");
            return;
        };

        let params = serde_json::from_str(&identifier).unwrap_or(Value::Null);
        let channel = Channel::new(
            self,
            identifier,
            params,
            description,
            false,
            Box::new(|channel, payload| match serde_json::from_slice::<Value>(&payload) {
                Ok(message) => channel.transmit(message),
                Err(e) => error!(err = %e, "cannot decode broadcast payload"),
            }),
        );
        channel.subscribe().await;
    }

    async fn remove_subscription(&self, channel_name: &str, identifier: &str) {
        if let Some(channel) = self.find_channel(channel_name, identifier) {
            debug!(identifier = %channel.identifier(), "unsubscribing from channel");
            channel.unsubscribe().await;
        }
    }

    async fn perform_action(&self, channel_name: &str, identifier: &str, data: String) {
        let Some(channel) = self.find_channel(channel_name, identifier) else {
            error!(channel = channel_name, "perform failed: channel not found");
            return;
        };
        channel.perform(data).await;
    }

    pub(crate) fn find_channel(&self, channel_name: &str, identifier: &str) -> Option<Arc<Channel>> {
        let state = self.state.lock().unwrap();
        state.channels.get(channel_name).and_then(|per_name| per_name.get(identifier)).cloned()
    }

    /// Install a confirmed channel.  Returns false when the connection
    /// already closed, in which case the caller must tear the channel down.
    pub(crate) fn install_channel(&self, channel: &Arc<Channel>) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return false;
        }
        state
            .channels
            .entry(channel.name().to_owned())
            .or_default()
            .insert(channel.identifier().to_owned(), Arc::clone(channel));
        true
    }

    /// Detach a channel from the map.  Absence is not an error: close and
    /// unsubscribe may race, and rejected channels were never installed.
    pub(crate) fn remove_channel(&self, channel: &Channel) {
        let mut state = self.state.lock().unwrap();
        if let Some(per_name) = state.channels.get_mut(channel.name()) {
            if per_name.get(channel.identifier()).is_some_and(|c| c.key() == channel.key()) {
                per_name.remove(channel.identifier());
            }
            if per_name.is_empty() {
                state.channels.remove(channel.name());
            }
        }
    }

    /// Subscribe the hidden channel that listens for administrative
    /// disconnects addressed to this connection's identity.
    async fn subscribe_internal_channel(self: &Arc<Self>) {
        let Some(identity) = &self.identity else {
            return;
        };
        if self.state.lock().unwrap().internal.is_some() {
            return;
        }

        let broadcasting = internal_broadcasting(identity);
        let description = Arc::new(ChannelDescription::new(broadcasting.clone()));
        let channel = Channel::new(
            self,
            broadcasting.clone(),
            Value::Null,
            description,
            true,
            Box::new(|channel, payload| {
                #[derive(Deserialize)]
                struct Probe {
                    #[serde(default)]
                    r#type: String,
                }
                let probe: Probe = match serde_json::from_slice(&payload) {
                    Ok(probe) => probe,
                    Err(e) => {
                        error!(err = %e, "cannot decode internal message");
                        return;
                    }
                };
                if probe.r#type == "disconnect" {
                    if let Some(conn) = channel.connection() {
                        info!(identity = %conn.identity_display(), "removing connection");
                        tokio::spawn(async move { conn.close("close by remote.").await });
                    }
                }
            }),
        );

        if let Err(e) = self.broker().subscribe(Arc::clone(&channel), &broadcasting).await {
            error!(err = %e, "internal channel subscription failed");
            return;
        }

        self.state.lock().unwrap().internal = Some(channel);
        info!(identity = %self.identity_display(), "registered connection");
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let conn = Arc::downgrade(self);
        let done = self.done.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = done.cancelled() => return,
                    _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
                }
                let Some(conn) = conn.upgrade() else { return };
                conn.enqueue(ServerMessage::ping());
            }
        });
    }

    fn identity_display(&self) -> String {
        self.identity.as_ref().map(identity_string).unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn is_initialized(&self) -> bool {
        self.state.lock().unwrap().initialized
    }

    #[cfg(test)]
    pub(crate) fn channel_count(&self) -> usize {
        self.state.lock().unwrap().channels.values().map(HashMap::len).sum()
    }

    #[cfg(test)]
    pub(crate) fn has_channel(&self, channel_name: &str, identifier: &str) -> bool {
        self.find_channel(channel_name, identifier).is_some()
    }
}

/// Writer task: drain the send pipe onto the socket, one JSON text frame per
/// envelope, until the done signal.  Write failures are logged and the loop
/// continues; the reader's next failure terminates the connection.
async fn write_loop(
    socket: Arc<dyn Socket>,
    mut receiver: mpsc::UnboundedReceiver<ServerMessage>,
    done: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = done.cancelled() => return,
            message = receiver.recv() => message,
        };
        let Some(message) = message else { return };
        match serde_json::to_string(&message) {
            Ok(text) => {
                if let Err(e) = socket.send(text).await {
                    error!(err = %e, "write message failed");
                }
            }
            Err(e) => error!(err = %e, "cannot encode outbound frame"),
        }
    }
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;
