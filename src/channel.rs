// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Channels: the unit of grouping behaviour on one WebSocket connection.
//!
//! A channel binds a client-side subscription identifier (the JSON object
//! string `{"channel":"RoomChannel","id":1}`) to a registered
//! [`ChannelDescription`] and to the set of broadcastings it streams from.
//! One channel exists per (connection, identifier) pair.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error};

use crate::broker::Broker;
use crate::connection::Connection;
use crate::error::CableError;
use crate::protocol::{ChannelMessage, ControlFrame};

static NEXT_CHANNEL_KEY: AtomicU64 = AtomicU64::new(1);

/// Async hook invoked on subscribe and unsubscribe.
pub type LifecycleHook = Arc<dyn Fn(Arc<Channel>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Async hook invoked for every `message` command; receives the raw `data`
/// string whose contents are opaque to the framework.
pub type ActionHook = Arc<dyn Fn(Arc<Channel>, String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Per-subscription delivery callback installed at construction time.
pub(crate) type DeliveryFn = Box<dyn Fn(Arc<Channel>, Bytes) + Send + Sync>;

/// A registered channel class: a unique name plus its lifecycle hooks.
/// Missing hooks default to no-ops.  Registered before the first connection
/// and never removed.
pub struct ChannelDescription {
    pub name: String,
    pub(crate) subscribed: Option<LifecycleHook>,
    pub(crate) unsubscribed: Option<LifecycleHook>,
    pub(crate) perform_action: Option<ActionHook>,
}

impl ChannelDescription {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), subscribed: None, unsubscribed: None, perform_action: None }
    }

    /// Hook run when a client subscribes.  It may call
    /// [`Channel::stream_from`] or [`Channel::reject`].
    pub fn on_subscribed<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<Channel>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.subscribed = Some(Arc::new(move |ch| hook(ch).boxed()));
        self
    }

    /// Hook run when the subscription is torn down.
    pub fn on_unsubscribed<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<Channel>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.unsubscribed = Some(Arc::new(move |ch| hook(ch).boxed()));
        self
    }

    /// Hook run for every `message` command on this channel.
    pub fn on_perform_action<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<Channel>, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.perform_action = Some(Arc::new(move |ch, data| hook(ch, data).boxed()));
        self
    }
}

#[derive(Default)]
struct ChannelState {
    streams: HashSet<String>,
    // Both flags are monotonic.
    rejected: bool,
    confirmed: bool,
}

/// One subscription on one connection.
pub struct Channel {
    key: u64,
    name: String,
    identifier: String,
    params: Value,
    conn_identity: Option<Value>,
    conn: Weak<Connection>,
    broker: Arc<dyn Broker>,
    description: Arc<ChannelDescription>,
    on_broadcast: DeliveryFn,
    is_internal: bool,
    state: Mutex<ChannelState>,
}

impl Channel {
    pub(crate) fn new(
        conn: &Arc<Connection>,
        identifier: String,
        params: Value,
        description: Arc<ChannelDescription>,
        is_internal: bool,
        on_broadcast: DeliveryFn,
    ) -> Arc<Self> {
        Arc::new(Self {
            key: NEXT_CHANNEL_KEY.fetch_add(1, Ordering::Relaxed),
            name: description.name.clone(),
            identifier,
            params,
            conn_identity: conn.identity().cloned(),
            conn: Arc::downgrade(conn),
            broker: Arc::clone(conn.broker()),
            description,
            on_broadcast,
            is_internal,
            state: Mutex::new(ChannelState::default()),
        })
    }

    /// Channel class name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The identifier string supplied by the client, echoed verbatim on
    /// every frame for this subscription.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// The identifier parsed as JSON; carries the client-supplied params.
    pub fn params(&self) -> &Value {
        &self.params
    }

    /// Identity the authenticator bound to the owning connection.
    pub fn connection_identity(&self) -> Option<&Value> {
        self.conn_identity.as_ref()
    }

    pub fn is_rejected(&self) -> bool {
        self.state.lock().unwrap().rejected
    }

    pub(crate) fn key(&self) -> u64 {
        self.key
    }

    pub(crate) fn connection(&self) -> Option<Arc<Connection>> {
        self.conn.upgrade()
    }

    /// Start streaming from the named broadcasting.  No-op on a rejected
    /// subscription; emits the confirmation once the broker registration
    /// succeeds.
    pub async fn stream_from(self: &Arc<Self>, broadcasting: &str) {
        if self.state.lock().unwrap().rejected {
            return;
        }

        if let Err(e) = self.broker.subscribe(Arc::clone(self), broadcasting).await {
            error!(broadcasting, err = %e, "stream subscription failed");
            return;
        }

        debug!(channel = %self.name, broadcasting, "streaming");
        self.state.lock().unwrap().streams.insert(broadcasting.to_owned());
        self.transmit_confirmation();
    }

    /// Stop streaming from the named broadcasting.
    pub async fn stop_stream_from(&self, broadcasting: &str) {
        self.state.lock().unwrap().streams.remove(broadcasting);
        if let Err(e) = self.broker.unsubscribe(self, broadcasting).await {
            error!(broadcasting, err = %e, "stream unsubscribe failed");
        }
    }

    /// Stop every stream of this channel.
    pub async fn stop_all_streams(&self) {
        for broadcasting in self.stream_snapshot() {
            self.stop_stream_from(&broadcasting).await;
        }
    }

    /// JSON-encode `message` and publish it under this channel's name.
    pub async fn broadcast<T>(&self, broadcasting: &str, message: &T) -> Result<(), CableError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let payload = serde_json::to_vec(message)?;
        self.broker.broadcast(&self.name, broadcasting, Bytes::from(payload)).await
    }

    /// Enqueue `message` to this subscription's client, wrapped in the
    /// identifier envelope.
    pub fn transmit(&self, message: Value) {
        if let Some(conn) = self.conn.upgrade() {
            conn.enqueue(
                ChannelMessage { identifier: self.identifier.clone(), message }.into(),
            );
        }
    }

    /// Refuse this subscription.  Intended from within the subscribed hook;
    /// afterwards `stream_from` and action dispatch are no-ops.
    pub fn reject(&self) {
        self.state.lock().unwrap().rejected = true;
    }

    /// Run the subscribe flow: subscribed hook, then reject or
    /// confirm-and-install.
    pub(crate) async fn subscribe(self: &Arc<Self>) {
        if let Some(hook) = &self.description.subscribed {
            hook(Arc::clone(self)).await;
        }

        if self.state.lock().unwrap().rejected {
            self.reject_subscription().await;
            return;
        }

        self.transmit_confirmation();

        if let Some(conn) = self.conn.upgrade() {
            if !conn.install_channel(self) {
                // The connection closed while the hook ran; tear back down.
                self.unsubscribe().await;
            }
        }
    }

    /// Detach from the connection, drop every stream at the broker, and run
    /// the unsubscribed hook.  Safe to call repeatedly.
    pub(crate) async fn unsubscribe(self: &Arc<Self>) {
        if !self.is_internal {
            if let Some(conn) = self.conn.upgrade() {
                conn.remove_channel(self);
            }
        }

        let streams = {
            let mut state = self.state.lock().unwrap();
            std::mem::take(&mut state.streams)
        };
        for broadcasting in streams {
            if let Err(e) = self.broker.unsubscribe(self, &broadcasting).await {
                error!(broadcasting, err = %e, "stream unsubscribe failed");
            }
        }

        if let Some(hook) = &self.description.unsubscribed {
            hook(Arc::clone(self)).await;
        }
    }

    pub(crate) async fn perform(self: &Arc<Self>, data: String) {
        if self.state.lock().unwrap().rejected {
            return;
        }
        if let Some(hook) = &self.description.perform_action {
            hook(Arc::clone(self), data).await;
        }
    }

    /// Invoke the delivery callback with a broadcast payload.
    pub(crate) fn deliver(self: &Arc<Self>, payload: Bytes) {
        (self.on_broadcast)(Arc::clone(self), payload);
    }

    async fn reject_subscription(self: &Arc<Self>) {
        // Clean up any streams the hook raced in despite the rejection flag.
        self.unsubscribe().await;
        debug!(channel = %self.name, "transmitting the subscription rejection");
        self.enqueue(ControlFrame::RejectSubscription { identifier: self.identifier.clone() });
    }

    /// Emit `confirm_subscription` at most once per channel.
    fn transmit_confirmation(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.confirmed {
                return;
            }
            state.confirmed = true;
        }
        debug!(channel = %self.name, "transmitting the subscription confirmation");
        self.enqueue(ControlFrame::ConfirmSubscription { identifier: self.identifier.clone() });
    }

    fn enqueue(&self, frame: ControlFrame) {
        if let Some(conn) = self.conn.upgrade() {
            conn.enqueue(frame.into());
        }
    }

    fn stream_snapshot(&self) -> Vec<String> {
        self.state.lock().unwrap().streams.iter().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn streams(&self) -> Vec<String> {
        self.stream_snapshot()
    }
}

#[cfg(test)]
#[path = "channel_tests.rs"]
mod tests;
