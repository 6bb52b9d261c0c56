// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The process-wide coordinator: accepts upgraded sockets, owns the broker
//! and the channel-class registry, and exposes the administrative broadcast
//! and remote-disconnect APIs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use axum::extract::ws::WebSocketUpgrade;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tracing::info;
use url::Url;

use crate::broker::{Broker, SubscriberMap};
use crate::channel::ChannelDescription;
use crate::config::{AuthResult, CableConfig};
use crate::connection::{internal_broadcasting, Connection};
use crate::error::CableError;
use crate::protocol::ServerMessage;
use crate::socket::{Socket, WsSocket};

const SUBPROTOCOL: &str = "actioncable-v1-json";

/// Process-wide pub/sub coordinator.
pub struct Cable {
    config: CableConfig,
    broker: Arc<dyn Broker>,
    connections: Mutex<HashMap<u64, Arc<Connection>>>,
    descriptions: RwLock<HashMap<String, Arc<ChannelDescription>>>,
}

impl Cable {
    /// Build the coordinator and start its broker.
    pub async fn new(config: CableConfig) -> Result<Arc<Self>, CableError> {
        let broker = config
            .broker
            .clone()
            .unwrap_or_else(|| Arc::new(SubscriberMap::new()) as Arc<dyn Broker>);
        broker.set_fanout_concurrency(config.fanout_concurrency);
        broker.run().await?;

        Ok(Arc::new(Self {
            config,
            broker,
            connections: Mutex::new(HashMap::new()),
            descriptions: RwLock::new(HashMap::new()),
        }))
    }

    /// Register a channel class.  Must run before a client can subscribe to
    /// that name.
    ///
    /// # Panics
    ///
    /// Registering an empty or duplicate name is a programming error and
    /// panics immediately.
    pub fn register_channel(&self, description: ChannelDescription) {
        assert!(!description.name.is_empty(), "channel name must not be empty");
        let mut descriptions = self.descriptions.write().unwrap();
        if descriptions.contains_key(&description.name) {
            panic!("the channel {} has already been registered", description.name);
        }
        descriptions.insert(description.name.clone(), Arc::new(description));
    }

    /// Upgrade an HTTP request to a cable connection.
    ///
    /// Enforces the origin allowlist and the `actioncable-v1-json`
    /// subprotocol.  The authenticator runs against the request; on refusal
    /// the upgraded socket receives a `disconnect{reason:"unauthorized"}`
    /// envelope and is closed before any welcome.
    pub async fn handle(self: &Arc<Self>, ws: WebSocketUpgrade, headers: &HeaderMap, uri: &Uri) -> Response {
        if !origin_allowed(&self.config.allowed_origins, headers) {
            info!("websocket origin rejected");
            return StatusCode::FORBIDDEN.into_response();
        }

        let auth = (self.config.authenticator)(headers, uri);
        let cable = Arc::clone(self);

        ws.protocols([SUBPROTOCOL])
            .max_message_size(self.config.max_message_size)
            .write_buffer_size(self.config.write_buffer_size)
            .on_failed_upgrade(|e| info!(err = %e, "websocket upgrade failed"))
            .on_upgrade(move |socket| async move {
                info!("successfully upgraded to websocket");
                let socket: Arc<dyn Socket> = Arc::new(WsSocket::new(socket));
                match auth {
                    AuthResult::Reject => reject_unauthorized(socket.as_ref()).await,
                    AuthResult::Accept(identity) => {
                        let conn = Connection::new(Arc::clone(&cable), identity, socket);
                        cable.add_connection(&conn);
                        conn.setup().await;
                    }
                }
            })
            .into_response()
    }

    /// JSON-encode `message` and publish it to every subscriber of
    /// `(channel_name, broadcasting)` across the federation.
    pub async fn broadcast<T>(
        &self,
        channel_name: &str,
        broadcasting: &str,
        message: &T,
    ) -> Result<(), CableError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let payload = serde_json::to_vec(message)?;
        self.broker.broadcast(channel_name, broadcasting, Bytes::from(payload)).await
    }

    /// Terminate every connection bound to `identity`, on this node and on
    /// every node sharing the broker.
    pub async fn disconnect_remote(&self, identity: &Value) -> Result<(), CableError> {
        let name = internal_broadcasting(identity);
        self.broker
            .broadcast(&name, &name, Bytes::from_static(br#"{"type":"disconnect"}"#))
            .await
    }

    /// Stop the broker, then close every live connection.
    pub async fn stop(&self) {
        self.broker.stop().await;
        let connections: Vec<Arc<Connection>> =
            self.connections.lock().unwrap().values().cloned().collect();
        for conn in connections {
            conn.close("server is shutdown.").await;
        }
    }

    pub(crate) fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub(crate) fn config(&self) -> &CableConfig {
        &self.config
    }

    pub(crate) fn description(&self, name: &str) -> Option<Arc<ChannelDescription>> {
        self.descriptions.read().unwrap().get(name).cloned()
    }

    pub(crate) fn add_connection(&self, conn: &Arc<Connection>) {
        self.connections.lock().unwrap().insert(conn.id(), Arc::clone(conn));
    }

    pub(crate) fn remove_connection(&self, id: u64) {
        self.connections.lock().unwrap().remove(&id);
    }

    #[cfg(test)]
    pub(crate) fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }
}

/// Refuse a socket that failed authentication.
pub(crate) async fn reject_unauthorized(socket: &dyn Socket) {
    info!("an unauthorized connection attempt was rejected");
    let farewell = ServerMessage::disconnect("unauthorized", false);
    if let Ok(text) = serde_json::to_string(&farewell) {
        let _ = socket.send(text).await;
    }
    socket.close().await;
}

/// Check the Origin header against the allowlist.  An empty allowlist
/// permits every origin; `*suffix` entries match any host ending in the
/// suffix; other entries must match `host[:port]` exactly.  The origin input
/// is compared case-insensitively.
pub(crate) fn origin_allowed(allowed: &[String], headers: &HeaderMap) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let origin = origin.to_ascii_lowercase();
    let Ok(parsed) = Url::parse(&origin) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let host = match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    };

    allowed.iter().any(|entry| match entry.strip_prefix('*') {
        Some(suffix) => host.ends_with(suffix),
        None => host == *entry,
    })
}

#[cfg(test)]
#[path = "cable_tests.rs"]
mod tests;
