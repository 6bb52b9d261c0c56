// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cable configuration.
//!
//! A plain builder struct: start from [`CableConfig::default`] and chain
//! `with_*` calls.  The demo binary maps a clap surface onto this.

use std::any::Any;
use std::sync::Arc;

use axum::http::{HeaderMap, Uri};
use serde_json::Value;
use tracing::error;

use crate::broker::Broker;
use crate::connection::Connection;

/// Outcome of authenticating an upgrade request.
#[derive(Debug, Clone)]
pub enum AuthResult {
    /// Accept the connection, optionally binding an identity used to target
    /// it for remote disconnects.
    Accept(Option<Value>),
    /// Refuse: the client receives `disconnect{reason:"unauthorized"}` and
    /// the socket is closed before any welcome.
    Reject,
}

/// Extracts an identity from the upgrade request.
pub type Authenticator = Arc<dyn Fn(&HeaderMap, &Uri) -> AuthResult + Send + Sync>;

/// Handles a panic recovered from a command dispatch.
pub type Rescuer = Arc<dyn Fn(Arc<Connection>, Box<dyn Any + Send>) + Send + Sync>;

/// Best-effort extraction of a panic payload's message.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Configuration for a [`Cable`](crate::Cable).
#[derive(Clone)]
pub struct CableConfig {
    /// Origin allowlist.  Empty permits every origin; entries starting with
    /// `*` match any host ending in the remainder.
    pub allowed_origins: Vec<String>,
    /// Inbound frame cap in bytes.
    pub max_message_size: usize,
    /// WebSocket write buffer size in bytes.
    pub write_buffer_size: usize,
    /// Broker fan-out worker count.
    pub fanout_concurrency: usize,
    pub(crate) authenticator: Authenticator,
    pub(crate) rescuer: Rescuer,
    pub(crate) broker: Option<Arc<dyn Broker>>,
}

impl Default for CableConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            max_message_size: 65535,
            write_buffer_size: 4096,
            fanout_concurrency: 100,
            authenticator: Arc::new(|_, _| AuthResult::Accept(None)),
            rescuer: Arc::new(default_rescue),
            broker: None,
        }
    }
}

impl CableConfig {
    pub fn with_allowed_origins(mut self, origins: impl IntoIterator<Item = String>) -> Self {
        self.allowed_origins = origins.into_iter().collect();
        self
    }

    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    pub fn with_write_buffer_size(mut self, bytes: usize) -> Self {
        self.write_buffer_size = bytes;
        self
    }

    pub fn with_fanout_concurrency(mut self, workers: usize) -> Self {
        self.fanout_concurrency = workers;
        self
    }

    /// Set the authentication function.  It may read cookies or query
    /// parameters from the upgrade request; the identity it returns is
    /// exposed on the connection and on every channel of that connection.
    pub fn with_authenticator<F>(mut self, authenticator: F) -> Self
    where
        F: Fn(&HeaderMap, &Uri) -> AuthResult + Send + Sync + 'static,
    {
        self.authenticator = Arc::new(authenticator);
        self
    }

    /// Set the panic policy for channel hooks.
    pub fn with_rescuer<F>(mut self, rescuer: F) -> Self
    where
        F: Fn(Arc<Connection>, Box<dyn Any + Send>) + Send + Sync + 'static,
    {
        self.rescuer = Arc::new(rescuer);
        self
    }

    /// Use a specific broker instead of the default in-process
    /// [`SubscriberMap`](crate::SubscriberMap).
    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }
}

/// Default rescuer: log the panic and close the connection.
fn default_rescue(conn: Arc<Connection>, payload: Box<dyn Any + Send>) {
    error!(message = panic_message(payload.as_ref()), "panic in channel hook");
    tokio::spawn(async move { conn.close("internal server error").await });
}
