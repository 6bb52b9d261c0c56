// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared fixtures for the lifecycle tests: an in-memory socket, cable and
//! connection factories, and a polling helper for cross-task assertions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cable::Cable;
use crate::channel::{Channel, ChannelDescription};
use crate::config::CableConfig;
use crate::connection::Connection;
use crate::socket::{Socket, SocketError};

/// In-memory [`Socket`]: frames the test writes appear on the connection's
/// reader; frames the connection sends are recorded as parsed JSON.
pub struct TestSocket {
    incoming_tx: mpsc::UnboundedSender<String>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    sent: Mutex<Vec<Value>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl TestSocket {
    pub fn new() -> Arc<Self> {
        let (incoming_tx, incoming) = mpsc::unbounded_channel();
        Arc::new(Self {
            incoming_tx,
            incoming: tokio::sync::Mutex::new(incoming),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    /// Deliver a frame to the connection's reader and give its tasks a
    /// moment to process it.
    pub async fn client_send(&self, frame: &str) {
        let _ = self.incoming_tx.send(frame.to_owned());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    /// Simulate the client dropping the socket: the next read fails.
    pub fn client_close(&self) {
        self.shutdown.cancel();
    }

    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().unwrap().clone()
    }

    pub fn last_sent(&self) -> Option<Value> {
        self.sent.lock().unwrap().last().cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Socket for TestSocket {
    async fn send(&self, frame: String) -> Result<(), SocketError> {
        let value: Value =
            serde_json::from_str(&frame).map_err(|e| SocketError(e.to_string()))?;
        self.sent.lock().unwrap().push(value);
        Ok(())
    }

    async fn recv(&self) -> Option<String> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            _ = self.shutdown.cancelled() => None,
            frame = incoming.recv() => frame,
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.cancel();
    }
}

/// A cable on the default in-process broker with a small worker pool.
pub async fn test_cable() -> Arc<Cable> {
    Cable::new(CableConfig::default().with_fanout_concurrency(4))
        .await
        .expect("test cable should start")
}

/// A registered connection over a [`TestSocket`], not yet set up.
pub fn test_connection(
    cable: &Arc<Cable>,
    identity: Option<Value>,
) -> (Arc<Connection>, Arc<TestSocket>) {
    let socket = TestSocket::new();
    let conn = Connection::new(Arc::clone(cable), identity, socket.clone());
    cable.add_connection(&conn);
    (conn, socket)
}

/// A channel that records every delivered payload.
pub fn probe_channel(
    conn: &Arc<Connection>,
    name: &str,
    identifier: &str,
) -> (Arc<Channel>, Arc<Mutex<Vec<Bytes>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let channel = Channel::new(
        conn,
        identifier.to_owned(),
        serde_json::from_str(identifier).unwrap_or(Value::Null),
        Arc::new(ChannelDescription::new(name)),
        false,
        Box::new(move |_, payload| sink.lock().unwrap().push(payload)),
    );
    (channel, received)
}

/// Poll `predicate` until it holds or two seconds elapse.
pub async fn eventually(predicate: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}
