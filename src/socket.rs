// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Transport abstraction between a connection and its WebSocket.
//!
//! The connection state machine only needs to write text frames, read text
//! frames, and close.  Keeping that surface behind a trait lets the lifecycle
//! tests drive a connection without a network; [`WsSocket`] is the production
//! adapter over an upgraded axum WebSocket.

use std::fmt;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;

/// A failed frame write.
#[derive(Debug)]
pub struct SocketError(pub String);

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for SocketError {}

/// Text-frame transport under a connection.
#[async_trait]
pub trait Socket: Send + Sync {
    /// Write one text frame.
    async fn send(&self, frame: String) -> Result<(), SocketError>;

    /// Read the next text frame.  Returns `None` when the peer closed the
    /// socket or the read failed; either way the connection is over.
    async fn recv(&self) -> Option<String>;

    /// Close the underlying transport.
    async fn close(&self);
}

/// Production [`Socket`] over an upgraded axum WebSocket.
pub struct WsSocket {
    writer: Mutex<SplitSink<WebSocket, Message>>,
    reader: Mutex<SplitStream<WebSocket>>,
}

impl WsSocket {
    pub fn new(socket: WebSocket) -> Self {
        let (writer, reader) = socket.split();
        Self { writer: Mutex::new(writer), reader: Mutex::new(reader) }
    }
}

#[async_trait]
impl Socket for WsSocket {
    async fn send(&self, frame: String) -> Result<(), SocketError> {
        self.writer
            .lock()
            .await
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| SocketError(e.to_string()))
    }

    async fn recv(&self) -> Option<String> {
        let mut reader = self.reader.lock().await;
        loop {
            match reader.next().await {
                Some(Ok(Message::Text(text))) => return Some(text.to_string()),
                Some(Ok(Message::Close(_))) | None => return None,
                // Ping/pong are answered by the protocol layer; binary frames
                // are not part of the subprotocol.
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::debug!(err = %e, "websocket read failed");
                    return None;
                }
            }
        }
    }

    async fn close(&self) {
        let _ = self.writer.lock().await.close().await;
    }
}
