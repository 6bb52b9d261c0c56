// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire-format types for the Action Cable v1 JSON subprotocol.
//!
//! Server-to-client control frames are internally tagged
//! (`{"type": "welcome", ...}`); channel payload frames carry no tag and are
//! keyed by the subscription identifier alone.  The identifier string a
//! client supplies is echoed back byte-for-byte so the client can key its
//! subscription table.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Server -> Client
// ---------------------------------------------------------------------------

/// Tagged control frames sent from the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// First frame on every accepted connection.
    Welcome,

    /// Heartbeat carrying the current wall clock in unix seconds.
    Ping { message: i64 },

    /// Final frame before the socket closes.
    Disconnect { reason: String, reconnect: bool },

    /// A subscription was accepted.
    ConfirmSubscription { identifier: String },

    /// A subscription was refused by the channel's subscribed hook.
    RejectSubscription { identifier: String },
}

/// A broadcast payload addressed to one subscription.  Unlike control
/// frames this shape carries no `type` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub identifier: String,
    pub message: Value,
}

/// Any frame the server can emit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Control(ControlFrame),
    Message(ChannelMessage),
}

impl ServerMessage {
    pub fn welcome() -> Self {
        Self::Control(ControlFrame::Welcome)
    }

    pub fn ping() -> Self {
        Self::Control(ControlFrame::Ping { message: unix_seconds() })
    }

    pub fn disconnect(reason: impl Into<String>, reconnect: bool) -> Self {
        Self::Control(ControlFrame::Disconnect { reason: reason.into(), reconnect })
    }
}

impl From<ControlFrame> for ServerMessage {
    fn from(frame: ControlFrame) -> Self {
        Self::Control(frame)
    }
}

impl From<ChannelMessage> for ServerMessage {
    fn from(message: ChannelMessage) -> Self {
        Self::Message(message)
    }
}

// ---------------------------------------------------------------------------
// Client -> Server
// ---------------------------------------------------------------------------

/// An inbound client command.  Unknown `command` values are preserved so the
/// dispatcher can report them.
#[derive(Debug, Clone, Deserialize)]
pub struct Command {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub data: String,
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

/// The frame carried on the external relay subject.  `message` is the raw
/// broadcast payload as a string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayFrame {
    pub channel_name: String,
    pub broadcasting: String,
    pub message: String,
}

/// Current wall clock in whole seconds since the unix epoch.
pub(crate) fn unix_seconds() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
