// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

/// Errors surfaced by the cable and its broker.
///
/// Broadcast and stream-subscription failures are returned to the caller and
/// never retried by the framework.
#[derive(Debug)]
pub enum CableError {
    /// A payload could not be JSON-encoded.
    Encode(String),
    /// The external bus could not be reached.
    Connect(String),
    /// A broadcast publish was rejected or the broker is stopped.
    Publish(String),
    /// A stream subscription at the broker failed.
    Subscribe(String),
}

impl fmt::Display for CableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode(msg) => write!(f, "encode failed: {msg}"),
            Self::Connect(msg) => write!(f, "broker connect failed: {msg}"),
            Self::Publish(msg) => write!(f, "publish failed: {msg}"),
            Self::Subscribe(msg) => write!(f, "subscribe failed: {msg}"),
        }
    }
}

impl std::error::Error for CableError {}

impl From<serde_json::Error> for CableError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encode(err.to_string())
    }
}
