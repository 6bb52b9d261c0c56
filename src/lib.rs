// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Strand: a WebSocket pub/sub server speaking the Action Cable v1 JSON
//! subprotocol.
//!
//! A browser opens one WebSocket, subscribes to any number of logical
//! channels, invokes server-side actions, and receives broadcasts fanned out
//! by the [`Cable`] coordinator.  Broadcasts originate from application code,
//! from other nodes through the optional NATS relay, or from the
//! administrative remote-disconnect API.
//!
//! ```no_run
//! use std::sync::Arc;
//! use strand::{Cable, CableConfig, ChannelDescription};
//!
//! # async fn demo() -> Result<(), strand::CableError> {
//! let cable = Cable::new(CableConfig::default()).await?;
//! cable.register_channel(
//!     ChannelDescription::new("RoomChannel")
//!         .on_subscribed(|ch| async move { ch.stream_from("room_1").await }),
//! );
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod cable;
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod socket;

pub use broker::{Broker, NatsRelay, SubscriberMap};
pub use cable::Cable;
pub use channel::{Channel, ChannelDescription};
pub use config::{AuthResult, CableConfig};
pub use connection::Connection;
pub use error::CableError;
pub use socket::Socket;

#[cfg(test)]
pub(crate) mod test_support;
