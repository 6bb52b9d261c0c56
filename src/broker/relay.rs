// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! NATS relay broker: federates broadcasts across nodes over a single
//! shared subject.
//!
//! Publishes never deliver locally on their own — every node, the
//! originating one included, receives the frame back from the bus through
//! its own subscription and hands it to the wrapped [`SubscriberMap`].  That
//! costs one extra hop for same-node delivery and keeps every node on the
//! same code path.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, SubscriberMap};
use crate::channel::Channel;
use crate::error::CableError;
use crate::protocol::RelayFrame;

/// The shared subject every node publishes and subscribes on.
pub const RELAY_SUBJECT: &str = "_action_cable_internal";

/// A [`Broker`] fronted by a NATS connection.
pub struct NatsRelay {
    client: async_nats::Client,
    local: Arc<SubscriberMap>,
    done: CancellationToken,
    started: Mutex<bool>,
}

impl NatsRelay {
    /// Wrap an already-connected client.
    pub fn new(client: async_nats::Client) -> Self {
        Self {
            client,
            local: Arc::new(SubscriberMap::new()),
            done: CancellationToken::new(),
            started: Mutex::new(false),
        }
    }

    /// Connect to a NATS server and return a relay over it.
    pub async fn connect(url: &str, token: Option<&str>) -> Result<Self, CableError> {
        let mut opts = async_nats::ConnectOptions::new();
        if let Some(token) = token {
            opts = opts.token(token.to_owned());
        }
        opts = opts.retry_on_initial_connect();

        info!(url, "connecting relay to NATS");
        let client = opts.connect(url).await.map_err(|e| CableError::Connect(e.to_string()))?;
        info!("relay connected");

        Ok(Self::new(client))
    }
}

#[async_trait]
impl Broker for NatsRelay {
    async fn run(&self) -> Result<(), CableError> {
        {
            let mut started = self.started.lock().unwrap();
            if *started {
                return Ok(());
            }
            *started = true;
        }

        self.local.run().await?;

        let mut subscription = self
            .client
            .subscribe(RELAY_SUBJECT)
            .await
            .map_err(|e| CableError::Subscribe(e.to_string()))?;

        let local = Arc::clone(&self.local);
        let done = self.done.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = done.cancelled() => break,
                    msg = subscription.next() => {
                        let Some(msg) = msg else { break };
                        handle_relay_frame(&local, &msg.payload).await;
                    }
                }
            }
            debug!("relay reader shutting down");
        });

        Ok(())
    }

    async fn stop(&self) {
        self.done.cancel();
        if let Err(e) = self.client.flush().await {
            warn!(err = %e, "relay flush failed");
        }
        self.local.stop().await;
    }

    fn set_fanout_concurrency(&self, workers: usize) {
        self.local.set_fanout_concurrency(workers);
    }

    async fn subscribe(&self, channel: Arc<Channel>, broadcasting: &str) -> Result<(), CableError> {
        self.local.subscribe(channel, broadcasting).await
    }

    async fn unsubscribe(&self, channel: &Channel, broadcasting: &str) -> Result<(), CableError> {
        self.local.unsubscribe(channel, broadcasting).await
    }

    async fn broadcast(
        &self,
        channel_name: &str,
        broadcasting: &str,
        payload: Bytes,
    ) -> Result<(), CableError> {
        let frame = RelayFrame {
            channel_name: channel_name.to_owned(),
            broadcasting: broadcasting.to_owned(),
            message: String::from_utf8_lossy(&payload).into_owned(),
        };
        let encoded = serde_json::to_vec(&frame)?;
        self.client
            .publish(RELAY_SUBJECT, encoded.into())
            .await
            .map_err(|e| CableError::Publish(e.to_string()))
    }
}

/// Forward one inbound relay frame to the local map.  Malformed frames are
/// logged and skipped.
async fn handle_relay_frame(local: &SubscriberMap, payload: &[u8]) {
    let frame: RelayFrame = match serde_json::from_slice(payload) {
        Ok(frame) => frame,
        Err(e) => {
            error!(err = %e, "cannot decode relay frame");
            return;
        }
    };
    let payload = Bytes::from(frame.message.into_bytes());
    if let Err(e) = local.broadcast(&frame.channel_name, &frame.broadcasting, payload).await {
        error!(broadcasting = %frame.broadcasting, err = %e, "relay delivery failed");
    }
}

#[cfg(test)]
#[path = "relay_tests.rs"]
mod tests;
