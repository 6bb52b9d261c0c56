// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pub/sub brokers: the in-process subscriber map and the NATS relay that
//! federates broadcasts across nodes.

pub mod relay;
pub mod subscriber_map;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::channel::Channel;
use crate::error::CableError;

pub use relay::NatsRelay;
pub use subscriber_map::SubscriberMap;

/// Minimal broker capability set.  The relay variant composes the local map
/// rather than extending it.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Idempotent start.
    async fn run(&self) -> Result<(), CableError>;

    /// Signal shutdown.  In-flight deliveries complete; no broadcast is
    /// serviced afterwards.
    async fn stop(&self);

    /// Size the fan-out worker pool.  Effective before [`Broker::run`].
    fn set_fanout_concurrency(&self, workers: usize);

    /// Register `channel` as a subscriber of `broadcasting`.
    async fn subscribe(&self, channel: Arc<Channel>, broadcasting: &str) -> Result<(), CableError>;

    /// Remove `channel` from `broadcasting`.
    async fn unsubscribe(&self, channel: &Channel, broadcasting: &str) -> Result<(), CableError>;

    /// Deliver `payload` to every subscriber of `(channel_name, broadcasting)`.
    async fn broadcast(
        &self,
        channel_name: &str,
        broadcasting: &str,
        payload: Bytes,
    ) -> Result<(), CableError>;
}
