// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process broker: a three-level subscriber index plus a bounded worker
//! pool that invokes each subscribing channel's delivery callback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::broker::Broker;
use crate::channel::Channel;
use crate::error::CableError;

const DEFAULT_FANOUT_CONCURRENCY: usize = 100;

/// Channel name -> broadcasting -> channel key -> subscriber.
type SubscriberIndex = HashMap<String, HashMap<String, HashMap<u64, Arc<Channel>>>>;

/// One pending delivery.
struct Delivery {
    channel: Arc<Channel>,
    payload: Bytes,
}

/// The default in-process broker.
pub struct SubscriberMap {
    fanout: AtomicUsize,
    index: Mutex<SubscriberIndex>,
    queue: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
    done: CancellationToken,
}

impl SubscriberMap {
    pub fn new() -> Self {
        Self {
            fanout: AtomicUsize::new(0),
            index: Mutex::new(HashMap::new()),
            queue: Mutex::new(None),
            done: CancellationToken::new(),
        }
    }

    /// Idempotent start: create the delivery queue and spawn the worker pool.
    pub async fn run(&self) -> Result<(), CableError> {
        let receiver = {
            let mut queue = self.queue.lock().unwrap();
            if queue.is_some() {
                return Ok(());
            }
            let (tx, rx) = mpsc::unbounded_channel();
            *queue = Some(tx);
            rx
        };

        if self.fanout.load(Ordering::Relaxed) == 0 {
            self.fanout.store(DEFAULT_FANOUT_CONCURRENCY, Ordering::Relaxed);
        }
        let workers = self.fanout.load(Ordering::Relaxed);

        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        for _ in 0..workers {
            let receiver = Arc::clone(&receiver);
            let done = self.done.clone();
            tokio::spawn(async move {
                loop {
                    let delivery = {
                        let mut receiver = receiver.lock().await;
                        tokio::select! {
                            _ = done.cancelled() => return,
                            delivery = receiver.recv() => delivery,
                        }
                    };
                    match delivery {
                        Some(delivery) => delivery.channel.deliver(delivery.payload),
                        None => return,
                    }
                }
            });
        }

        Ok(())
    }

    /// Stop servicing broadcasts.  Deliveries already handed to a worker
    /// complete.
    pub async fn stop(&self) {
        self.queue.lock().unwrap().take();
        self.done.cancel();
    }

    pub fn set_fanout_concurrency(&self, workers: usize) {
        self.fanout.store(workers, Ordering::Relaxed);
    }

    pub async fn subscribe(
        &self,
        channel: Arc<Channel>,
        broadcasting: &str,
    ) -> Result<(), CableError> {
        let mut index = self.index.lock().unwrap();
        index
            .entry(channel.name().to_owned())
            .or_default()
            .entry(broadcasting.to_owned())
            .or_default()
            .insert(channel.key(), channel);
        Ok(())
    }

    pub async fn unsubscribe(
        &self,
        channel: &Channel,
        broadcasting: &str,
    ) -> Result<(), CableError> {
        let mut index = self.index.lock().unwrap();
        let Some(per_channel) = index.get_mut(channel.name()) else {
            return Ok(());
        };
        if let Some(subscribers) = per_channel.get_mut(broadcasting) {
            subscribers.remove(&channel.key());
            if subscribers.is_empty() {
                per_channel.remove(broadcasting);
            }
            if per_channel.is_empty() {
                index.remove(channel.name());
            }
        }
        Ok(())
    }

    /// Enqueue one delivery per subscriber present at the moment of the call.
    pub async fn broadcast(
        &self,
        channel_name: &str,
        broadcasting: &str,
        payload: Bytes,
    ) -> Result<(), CableError> {
        let targets: Vec<Arc<Channel>> = {
            let index = self.index.lock().unwrap();
            let Some(per_channel) = index.get(channel_name) else {
                error!(channel = channel_name, "no subscribers for channel");
                return Ok(());
            };
            let Some(subscribers) = per_channel.get(broadcasting) else {
                return Ok(());
            };
            subscribers.values().cloned().collect()
        };

        debug!(broadcasting, subscribers = targets.len(), "broadcasting");

        let queue = self.queue.lock().unwrap();
        let Some(sender) = queue.as_ref() else {
            return Err(CableError::Publish("broker is not running".to_owned()));
        };
        for channel in targets {
            let _ = sender.send(Delivery { channel, payload: payload.clone() });
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn fanout_concurrency(&self) -> usize {
        self.fanout.load(Ordering::Relaxed)
    }

    /// Test view of the index: name -> broadcasting -> subscriber keys.
    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> HashMap<String, HashMap<String, Vec<u64>>> {
        self.index
            .lock()
            .unwrap()
            .iter()
            .map(|(name, per_channel)| {
                let per_channel = per_channel
                    .iter()
                    .map(|(b, subscribers)| (b.clone(), subscribers.keys().copied().collect()))
                    .collect();
                (name.clone(), per_channel)
            })
            .collect()
    }
}

impl Default for SubscriberMap {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for SubscriberMap {
    async fn run(&self) -> Result<(), CableError> {
        SubscriberMap::run(self).await
    }

    async fn stop(&self) {
        SubscriberMap::stop(self).await;
    }

    fn set_fanout_concurrency(&self, workers: usize) {
        SubscriberMap::set_fanout_concurrency(self, workers);
    }

    async fn subscribe(&self, channel: Arc<Channel>, broadcasting: &str) -> Result<(), CableError> {
        SubscriberMap::subscribe(self, channel, broadcasting).await
    }

    async fn unsubscribe(&self, channel: &Channel, broadcasting: &str) -> Result<(), CableError> {
        SubscriberMap::unsubscribe(self, channel, broadcasting).await
    }

    async fn broadcast(
        &self,
        channel_name: &str,
        broadcasting: &str,
        payload: Bytes,
    ) -> Result<(), CableError> {
        SubscriberMap::broadcast(self, channel_name, broadcasting, payload).await
    }
}

#[cfg(test)]
#[path = "subscriber_map_tests.rs"]
mod tests;
