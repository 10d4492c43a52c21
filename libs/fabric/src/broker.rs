//! Publish/subscribe broker used for discovery
//!
//! The broker is an external collaborator: anything that can fan a string
//! payload out to the subscribers of a named channel fits behind [`Broker`].
//! [`MemoryBroker`] does that within one process.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{Error, Result};

/// A payload delivered on a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub channel: String,
    pub payload: String,
}

/// Publish/subscribe medium shared by every coordinator of a process
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    /// Publish a payload to every current subscriber of `channel`
    async fn publish(&self, channel: &str, payload: String) -> Result<()>;

    /// Subscribe to one or more channels
    async fn subscribe(&self, channels: &[String]) -> Result<BrokerSubscription>;
}

/// Stream of messages for the channels of one `subscribe` call
///
/// Dropping it unsubscribes.
pub struct BrokerSubscription {
    channels: Vec<String>,
    receiver: mpsc::UnboundedReceiver<BrokerMessage>,
}

impl BrokerSubscription {
    /// Wrap the receiving end a broker implementation feeds
    pub fn new(channels: Vec<String>, receiver: mpsc::UnboundedReceiver<BrokerMessage>) -> Self {
        Self { channels, receiver }
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// Next message, or `None` once the broker is gone
    pub async fn recv(&mut self) -> Option<BrokerMessage> {
        self.receiver.recv().await
    }

    pub fn unsubscribe(mut self) {
        self.receiver.close();
    }
}

/// In-process broker
#[derive(Clone, Default)]
pub struct MemoryBroker {
    channels: Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<BrokerMessage>>>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers on `channel`
    pub fn subscriber_count(&self, channel: &str) -> usize {
        let mut channels = self.channels.lock();
        match channels.get_mut(channel) {
            Some(subscribers) => {
                subscribers.retain(|s| !s.is_closed());
                subscribers.len()
            }
            None => 0,
        }
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        let mut channels = self.channels.lock();
        let Some(subscribers) = channels.get_mut(channel) else {
            trace!(channel, "Published to a channel without subscribers");
            return Ok(());
        };

        subscribers.retain(|subscriber| {
            subscriber
                .send(BrokerMessage {
                    channel: channel.to_string(),
                    payload: payload.clone(),
                })
                .is_ok()
        });
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<BrokerSubscription> {
        if channels.is_empty() {
            return Err(Error::Broker("no channels to subscribe to".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.channels.lock();
        for channel in channels {
            registry.entry(channel.clone()).or_default().push(tx.clone());
        }
        Ok(BrokerSubscription::new(channels.to_vec(), rx))
    }
}
