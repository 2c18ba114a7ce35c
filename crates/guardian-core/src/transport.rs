//! Transport adapter
//!
//! The ceremony only needs publish, subscribe and an inbound event stream
//! from its pub/sub client. [`MemoryBroker`] is an in-process broker with
//! MQTT topic filter semantics used by the host demo and tests.

use async_trait::async_trait;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport errors reported by the pub/sub client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Publish was not accepted
    #[error("Publish to {topic} failed: {reason}")]
    Publish {
        /// Destination topic
        topic: String,
        /// Client-reported cause
        reason: String,
    },

    /// Subscribe was not accepted
    #[error("Subscribe to {topic} failed: {reason}")]
    Subscribe {
        /// Topic filter
        topic: String,
        /// Client-reported cause
        reason: String,
    },

    /// Client is not connected
    #[error("Transport not connected")]
    NotConnected,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Delivery guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QoS {
    /// Fire and forget
    AtMostOnce,
    /// Delivered, possibly more than once
    AtLeastOnce,
    /// Delivered exactly once
    ExactlyOnce,
}

impl QoS {
    /// MQTT QoS level
    pub fn level(&self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

/// Inbound transport event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Connection to the broker (re-)established
    Connected,
    /// Connection lost
    Disconnected,
    /// Message on a subscribed topic
    Message {
        /// Topic it was published to
        topic: String,
        /// Raw payload
        payload: Vec<u8>,
    },
}

/// Pub/sub client consumed by the ceremony runtime
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish a payload
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> TransportResult<()>;

    /// Subscribe to a topic filter
    async fn subscribe(&self, topic: &str, qos: QoS) -> TransportResult<()>;

    /// Remove a subscription
    async fn unsubscribe(&self, topic: &str) -> TransportResult<()>;
}

/// MQTT topic filter matching with `+` and `#` wildcards
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

struct Subscriber {
    filters: Vec<String>,
    sender: mpsc::UnboundedSender<TransportEvent>,
}

#[derive(Default)]
struct BrokerState {
    clients: HashMap<String, Subscriber>,
    retained: BTreeMap<String, Vec<u8>>,
    retain: bool,
    muted: HashSet<String>,
}

/// In-process pub/sub broker
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// Broker delivering only to current subscribers
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker that retains the last payload of every topic and replays it on subscribe
    pub fn with_retention() -> Self {
        let broker = Self::default();
        if let Ok(mut state) = broker.inner.lock() {
            state.retain = true;
        }
        broker
    }

    fn lock(&self) -> TransportResult<MutexGuard<'_, BrokerState>> {
        self.inner.lock().map_err(|_| TransportError::NotConnected)
    }

    /// Connect a client; its event stream starts with [`TransportEvent::Connected`]
    pub fn connect(
        &self,
        client: &str,
    ) -> (MemoryTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let _ = sender.send(TransportEvent::Connected);
        if let Ok(mut state) = self.lock() {
            state.clients.insert(
                client.to_string(),
                Subscriber {
                    filters: Vec::new(),
                    sender,
                },
            );
        }
        debug!("Broker: client {} connected", client);

        let transport = MemoryTransport {
            client: client.to_string(),
            broker: self.clone(),
        };
        (transport, receiver)
    }

    /// Drop a client and its subscriptions
    pub fn disconnect(&self, client: &str) {
        if let Ok(mut state) = self.lock() {
            if let Some(subscriber) = state.clients.remove(client) {
                let _ = subscriber.sender.send(TransportEvent::Disconnected);
            }
        }
    }

    /// Silently discard everything a client publishes from now on
    pub fn mute(&self, client: &str) {
        if let Ok(mut state) = self.lock() {
            state.muted.insert(client.to_string());
        }
    }

    /// Publish on behalf of an external party (e.g. the coordinator)
    pub fn publish(&self, topic: &str, payload: &[u8]) -> TransportResult<()> {
        let mut state = self.lock()?;
        if state.retain {
            state.retained.insert(topic.to_string(), payload.to_vec());
        }

        for (name, subscriber) in &state.clients {
            if subscriber.filters.iter().any(|f| topic_matches(f, topic)) {
                trace!("Broker: delivering {} to {}", topic, name);
                let _ = subscriber.sender.send(TransportEvent::Message {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                });
            }
        }
        Ok(())
    }

    fn publish_from(&self, client: &str, topic: &str, payload: &[u8]) -> TransportResult<()> {
        {
            let state = self.lock()?;
            if !state.clients.contains_key(client) {
                return Err(TransportError::NotConnected);
            }
            if state.muted.contains(client) {
                trace!("Broker: dropping {} from muted client {}", topic, client);
                return Ok(());
            }
        }
        self.publish(topic, payload)
    }

    fn subscribe_for(&self, client: &str, filter: &str) -> TransportResult<()> {
        let mut state = self.lock()?;
        let retained: Vec<(String, Vec<u8>)> = state
            .retained
            .iter()
            .filter(|(topic, _)| topic_matches(filter, topic))
            .map(|(topic, payload)| (topic.clone(), payload.clone()))
            .collect();

        let subscriber = state
            .clients
            .get_mut(client)
            .ok_or(TransportError::NotConnected)?;
        if !subscriber.filters.iter().any(|f| f == filter) {
            subscriber.filters.push(filter.to_string());
        }

        for (topic, payload) in retained {
            let _ = subscriber.sender.send(TransportEvent::Message { topic, payload });
        }
        Ok(())
    }

    fn unsubscribe_for(&self, client: &str, filter: &str) -> TransportResult<()> {
        let mut state = self.lock()?;
        let subscriber = state
            .clients
            .get_mut(client)
            .ok_or(TransportError::NotConnected)?;
        subscriber.filters.retain(|f| f != filter);
        Ok(())
    }

    /// Topic filters a client is subscribed to
    pub fn subscriptions(&self, client: &str) -> Vec<String> {
        self.lock()
            .ok()
            .and_then(|state| state.clients.get(client).map(|s| s.filters.clone()))
            .unwrap_or_default()
    }
}

/// One client's handle on a [`MemoryBroker`]
#[derive(Clone)]
pub struct MemoryTransport {
    client: String,
    broker: MemoryBroker,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> TransportResult<()> {
        trace!("{} publish {} (qos {})", self.client, topic, qos.level());
        self.broker.publish_from(&self.client, topic, &payload)
    }

    async fn subscribe(&self, topic: &str, _qos: QoS) -> TransportResult<()> {
        self.broker.subscribe_for(&self.client, topic)
    }

    async fn unsubscribe(&self, topic: &str) -> TransportResult<()> {
        self.broker.unsubscribe_for(&self.client, topic)
    }
}
