// packages/relay/src/bus/memory.rs
//! In-process broker
//!
//! Sessions share one broker; a publish is delivered to every session with a
//! matching subscription, in publish order. A session that is dropped with
//! [`MemoryBroker::drop_session`] has its last will published, the way a
//! network broker reacts to a lost connection.

use crate::bus::{topic_matches, BusConnector, BusMessage, ConnectOptions, Credentials, MessageBus};
use crate::utils::errors::{RelayError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

struct Session {
    filters: Vec<String>,
    inbound: mpsc::UnboundedSender<BusMessage>,
    last_will: Option<BusMessage>,
}

#[derive(Default)]
struct BrokerState {
    sessions: HashMap<String, Session>,
    history: Vec<BusMessage>,
}

impl BrokerState {
    fn route(&mut self, message: BusMessage) {
        trace!(topic = %message.topic, "Routing {} bytes", message.payload.len());
        self.sessions.retain(|client_id, session| {
            if !session.filters.iter().any(|f| topic_matches(f, &message.topic)) {
                return true;
            }
            let delivered = session.inbound.send(message.clone()).is_ok();
            if !delivered {
                debug!("Session {} went away, dropping it", client_id);
            }
            delivered
        });
        self.history.push(message);
    }
}

/// Shared in-memory broker; clones refer to the same broker
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    credentials: Option<Credentials>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require these credentials from every session
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Every message routed so far, in order
    pub fn history(&self) -> Vec<BusMessage> {
        self.state.lock().history.clone()
    }

    /// Messages routed to topics matching `filter`
    pub fn published_to(&self, filter: &str) -> Vec<BusMessage> {
        self.state
            .lock()
            .history
            .iter()
            .filter(|message| topic_matches(filter, &message.topic))
            .cloned()
            .collect()
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.state.lock().sessions.contains_key(client_id)
    }

    /// Drop a session without a disconnect; its last will is published
    pub fn drop_session(&self, client_id: &str) {
        let mut state = self.state.lock();
        if let Some(session) = state.sessions.remove(client_id) {
            if let Some(will) = session.last_will {
                debug!("Publishing last will of {} to {}", client_id, will.topic);
                state.route(will);
            }
        }
    }
}

#[async_trait]
impl BusConnector for MemoryBroker {
    async fn connect(
        &self,
        options: ConnectOptions,
    ) -> Result<(Arc<dyn MessageBus>, mpsc::UnboundedReceiver<BusMessage>)> {
        if let Some(expected) = &self.credentials {
            if options.credentials.as_ref() != Some(expected) {
                return Err(RelayError::Bus(format!(
                    "client {} rejected: bad credentials",
                    options.client_id
                )));
            }
        }

        let (inbound, receiver) = mpsc::unbounded_channel();
        let replaced = self.state.lock().sessions.insert(
            options.client_id.clone(),
            Session {
                filters: Vec::new(),
                inbound,
                last_will: options.last_will,
            },
        );
        if replaced.is_some() {
            debug!("Session {} taken over by a new connection", options.client_id);
        }

        let client: Arc<dyn MessageBus> = Arc::new(MemoryClient {
            client_id: options.client_id,
            state: self.state.clone(),
        });
        Ok((client, receiver))
    }
}

/// One session on a [`MemoryBroker`]
pub struct MemoryClient {
    client_id: String,
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryClient {
    fn not_connected(&self) -> RelayError {
        RelayError::Bus(format!("client {} is not connected", self.client_id))
    }
}

#[async_trait]
impl MessageBus for MemoryClient {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let mut state = self.state.lock();
        if !state.sessions.contains_key(&self.client_id) {
            return Err(self.not_connected());
        }
        state.route(BusMessage::new(topic, payload));
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<()> {
        let mut state = self.state.lock();
        let session = state
            .sessions
            .get_mut(&self.client_id)
            .ok_or_else(|| self.not_connected())?;
        if !session.filters.iter().any(|f| f == filter) {
            session.filters.push(filter.to_string());
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.lock().sessions.remove(&self.client_id);
        debug!("Session {} disconnected", self.client_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(client_id: &str) -> ConnectOptions {
        ConnectOptions {
            client_id: client_id.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let broker = MemoryBroker::new();
        let (relay, mut relay_inbox) = broker.connect(options("relay")).await.unwrap();
        let (upstream, mut upstream_inbox) = broker.connect(options("upstream")).await.unwrap();

        upstream.subscribe("bot/relays/discover").await.unwrap();
        relay.subscribe("/bot/commands/relay").await.unwrap();

        relay
            .publish("bot/relays/discover", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        upstream
            .publish("/bot/commands/relay", Bytes::from_static(b"run"))
            .await
            .unwrap();

        assert_eq!(upstream_inbox.recv().await.unwrap().payload, "hello");
        assert_eq!(relay_inbox.recv().await.unwrap().payload, "run");
        assert!(relay_inbox.try_recv().is_err());
        assert_eq!(broker.history().len(), 2);
    }

    #[tokio::test]
    async fn test_last_will_on_dropped_session_only() {
        let broker = MemoryBroker::new();
        let will = BusMessage::new("bot/relays/discover", "offline");

        let (_relay, _inbox) = broker
            .connect(options("relay").with_last_will(will.clone()))
            .await
            .unwrap();
        broker.drop_session("relay");
        assert_eq!(broker.published_to("bot/relays/discover"), vec![will.clone()]);
        assert!(!broker.is_connected("relay"));

        let (relay, _inbox) = broker
            .connect(options("relay").with_last_will(will))
            .await
            .unwrap();
        relay.disconnect().await.unwrap();
        broker.drop_session("relay");
        assert_eq!(broker.published_to("bot/relays/discover").len(), 1);
        assert!(relay.publish("x", Bytes::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_credentials_enforced() {
        let credentials = Credentials {
            username: "relay".into(),
            password: "secret".into(),
        };
        let broker = MemoryBroker::new().with_credentials(credentials.clone());

        assert!(matches!(
            broker.connect(options("relay")).await,
            Err(RelayError::Bus(_))
        ));

        let mut good = options("relay");
        good.credentials = Some(credentials);
        assert!(broker.connect(good).await.is_ok());
    }
}
