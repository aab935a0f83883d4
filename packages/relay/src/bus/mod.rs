// packages/relay/src/bus/mod.rs
//! Message bus seam
//!
//! The relay talks to the upstream broker through topic-addressed
//! publish/subscribe. Everything above this module only sees
//! [`MessageBus`] and [`BusConnector`]:
//!
//! - **Memory**: in-process broker used by tests and embedded setups
//! - **Lines**: JSON-lines bridge over a byte stream (stdin/stdout by default)
//!
//! # Topics
//!
//! ```text
//! bot/relays/discover              relay ──▶ broker   announcements
//! bot/relays/<id>/announcer        broker ──▶ relay   announcement receipts
//! /bot/commands/<id>               broker ──▶ relay   execution requests
//! bot/relays/<id>/dynconfigs       broker ──▶ relay   dynamic config updates
//! <reply_to>                       relay ──▶ broker   execution responses
//! ```

pub mod lines;
pub mod memory;

use crate::utils::config::BusSettings;
use crate::utils::errors::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

// Re-export commonly used types
pub use lines::LinesConnector;
pub use memory::MemoryBroker;

/// Topic announcements are published to
pub const DISCOVERY_TOPIC: &str = "bot/relays/discover";

pub fn announcer_topic(relay_id: &str) -> String {
    format!("bot/relays/{}/announcer", relay_id)
}

pub fn commands_topic(relay_id: &str) -> String {
    format!("/bot/commands/{}", relay_id)
}

pub fn dynconfig_topic(relay_id: &str) -> String {
    format!("bot/relays/{}/dynconfigs", relay_id)
}

/// A message delivered on a topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Connection parameters
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,

    /// TLS is on when set; the CA path is optional
    pub tls: Option<TlsOptions>,

    /// Published by the broker if the connection drops without a disconnect
    pub last_will: Option<BusMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsOptions {
    pub ca_path: Option<PathBuf>,
}

impl ConnectOptions {
    pub fn from_settings(settings: &BusSettings, client_id: impl Into<String>) -> Self {
        let credentials = match (&settings.username, &settings.password) {
            (Some(username), password) => Some(Credentials {
                username: username.clone(),
                password: password.clone().unwrap_or_default(),
            }),
            (None, _) => None,
        };

        Self {
            client_id: client_id.into(),
            host: settings.host.clone(),
            port: settings.port,
            credentials,
            tls: settings.tls.enabled.then(|| TlsOptions {
                ca_path: settings.tls.ca_path.clone(),
            }),
            last_will: None,
        }
    }

    pub fn with_last_will(mut self, will: BusMessage) -> Self {
        self.last_will = Some(will);
        self
    }
}

/// A connected bus session
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Deliver messages matching `filter` to the session's inbound channel
    async fn subscribe(&self, filter: &str) -> Result<()>;

    /// Close the session cleanly; the last will is not published
    async fn disconnect(&self) -> Result<()>;
}

/// Opens bus sessions
#[async_trait]
pub trait BusConnector: Send + Sync {
    /// Connect and return the session plus its inbound message stream
    async fn connect(
        &self,
        options: ConnectOptions,
    ) -> Result<(Arc<dyn MessageBus>, mpsc::UnboundedReceiver<BusMessage>)>;
}

/// MQTT-style filter match: `+` matches one level, a trailing `#` matches
/// the rest.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
