// packages/relay/src/bus/lines.rs
//! JSON-lines bus bridge
//!
//! Carries bus traffic over a pair of byte streams, one JSON object per line:
//!
//! ```text
//! {"topic": "/bot/commands/relay-1", "payload": {...}}
//! {"topic": "raw/topic", "text": "not json"}
//! ```
//!
//! Payloads that are valid JSON are embedded under `payload` and come back
//! byte-for-byte as their compact encoding; anything else travels as a
//! string under `text`. Inbound lines are delivered when their topic matches
//! a subscription. The peer owns the other end of the stream, so there is no
//! broker to honour a last will; it is written out when the inbound side
//! closes instead.

use crate::bus::{topic_matches, BusConnector, BusMessage, ConnectOptions, MessageBus};
use crate::utils::errors::{RelayError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    topic: String,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    payload: Value,

    /// Set instead of `payload` for non-JSON bodies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

fn encode_line(message: &BusMessage) -> Result<Vec<u8>> {
    let wire = match serde_json::from_slice::<Value>(&message.payload) {
        Ok(payload) => WireMessage {
            topic: message.topic.clone(),
            payload,
            text: None,
        },
        Err(_) => WireMessage {
            topic: message.topic.clone(),
            payload: Value::Null,
            text: Some(String::from_utf8_lossy(&message.payload).into_owned()),
        },
    };
    let mut line = serde_json::to_vec(&wire)?;
    line.push(b'\n');
    Ok(line)
}

fn decode_line(line: &str) -> Result<BusMessage> {
    let wire: WireMessage = serde_json::from_str(line)?;
    let payload = match wire.text {
        Some(text) => Bytes::from(text),
        None => Bytes::from(serde_json::to_vec(&wire.payload)?),
    };
    Ok(BusMessage::new(wire.topic, payload))
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Connects once over the given streams
pub struct LinesConnector {
    streams: Mutex<Option<(BoxedReader, BoxedWriter)>>,
}

impl LinesConnector {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            streams: Mutex::new(Some((Box::new(reader), Box::new(writer)))),
        }
    }

    /// Bridge over the process's stdin and stdout
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

#[async_trait]
impl BusConnector for LinesConnector {
    async fn connect(
        &self,
        options: ConnectOptions,
    ) -> Result<(Arc<dyn MessageBus>, mpsc::UnboundedReceiver<BusMessage>)> {
        let (reader, writer) = self
            .streams
            .lock()
            .await
            .take()
            .ok_or_else(|| RelayError::Bus("lines bridge already connected".into()))?;

        if options.tls.is_some() || options.credentials.is_some() {
            debug!("Lines bridge ignores TLS and credentials");
        }

        let client = Arc::new(LinesClient {
            writer: Mutex::new(Some(writer)),
            filters: Arc::new(RwLock::new(Vec::new())),
        });
        let (inbound, receiver) = mpsc::unbounded_channel();
        let bus: Arc<dyn MessageBus> = client.clone();

        tokio::spawn(read_lines(
            reader,
            client,
            inbound,
            options.last_will,
        ));

        info!("Lines bridge connected as {}", options.client_id);
        Ok((bus, receiver))
    }
}

async fn read_lines(
    reader: BoxedReader,
    client: Arc<LinesClient>,
    inbound: mpsc::UnboundedSender<BusMessage>,
    last_will: Option<BusMessage>,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match decode_line(&line) {
                Ok(message) => {
                    if client.wants(&message.topic) && inbound.send(message).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Skipping malformed bus line: {}", e),
            },
            Ok(None) => {
                debug!("Lines bridge input closed");
                break;
            }
            Err(e) => {
                warn!("Lines bridge read failed: {}", e);
                break;
            }
        }
    }

    if let Some(will) = last_will {
        if let Err(e) = client.write(&will).await {
            debug!("Could not write last will: {}", e);
        }
    }
}

pub struct LinesClient {
    writer: Mutex<Option<BoxedWriter>>,
    filters: Arc<RwLock<Vec<String>>>,
}

impl LinesClient {
    fn wants(&self, topic: &str) -> bool {
        self.filters.read().iter().any(|f| topic_matches(f, topic))
    }

    async fn write(&self, message: &BusMessage) -> Result<()> {
        let line = encode_line(message)?;
        let mut writer = self.writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or_else(|| RelayError::Bus("lines bridge disconnected".into()))?;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl MessageBus for LinesClient {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.write(&BusMessage::new(topic, payload)).await
    }

    async fn subscribe(&self, filter: &str) -> Result<()> {
        let mut filters = self.filters.write();
        if !filters.iter().any(|f| f == filter) {
            filters.push(filter.to_string());
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.shutdown().await?;
        }
        Ok(())
    }
}
