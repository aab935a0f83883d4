// packages/relay/src/announcer/messages.rs
//! Announcement wire messages

use crate::bus::announcer_topic;
use crate::catalog::{BundleRef, CatalogSnapshot};
use crate::utils::errors::{RelayError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Catalog announcement published on the discovery topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    /// Catalog epoch at send time, stringified
    #[serde(rename = "id")]
    pub announcement_id: String,

    #[serde(rename = "relay")]
    pub relay_id: String,

    pub online: bool,
    pub snapshot: bool,
    pub bundles: Vec<BundleRef>,

    /// Topic receipts are expected on
    pub reply_to: String,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    announce: Announcement,
}

impl Announcement {
    pub fn online(relay_id: &str, snapshot: &CatalogSnapshot) -> Self {
        Self {
            announcement_id: snapshot.epoch.to_string(),
            relay_id: relay_id.to_string(),
            online: true,
            snapshot: true,
            bundles: snapshot.bundles.clone(),
            reply_to: announcer_topic(relay_id),
        }
    }

    /// Published as the bus last will and on graceful shutdown
    pub fn offline(relay_id: &str, epoch: u64) -> Self {
        Self {
            announcement_id: epoch.to_string(),
            relay_id: relay_id.to_string(),
            online: false,
            snapshot: true,
            bundles: Vec::new(),
            reply_to: announcer_topic(relay_id),
        }
    }

    /// `{"announce": {...}}` payload
    pub fn to_payload(&self) -> Result<Bytes> {
        let envelope = Envelope {
            announce: self.clone(),
        };
        Ok(Bytes::from(serde_json::to_vec(&envelope)?))
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let envelope: Envelope = serde_json::from_slice(payload)?;
        Ok(envelope.announce)
    }

    /// The epoch this announcement describes
    pub fn epoch(&self) -> Result<u64> {
        self.announcement_id.parse().map_err(|_| {
            RelayError::Decode(format!("announcement id '{}' is not an epoch", self.announcement_id))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Success,
    Failure,
}

/// Upstream acknowledgment of an announcement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnouncementReceipt {
    #[serde(rename = "id")]
    pub announcement_id: String,

    pub status: ReceiptStatus,

    /// Rejection reason, when the broker gives one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AnnouncementReceipt {
    pub fn success(announcement_id: impl Into<String>) -> Self {
        Self {
            announcement_id: announcement_id.into(),
            status: ReceiptStatus::Success,
            message: None,
        }
    }

    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn is_success(&self) -> bool {
        self.status == ReceiptStatus::Success
    }
}
