//! Types for the message store.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::Encoding;

/// Unique message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Create a new random message ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a message ID from its string form.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Delivery progress of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Accepted, waiting for the modem
    Pending,
    /// Handed to the network
    Sent,
    /// Confirmed by a status report (or received, for inbound)
    Delivered,
    /// Rejected by the modem or network
    Failed,
}

impl DeliveryStatus {
    /// Check if the status can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }
}

/// An SMS handled by the gateway.
#[derive(Debug, Clone, Serialize)]
pub struct SmsMessage {
    pub id: MessageId,
    pub direction: Direction,
    /// Owning slot
    pub slot: String,
    /// Recipient for outbound, sender for inbound
    pub peer: String,
    pub body: String,
    #[serde(serialize_with = "encoding_name")]
    pub encoding: Encoding,
    /// Network timestamp for inbound, creation time for outbound
    pub timestamp: DateTime<Utc>,
    /// When the gateway created the record
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    /// Class 0 message
    pub flash: bool,
    /// Inbound sequence number, used as fetch cursor
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// Message reference assigned by the modem on submission
    #[serde(skip)]
    pub reference: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl SmsMessage {
    /// Create an outbound message in `Pending` state.
    pub fn outbound(slot: &str, recipient: &str, body: &str, encoding: Encoding) -> Self {
        let now = Utc::now();
        Self {
            id: MessageId::new(),
            direction: Direction::Outbound,
            slot: slot.to_string(),
            peer: recipient.to_string(),
            body: body.to_string(),
            encoding,
            timestamp: now,
            created_at: now,
            updated_at: now,
            status: DeliveryStatus::Pending,
            flash: false,
            sequence: None,
            reference: None,
            failure: None,
        }
    }

    /// Create a received message.
    pub fn inbound(
        slot: &str,
        sender: &str,
        body: &str,
        encoding: Encoding,
        timestamp: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: MessageId::new(),
            direction: Direction::Inbound,
            slot: slot.to_string(),
            peer: sender.to_string(),
            body: body.to_string(),
            encoding,
            timestamp: timestamp.unwrap_or(now),
            created_at: now,
            updated_at: now,
            status: DeliveryStatus::Delivered,
            flash: false,
            sequence: None,
            reference: None,
            failure: None,
        }
    }

    /// Mark as flash (class 0) message.
    pub fn with_flash(mut self, flash: bool) -> Self {
        self.flash = flash;
        self
    }
}

fn encoding_name<S: serde::Serializer>(encoding: &Encoding, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(encoding.as_str())
}

/// Result of an inbound fetch.
#[derive(Debug, Clone, Serialize)]
pub struct InboundBatch {
    pub messages: Vec<SmsMessage>,
    /// Pass back to receive only newer messages
    pub cursor: u64,
}

/// Message store statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub inbound: usize,
    pub outbound: usize,
    pub pending: usize,
}
