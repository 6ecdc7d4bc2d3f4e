//! Data model shared between the SMTP receiver, the mailbox store,
//! the webhook dispatcher, and the management API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Generates a new message identifier: 128 random bits rendered as
/// 32 lowercase hexadecimal characters.
pub fn new_message_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// A received email as stored in the mailbox and serialized to the
/// persistence file, the management API, and webhook payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Opaque identifier, unique within a store instance.
    pub id: String,
    /// Reverse-path address; empty for the null sender `<>`.
    pub from: String,
    /// Forward-path addresses in the order they were accepted.
    pub to: Vec<String>,
    /// Value of the first `Subject` header, or empty.
    pub subject: String,
    /// Textual body after the header block, or the raw DATA payload
    /// when header parsing failed.
    pub body: String,
    /// HTML body. Unused by the receiving path; present so stored
    /// messages share a shape with outbound ones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    /// Every header in appearance order. Multi-valued headers yield
    /// one entry per occurrence.
    pub headers: Vec<Header>,
    /// MIME attachments. The receiver does not decompose MIME and
    /// leaves this empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    /// Stamped by the store when it accepts the message.
    pub received_at: DateTime<Utc>,
    /// Byte count of the raw DATA payload, excluding the terminator.
    pub size: u64,
}

/// A single email header occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub key: String,
    pub value: String,
}

/// An email attachment. Kept for payload shape compatibility; the
/// receiving path never populates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
}

/// Point-in-time mailbox statistics, derived from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats {
    pub total_emails: usize,
    pub total_size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_email_at: Option<DateTime<Utc>>,
    pub server_started: DateTime<Utc>,
}

/// A webhook subscription. Registered once, notified for every
/// message accepted afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub url: String,
    /// HTTP method for the notification request; empty means POST.
    #[serde(default)]
    pub method: String,
    /// Extra request headers sent with every notification.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// An email to be submitted through the outbound relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    #[serde(default)]
    pub from: String,
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
}
