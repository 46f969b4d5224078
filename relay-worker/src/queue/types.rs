//! Queue message types and topology names.
//!
//! This module defines:
//! - The broker topology the relay consumes from
//! - [`NotificationPayload`], the validated body of a notification message
//! - [`InboundMessage`], the broker-independent view of a delivery

use std::borrow::Cow;

use lettre::message::Mailbox;
use serde::de::Unexpected;
use serde::{Deserialize, Serialize};
use serde_json::error::Category;
use serde_json::Value;
use thiserror::Error;

/// Direct exchange notifications are published to.
pub const NOTIFICATION_EXCHANGE: &str = "notifications";

/// Work queue consumed by the relay.
pub const NOTIFICATION_QUEUE: &str = "notification_queue";

/// Binding key between the exchange and the work queue.
pub const NOTIFICATION_ROUTING_KEY: &str = "";

/// Holding queue for delayed retries. Messages expire back into
/// [`NOTIFICATION_QUEUE`] through the default exchange.
pub const RETRY_QUEUE: &str = "notification_queue.retry";

/// Fanout exchange receiving messages rejected after the last attempt.
pub const DEAD_LETTER_EXCHANGE: &str = "notifications.dead_letter";

/// Queue holding dead-lettered notifications for inspection.
pub const DEAD_LETTER_QUEUE: &str = "notification_queue.dead_letter";

/// AMQP header carrying the 1-based delivery attempt.
pub const ATTEMPT_HEADER: &str = "x-delivery-attempt";

/// Unacknowledged messages a consumer may hold at once.
pub const PREFETCH_COUNT: u16 = 1;

/// Maximum body bytes echoed into log lines.
const BODY_PREVIEW_LIMIT: usize = 500;

// =============================================================================
// Notification payload
// =============================================================================

/// Reasons a message body cannot be turned into a [`NotificationPayload`].
///
/// None of these can change on redelivery, so the message is acknowledged and
/// dropped.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("body is not well-formed JSON: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("missing or mistyped notification field: {0}")]
    InvalidField(#[source] serde_json::Error),

    #[error("invalid {field} address {value:?}: {reason}")]
    InvalidAddress {
        field: &'static str,
        value: String,
        reason: String,
    },
}

/// Notification to be relayed as an email.
///
/// Wire names are `message`, `from`, `to` and `subject`. The legacy
/// `from_addr`/`to_addr` and camelCase `fromAddress`/`toAddress` spellings are
/// accepted on input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    /// Plain-text email body
    pub message: String,
    /// Sender mailbox
    #[serde(rename = "from", alias = "from_addr", alias = "fromAddress")]
    pub from_address: String,
    /// Recipient mailbox
    #[serde(rename = "to", alias = "to_addr", alias = "toAddress")]
    pub to_address: String,
    /// Email subject
    pub subject: String,
}

impl NotificationPayload {
    /// Create a payload from its parts.
    pub fn new(
        message: impl Into<String>,
        from_address: impl Into<String>,
        to_address: impl Into<String>,
        subject: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            from_address: from_address.into(),
            to_address: to_address.into(),
            subject: subject.into(),
        }
    }

    /// Parse and validate a raw message body.
    ///
    /// Either every field is present, a string, and both addresses are valid
    /// mailboxes, or an error is returned.
    pub fn parse(body: &[u8]) -> Result<Self, ValidationError> {
        let value: Value = serde_json::from_slice(body).map_err(|e| match e.classify() {
            Category::Data => ValidationError::InvalidField(e),
            Category::Io | Category::Syntax | Category::Eof => ValidationError::Malformed(e),
        })?;

        // The derived deserializer also accepts positional arrays; only named
        // fields are part of the wire format.
        if !value.is_object() {
            return Err(ValidationError::InvalidField(serde::de::Error::invalid_type(
                unexpected(&value),
                &"a JSON object with message, from, to and subject",
            )));
        }

        let payload: NotificationPayload =
            serde_json::from_value(value).map_err(ValidationError::InvalidField)?;

        validate_mailbox("from", &payload.from_address)?;
        validate_mailbox("to", &payload.to_address)?;

        Ok(payload)
    }
}

fn unexpected(value: &Value) -> Unexpected<'_> {
    match value {
        Value::Null => Unexpected::Unit,
        Value::Bool(b) => Unexpected::Bool(*b),
        Value::Number(_) => Unexpected::Other("number"),
        Value::String(s) => Unexpected::Str(s),
        Value::Array(_) => Unexpected::Seq,
        Value::Object(_) => Unexpected::Map,
    }
}

fn validate_mailbox(field: &'static str, value: &str) -> Result<(), ValidationError> {
    value
        .parse::<Mailbox>()
        .map(|_| ())
        .map_err(|e| ValidationError::InvalidAddress {
            field,
            value: value.to_string(),
            reason: e.to_string(),
        })
}

// =============================================================================
// Inbound message envelope
// =============================================================================

/// A delivery as seen by the dispatcher.
///
/// `delivery_tag` is only meaningful to the broker that produced the message
/// and is handed back to it when the message is settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    /// 1-based attempt number, read from [`ATTEMPT_HEADER`]
    pub attempt: u32,
    pub message_id: Option<String>,
    /// Per-message TTL in milliseconds, carried over on republish
    pub expiration: Option<String>,
    pub body: Vec<u8>,
}

impl InboundMessage {
    /// First-attempt message published to the notification exchange.
    pub fn new(delivery_tag: u64, body: impl Into<Vec<u8>>) -> Self {
        Self {
            delivery_tag,
            exchange: NOTIFICATION_EXCHANGE.to_string(),
            routing_key: NOTIFICATION_ROUTING_KEY.to_string(),
            redelivered: false,
            attempt: 1,
            message_id: None,
            expiration: None,
            body: body.into(),
        }
    }

    /// Lossy UTF-8 rendering of the start of the body, for logs.
    pub fn body_preview(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body[..self.body.len().min(BODY_PREVIEW_LIMIT)])
    }

    /// Message id for logs.
    pub fn log_id(&self) -> &str {
        self.message_id.as_deref().unwrap_or("unknown")
    }
}
