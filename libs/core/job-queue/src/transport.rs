//! Queue transport port
//!
//! The consumer loop and the producers only talk to the network queue through
//! [`QueueTransport`]. Delivery is at-least-once: a received message stays
//! hidden for its visibility timeout and comes back unless it is deleted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::borrow::Cow;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Transport failures
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("receipt {receipt} is not valid for queue {queue}")]
    InvalidReceipt { queue: String, receipt: String },

    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Reference to a transport-level queue, as returned by `ensure_queue`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueRef {
    name: String,
    url: String,
}

impl QueueRef {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }

    /// Transport-level queue name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address the transport uses for this queue
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Opaque handle proving a specific receipt of a message; needed to delete it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptToken(String);

impl ReceiptToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReceiptToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message pulled off the transport
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Transport-assigned message ID
    pub message_id: String,

    /// Raw message body
    pub body: Vec<u8>,

    /// Receipt for this delivery
    pub receipt: ReceiptToken,

    /// Number of times this message has been received, this delivery included
    pub delivery_count: u32,

    /// When the producer sent the message
    pub sent_at: DateTime<Utc>,

    /// When the message was first received by any consumer
    pub first_received_at: Option<DateTime<Utc>>,
}

impl ReceivedMessage {
    /// Body as text, for logging
    pub fn body_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Check if this is a redelivery
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

/// Per-send options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Keep the message invisible for this long after sending
    pub delay: Option<Duration>,
}

impl SendOptions {
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Queue transport capability.
///
/// Implementations must make `ensure_queue` idempotent: calling it twice with
/// the same name yields a reference to the same underlying queue.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Create the queue if it does not exist and return a reference to it
    async fn ensure_queue(&self, name: &str) -> Result<QueueRef, TransportError>;

    /// Submit a message body; returns the transport message ID
    async fn send(
        &self,
        queue: &QueueRef,
        body: Vec<u8>,
        options: SendOptions,
    ) -> Result<String, TransportError>;

    /// Receive up to `max_messages` messages, hiding them for `visibility_timeout`
    async fn receive(
        &self,
        queue: &QueueRef,
        visibility_timeout: Duration,
        max_messages: usize,
    ) -> Result<Vec<ReceivedMessage>, TransportError>;

    /// Delete a received message so it is never redelivered
    async fn delete(&self, queue: &QueueRef, receipt: &ReceiptToken) -> Result<(), TransportError>;

    /// Keep a received message hidden for `visibility_timeout` from now
    async fn change_visibility(
        &self,
        queue: &QueueRef,
        receipt: &ReceiptToken,
        visibility_timeout: Duration,
    ) -> Result<(), TransportError>;
}
