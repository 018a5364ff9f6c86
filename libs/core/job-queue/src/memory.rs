//! In-memory queue transport
//!
//! Emulates a visibility-timeout queue inside the process: received messages
//! are hidden until their timeout passes and come back with an incremented
//! delivery count unless they are deleted with the receipt of that delivery.
//! Used for development and tests.

use crate::transport::{
    QueueRef, QueueTransport, ReceiptToken, ReceivedMessage, SendOptions, TransportError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    body: Vec<u8>,
    sent_at: DateTime<Utc>,
    visible_at: Instant,
    receive_count: u32,
    first_received_at: Option<DateTime<Utc>>,
    receipt: Option<ReceiptToken>,
}

/// In-memory transport
///
/// # Example
///
/// ```rust,ignore
/// let transport = InMemoryTransport::new();
/// let queue = transport.ensure_queue("jobs").await?;
/// transport.send(&queue, body, SendOptions::default()).await?;
/// let messages = transport.receive(&queue, Duration::from_secs(30), 1).await?;
/// ```
#[derive(Debug, Default)]
pub struct InMemoryTransport {
    queues: Mutex<HashMap<String, VecDeque<StoredMessage>>>,
    receive_calls: AtomicU64,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<StoredMessage>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue_ref(name: &str) -> QueueRef {
        QueueRef::new(name, format!("memory://{name}"))
    }

    /// Number of messages (visible or in flight) held by a queue
    pub fn len(&self, name: &str) -> usize {
        self.lock().get(name).map(VecDeque::len).unwrap_or(0)
    }

    /// Whether a queue holds no messages at all
    pub fn is_empty(&self, name: &str) -> bool {
        self.len(name) == 0
    }

    /// Number of messages currently hidden by a visibility timeout
    pub fn in_flight(&self, name: &str) -> usize {
        let now = Instant::now();
        self.lock()
            .get(name)
            .map(|queue| {
                queue
                    .iter()
                    .filter(|m| m.receipt.is_some() && m.visible_at > now)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Bodies of every message held by a queue, in send order
    pub fn bodies(&self, name: &str) -> Vec<Vec<u8>> {
        self.lock()
            .get(name)
            .map(|queue| queue.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Names of all queues created so far
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// How many times `receive` has been called, across all queues
    pub fn receive_calls(&self) -> u64 {
        self.receive_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueueTransport for InMemoryTransport {
    async fn ensure_queue(&self, name: &str) -> Result<QueueRef, TransportError> {
        let mut queues = self.lock();
        if !queues.contains_key(name) {
            debug!(queue = %name, "Created in-memory queue");
            queues.insert(name.to_string(), VecDeque::new());
        }
        Ok(Self::queue_ref(name))
    }

    async fn send(
        &self,
        queue: &QueueRef,
        body: Vec<u8>,
        options: SendOptions,
    ) -> Result<String, TransportError> {
        let mut queues = self.lock();
        let messages = queues
            .get_mut(queue.name())
            .ok_or_else(|| TransportError::QueueNotFound(queue.name().to_string()))?;

        let id = Uuid::new_v4().to_string();
        messages.push_back(StoredMessage {
            id: id.clone(),
            body,
            sent_at: Utc::now(),
            visible_at: Instant::now() + options.delay.unwrap_or_default(),
            receive_count: 0,
            first_received_at: None,
            receipt: None,
        });
        Ok(id)
    }

    async fn receive(
        &self,
        queue: &QueueRef,
        visibility_timeout: Duration,
        max_messages: usize,
    ) -> Result<Vec<ReceivedMessage>, TransportError> {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);

        let mut queues = self.lock();
        let messages = queues
            .get_mut(queue.name())
            .ok_or_else(|| TransportError::QueueNotFound(queue.name().to_string()))?;

        let now = Instant::now();
        let mut received = Vec::new();
        for stored in messages.iter_mut() {
            if received.len() >= max_messages {
                break;
            }
            if stored.visible_at > now {
                continue;
            }

            let receipt = ReceiptToken::new(Uuid::new_v4().to_string());
            stored.receive_count += 1;
            stored.visible_at = now + visibility_timeout;
            stored.receipt = Some(receipt.clone());
            let first_received_at = *stored.first_received_at.get_or_insert_with(Utc::now);

            received.push(ReceivedMessage {
                message_id: stored.id.clone(),
                body: stored.body.clone(),
                receipt,
                delivery_count: stored.receive_count,
                sent_at: stored.sent_at,
                first_received_at: Some(first_received_at),
            });
        }
        Ok(received)
    }

    async fn delete(&self, queue: &QueueRef, receipt: &ReceiptToken) -> Result<(), TransportError> {
        let mut queues = self.lock();
        let messages = queues
            .get_mut(queue.name())
            .ok_or_else(|| TransportError::QueueNotFound(queue.name().to_string()))?;

        let position = messages
            .iter()
            .position(|m| m.receipt.as_ref() == Some(receipt))
            .ok_or_else(|| TransportError::InvalidReceipt {
                queue: queue.name().to_string(),
                receipt: receipt.to_string(),
            })?;
        messages.remove(position);
        Ok(())
    }

    async fn change_visibility(
        &self,
        queue: &QueueRef,
        receipt: &ReceiptToken,
        visibility_timeout: Duration,
    ) -> Result<(), TransportError> {
        let mut queues = self.lock();
        let messages = queues
            .get_mut(queue.name())
            .ok_or_else(|| TransportError::QueueNotFound(queue.name().to_string()))?;

        let stored = messages
            .iter_mut()
            .find(|m| m.receipt.as_ref() == Some(receipt))
            .ok_or_else(|| TransportError::InvalidReceipt {
                queue: queue.name().to_string(),
                receipt: receipt.to_string(),
            })?;
        stored.visible_at = Instant::now() + visibility_timeout;
        Ok(())
    }
}
