//! Named queue bindings
//!
//! A [`QueueHandle`] binds a logical queue name to one transport-level queue
//! plus the options the consumer loop needs (visibility timeout, execution
//! mode, nested payload key). [`QueueRegistry`] holds the handles of a
//! process and remembers which one is the default.

use crate::codec::{extract_envelope, Codec, Envelope, JsonCodec, RawEnvelope};
use crate::error::{JobQueueError, JobQueueResult};
use crate::settings::QueueSettings;
use crate::transport::{QueueRef, QueueTransport, ReceivedMessage, SendOptions};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, info};

static GLOBAL: OnceCell<Arc<QueueRegistry>> = OnceCell::new();

/// Options for [`QueueRegistry::define_queue`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Overrides the settings' default visibility timeout
    pub visibility_timeout: Option<Duration>,
    /// Acknowledge on dispatch and execute detached
    pub asynchronous: bool,
    /// Key under which carrier messages hold the envelope
    pub nested_payload_key: Option<String>,
    /// Make this the registry's default queue
    pub default: bool,
}

impl QueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = Some(timeout);
        self
    }

    pub fn with_asynchronous(mut self, asynchronous: bool) -> Self {
        self.asynchronous = asynchronous;
        self
    }

    pub fn with_nested_payload_key(mut self, key: impl Into<String>) -> Self {
        self.nested_payload_key = Some(key.into());
        self
    }

    pub fn as_default(mut self) -> Self {
        self.default = true;
        self
    }
}

/// A named, configured binding to one transport-level queue
pub struct QueueHandle {
    name: String,
    queue_ref: QueueRef,
    visibility_timeout: Duration,
    asynchronous: bool,
    nested_payload_key: Option<String>,
    transport: Arc<dyn QueueTransport>,
    codec: Arc<dyn Codec>,
}

impl QueueHandle {
    /// Logical name the queue was defined under
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue_ref(&self) -> &QueueRef {
        &self.queue_ref
    }

    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    pub fn is_asynchronous(&self) -> bool {
        self.asynchronous
    }

    pub fn nested_payload_key(&self) -> Option<&str> {
        self.nested_payload_key.as_deref()
    }

    pub fn transport(&self) -> &Arc<dyn QueueTransport> {
        &self.transport
    }

    /// Encode an envelope and send it; returns the transport message ID
    pub async fn enqueue(&self, envelope: &Envelope, options: SendOptions) -> JobQueueResult<String> {
        let body = self.codec.encode(envelope)?;
        let message_id = self.enqueue_raw(body, options).await?;
        debug!(
            queue = %self.queue_ref.name(),
            job_type = %envelope.job_type,
            version = %envelope.version,
            message_id = %message_id,
            "Enqueued job"
        );
        Ok(message_id)
    }

    /// Send an already encoded body
    pub async fn enqueue_raw(&self, body: Vec<u8>, options: SendOptions) -> JobQueueResult<String> {
        Ok(self.transport.send(&self.queue_ref, body, options).await?)
    }

    /// Receive at most one message
    pub async fn receive(&self, visibility_timeout: Duration) -> JobQueueResult<Option<ReceivedMessage>> {
        let messages = self
            .transport
            .receive(&self.queue_ref, visibility_timeout, 1)
            .await?;
        Ok(messages.into_iter().next())
    }

    /// Acknowledge a message so it is never redelivered
    pub async fn delete(&self, message: &ReceivedMessage) -> JobQueueResult<()> {
        self.transport
            .delete(&self.queue_ref, &message.receipt)
            .await?;
        debug!(
            queue = %self.queue_ref.name(),
            message_id = %message.message_id,
            "Deleted message"
        );
        Ok(())
    }

    /// Keep a message hidden for `timeout` from now, e.g. while a long job runs
    pub async fn change_visibility(
        &self,
        message: &ReceivedMessage,
        timeout: Duration,
    ) -> JobQueueResult<()> {
        self.transport
            .change_visibility(&self.queue_ref, &message.receipt, timeout)
            .await?;
        Ok(())
    }

    /// Decode a received body, looking under the nested payload key if needed
    pub fn decode(&self, message: &ReceivedMessage) -> JobQueueResult<RawEnvelope> {
        extract_envelope(
            self.codec.as_ref(),
            &message.body,
            self.nested_payload_key.as_deref(),
        )
    }
}

impl fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueHandle")
            .field("name", &self.name)
            .field("queue_ref", &self.queue_ref)
            .field("visibility_timeout", &self.visibility_timeout)
            .field("asynchronous", &self.asynchronous)
            .field("nested_payload_key", &self.nested_payload_key)
            .finish()
    }
}

#[derive(Default)]
struct QueueTable {
    queues: HashMap<String, Arc<QueueHandle>>,
    default: Option<String>,
}

/// Table of defined queues
///
/// # Example
///
/// ```rust,ignore
/// let queues = QueueRegistry::new(settings, Arc::new(InMemoryTransport::new()));
/// queues.define_queue("default", QueueOptions::new().as_default()).await?;
/// queues
///     .define_queue("reports", QueueOptions::new().with_asynchronous(true))
///     .await?;
///
/// let reports = queues.get("reports")?;
/// ```
pub struct QueueRegistry {
    settings: QueueSettings,
    transport: Arc<dyn QueueTransport>,
    codec: Arc<dyn Codec>,
    table: RwLock<QueueTable>,
}

impl fmt::Debug for QueueRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueRegistry")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl QueueRegistry {
    pub fn new(settings: QueueSettings, transport: Arc<dyn QueueTransport>) -> Self {
        Self {
            settings,
            transport,
            codec: Arc::new(JsonCodec),
            table: RwLock::new(QueueTable::default()),
        }
    }

    /// Use a different codec for queues defined from now on
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Install `registry` as the process-wide queue registry.
    ///
    /// Fails if one is already installed.
    pub fn init_global(registry: QueueRegistry) -> JobQueueResult<Arc<QueueRegistry>> {
        let registry = Arc::new(registry);
        GLOBAL
            .set(Arc::clone(&registry))
            .map_err(|_| JobQueueError::Config("queue registry already initialized".to_string()))?;
        Ok(registry)
    }

    /// Process-wide queue registry, if one was installed
    pub fn global() -> Option<Arc<QueueRegistry>> {
        GLOBAL.get().cloned()
    }

    fn read(&self) -> RwLockReadGuard<'_, QueueTable> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, QueueTable> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Bind `name` to its transport queue, creating it if needed.
    ///
    /// Redefining a name replaces the previous handle.
    pub async fn define_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> JobQueueResult<Arc<QueueHandle>> {
        let transport_name = self.settings.queue_name(name);
        let queue_ref = self.transport.ensure_queue(&transport_name).await?;

        let handle = Arc::new(QueueHandle {
            name: name.to_string(),
            queue_ref,
            visibility_timeout: options
                .visibility_timeout
                .unwrap_or_else(|| self.settings.visibility_timeout()),
            asynchronous: options.asynchronous,
            nested_payload_key: options.nested_payload_key,
            transport: Arc::clone(&self.transport),
            codec: Arc::clone(&self.codec),
        });

        let mut table = self.write();
        table.queues.insert(name.to_string(), Arc::clone(&handle));
        if options.default {
            table.default = Some(name.to_string());
        }

        info!(
            queue = %name,
            transport_queue = %handle.queue_ref.name(),
            asynchronous = handle.asynchronous,
            default = options.default,
            "Defined queue"
        );
        Ok(handle)
    }

    /// Look up a defined queue
    pub fn get(&self, name: &str) -> JobQueueResult<Arc<QueueHandle>> {
        self.read()
            .queues
            .get(name)
            .cloned()
            .ok_or_else(|| JobQueueError::QueueNotDefined(name.to_string()))
    }

    /// The queue flagged as default
    pub fn default_queue(&self) -> JobQueueResult<Arc<QueueHandle>> {
        let table = self.read();
        table
            .default
            .as_ref()
            .and_then(|name| table.queues.get(name))
            .cloned()
            .ok_or(JobQueueError::DefaultQueueNotDefined)
    }

    /// Flag an already defined queue as default
    pub fn set_default(&self, name: &str) -> JobQueueResult<()> {
        let mut table = self.write();
        if !table.queues.contains_key(name) {
            return Err(JobQueueError::QueueNotDefined(name.to_string()));
        }
        table.default = Some(name.to_string());
        Ok(())
    }

    /// Logical names of all defined queues, sorted
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Forget every queue and the default
    pub fn clear(&self) {
        let mut table = self.write();
        table.queues.clear();
        table.default = None;
    }
}
