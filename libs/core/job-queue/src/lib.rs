//! Job Queue Framework
//!
//! Typed, versioned job schemas on top of a visibility-timeout queue.
//!
//! ## Features
//!
//! - **Schemas**: declare a job type, the versions it answers to and its fields
//! - **Registry**: `(type, version)` resolution, first registered wins
//! - **Producers**: validate, encode and enqueue jobs onto named queues
//! - **Consumer loop**: receive, match, execute, acknowledge; at-least-once
//! - **Detached execution**: acknowledge first, run in an independent task
//! - **Lifecycle**: signal-driven graceful shutdown, idle timeout, iteration budget
//! - **Metrics**: per-poll and per-execution counters and timers
//!
//! ## Example
//!
//! ```ignore
//! use job_queue::{
//!     ConsumerConfig, InMemoryTransport, Job, JobDefinitionRegistry, JobSchema, JobWorker,
//!     QueueOptions, QueueRegistry, QueueSettings,
//! };
//!
//! let definitions = JobDefinitionRegistry::global();
//! let schema = definitions.register(
//!     JobSchema::builder("Greeting")
//!         .field("name")
//!         .require(["name"])
//!         .executes_fn(|job| async move {
//!             let name: Option<String> = job.get("name")?;
//!             tracing::info!(?name, "hello");
//!             Ok(())
//!         })
//!         .build()?,
//! );
//!
//! let queues = QueueRegistry::new(settings, Arc::new(InMemoryTransport::new()));
//! let queue = queues.define_queue("default", QueueOptions::new().as_default()).await?;
//!
//! let mut job = Job::new(schema);
//! job.set("name", "joe")?;
//! job.enqueue(&queues, None).await?;
//!
//! let worker = JobWorker::new(queue, definitions, ConsumerConfig::new());
//! worker.run().await?;
//! ```

mod codec;
mod config;
mod error;
mod execution;
mod job;
mod lifecycle;
mod memory;
pub mod metrics;
mod queue;
mod registry;
mod schema;
mod settings;
mod transport;
mod validation;
mod worker;

// Re-export main types
pub use codec::{extract_envelope, Codec, Envelope, JsonCodec, RawEnvelope};
pub use config::{ConsumerConfig, DeadLetterPolicy, DEFAULT_POLL_INTERVAL};
pub use error::{ErrorCategory, JobQueueError, JobQueueResult};
pub use execution::{run_guarded, spawn_detached, ExecuteJob, ExecutionStrategy, MessageHandler};
pub use job::Job;
pub use lifecycle::{LifecycleController, SignalTrap, StopReason};
pub use memory::InMemoryTransport;
pub use self::metrics::{
    init_metrics, render_metrics, MemoryMetricsSink, MetricDatum, MetricUnit, MetricsEmitter,
    MetricsSink, RecorderSink,
};
pub use queue::{QueueHandle, QueueOptions, QueueRegistry};
pub use registry::JobDefinitionRegistry;
pub use schema::{
    normalize_type, Executable, ExecutableWithMessage, Execution, JobSchema, SchemaBuilder,
    DEFAULT_VERSION, RESERVED_FIELDS,
};
pub use settings::{QueueSettings, DEFAULT_VISIBILITY_TIMEOUT};
pub use transport::{
    QueueRef, QueueTransport, ReceiptToken, ReceivedMessage, SendOptions, TransportError,
};
pub use validation::{RequiredFields, ValidationReport, Validator};
pub use worker::{JobWorker, LoopState, PollSummary};
