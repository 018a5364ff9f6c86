//! Job queue error types and error categorization
//!
//! Errors are categorized to decide what happens to the message that caused them:
//! - **Validation**: enqueue-time problem, nothing reaches the transport
//! - **Unroutable**: no schema answers the envelope, fatal for this message only
//! - **Poison**: delivery count exceeded the schema's ceiling, fatal for this message only
//! - **Execution**: job logic failed, the message is left for redelivery
//! - **Transport**: the queue itself failed (receive/send/delete)
//! - **Configuration**: setup-time mistakes (reserved fields, missing queues, ...)

use crate::transport::TransportError;
use thiserror::Error;

/// Category of error for deciding how a failed message is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Job failed attribute validation before being enqueued
    Validation,
    /// Message cannot be matched to a registered schema or decoded
    Unroutable,
    /// Message exceeded its schema's max attempt count
    Poison,
    /// Job logic returned an error or panicked
    Execution,
    /// Queue transport failure
    Transport,
    /// Setup or lookup mistake
    Configuration,
}

impl ErrorCategory {
    /// Whether the error condemns the message rather than the attempt.
    ///
    /// Retrying such a message can never succeed, which is what the
    /// dead-letter policy of the consumer keys on.
    pub fn is_fatal_for_message(&self) -> bool {
        matches!(self, ErrorCategory::Unroutable | ErrorCategory::Poison)
    }
}

/// Job queue errors
#[derive(Error, Debug)]
pub enum JobQueueError {
    /// A schema tried to declare one of the envelope's own keys as a field
    #[error("attempted to declare reserved attribute: {0}")]
    ReservedField(String),

    /// A field that the schema does not declare was read or written
    #[error("unknown field '{field}' for job type {job_type}")]
    UnknownField { job_type: String, field: String },

    /// Validation failed; carries the ordered error list
    #[error("object is not valid: {}", .0.join("; "))]
    Invalid(Vec<String>),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The envelope could not be interpreted
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// No registered schema answers to the envelope's type and version
    #[error("no definition found for type={job_type} version={version}")]
    NoDefinition { job_type: String, version: String },

    /// The message was delivered more often than its schema allows
    #[error("max attempt count reached (delivered {delivery_count} times, limit {max_attempts})")]
    MaxAttemptsExceeded { delivery_count: u32, max_attempts: u32 },

    /// Lookup of a queue name that was never defined
    #[error("queue with type {0} not defined")]
    QueueNotDefined(String),

    /// No queue was flagged as default
    #[error("default queue not defined")]
    DefaultQueueNotDefined,

    /// Queue transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Job execution failed
    #[error("Execution error: {0}")]
    Execution(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl JobQueueError {
    /// Create an execution error from any displayable failure
    pub fn execution(message: impl Into<String>) -> Self {
        JobQueueError::Execution(message.into())
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            JobQueueError::Invalid(_) => ErrorCategory::Validation,
            JobQueueError::UnknownField { .. }
            | JobQueueError::Serialization(_)
            | JobQueueError::MalformedEnvelope(_)
            | JobQueueError::NoDefinition { .. } => ErrorCategory::Unroutable,
            JobQueueError::MaxAttemptsExceeded { .. } => ErrorCategory::Poison,
            JobQueueError::Execution(_) => ErrorCategory::Execution,
            JobQueueError::Transport(_) => ErrorCategory::Transport,
            JobQueueError::ReservedField(_)
            | JobQueueError::QueueNotDefined(_)
            | JobQueueError::DefaultQueueNotDefined
            | JobQueueError::Config(_) => ErrorCategory::Configuration,
        }
    }

    /// Shortcut for `self.category().is_fatal_for_message()`
    pub fn is_fatal_for_message(&self) -> bool {
        self.category().is_fatal_for_message()
    }
}

impl From<serde_json::Error> for JobQueueError {
    fn from(err: serde_json::Error) -> Self {
        JobQueueError::Serialization(err.to_string())
    }
}

impl From<eyre::Report> for JobQueueError {
    fn from(err: eyre::Report) -> Self {
        JobQueueError::Execution(format!("{err:#}"))
    }
}

pub type JobQueueResult<T> = Result<T, JobQueueError>;
