//! Job schema declarations
//!
//! A [`JobSchema`] names a job type, the versions it answers to, its field
//! set, and what executing it means. Schemas are built with
//! [`JobSchema::builder`] and registered in a
//! [`JobDefinitionRegistry`](crate::JobDefinitionRegistry).
//!
//! # Example
//!
//! ```rust,ignore
//! let schema = JobSchema::builder("billing::InvoiceReminder")
//!     .versions(["2", "1"])
//!     .fields(["invoice_id", "email"])
//!     .require(["invoice_id"])
//!     .max_attempt_count(5)
//!     .executes_fn(|job| async move {
//!         let invoice_id: Option<i64> = job.get("invoice_id")?;
//!         send_reminder(invoice_id).await
//!     })
//!     .build()?;
//! ```

use crate::error::JobQueueError;
use crate::job::Job;
use crate::transport::ReceivedMessage;
use crate::validation::{RequiredFields, Validator};
use async_trait::async_trait;
use heck::ToSnakeCase;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Keys of the envelope itself; a schema may not declare them as fields.
pub const RESERVED_FIELDS: [&str; 3] = ["type", "version", "data"];

/// Version assigned when a schema declares none
pub const DEFAULT_VERSION: &str = "1";

/// Normalize a type name: last `::` segment, snake_cased.
///
/// `"Foo"` -> `"foo"`, `"jobs::LegacyBar"` -> `"legacy_bar"`.
pub fn normalize_type(name: &str) -> String {
    let last = name.rsplit("::").next().unwrap_or(name);
    last.trim().to_snake_case()
}

/// Job logic that only needs the job itself
#[async_trait]
pub trait Executable: Send + Sync {
    async fn execute(&self, job: &Job) -> eyre::Result<()>;
}

/// Job logic that also wants the raw transport message
#[async_trait]
pub trait ExecutableWithMessage: Send + Sync {
    async fn execute(&self, job: &Job, message: &ReceivedMessage) -> eyre::Result<()>;
}

/// What executing a job of this schema does
#[derive(Clone, Default)]
pub enum Execution {
    /// Nothing; the job succeeds immediately
    #[default]
    Noop,
    Job(Arc<dyn Executable>),
    WithMessage(Arc<dyn ExecutableWithMessage>),
}

impl Execution {
    /// Whether the raw message has to be supplied
    pub fn wants_message(&self) -> bool {
        matches!(self, Execution::WithMessage(_))
    }
}

impl fmt::Debug for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Execution::Noop => f.write_str("Noop"),
            Execution::Job(_) => f.write_str("Job(..)"),
            Execution::WithMessage(_) => f.write_str("WithMessage(..)"),
        }
    }
}

/// Adapter turning an async closure over an owned [`Job`] into an [`Executable`].
pub struct FnExecutable<F>(F);

#[async_trait]
impl<F, Fut> Executable for FnExecutable<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = eyre::Result<()>> + Send + 'static,
{
    async fn execute(&self, job: &Job) -> eyre::Result<()> {
        (self.0)(job.clone()).await
    }
}

/// Adapter turning an async closure over a job and its message into an
/// [`ExecutableWithMessage`].
pub struct FnExecutableWithMessage<F>(F);

#[async_trait]
impl<F, Fut> ExecutableWithMessage for FnExecutableWithMessage<F>
where
    F: Fn(Job, ReceivedMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = eyre::Result<()>> + Send + 'static,
{
    async fn execute(&self, job: &Job, message: &ReceivedMessage) -> eyre::Result<()> {
        (self.0)(job.clone(), message.clone()).await
    }
}

/// A registered job type's shape
pub struct JobSchema {
    declared_by: String,
    job_type: String,
    versions: Vec<String>,
    fields: Vec<String>,
    max_attempt_count: Option<u32>,
    queue: Option<String>,
    validators: Vec<Arc<dyn Validator>>,
    execution: Execution,
}

impl JobSchema {
    /// Start declaring a schema on behalf of `declared_by`.
    ///
    /// The declaring name identifies the schema for replacement in the
    /// registry and supplies the default type.
    pub fn builder(declared_by: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder::new(declared_by)
    }

    /// Name of the declaring entity
    pub fn declared_by(&self) -> &str {
        &self.declared_by
    }

    /// Normalized job type
    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    /// Accepted versions, canonical first
    pub fn versions(&self) -> &[String] {
        &self.versions
    }

    /// Version written into freshly produced envelopes
    pub fn current_version(&self) -> &str {
        self.versions
            .first()
            .map(String::as_str)
            .unwrap_or(DEFAULT_VERSION)
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.fields.iter().any(|f| f == field)
    }

    pub fn max_attempt_count(&self) -> Option<u32> {
        self.max_attempt_count
    }

    /// Queue jobs of this schema go to when no target is given
    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    pub fn validators(&self) -> &[Arc<dyn Validator>] {
        &self.validators
    }

    pub fn execution(&self) -> &Execution {
        &self.execution
    }

    /// Whether this schema answers to `(job_type, version)`
    pub fn accepts(&self, job_type: &str, version: &str) -> bool {
        self.job_type == normalize_type(job_type) && self.versions.iter().any(|v| v == version)
    }
}

impl fmt::Debug for JobSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSchema")
            .field("declared_by", &self.declared_by)
            .field("job_type", &self.job_type)
            .field("versions", &self.versions)
            .field("fields", &self.fields)
            .field("max_attempt_count", &self.max_attempt_count)
            .field("queue", &self.queue)
            .field("validators", &self.validators.len())
            .field("execution", &self.execution)
            .finish()
    }
}

/// Builder for [`JobSchema`]
#[derive(Clone)]
pub struct SchemaBuilder {
    declared_by: String,
    job_type: Option<String>,
    versions: Vec<String>,
    fields: Vec<String>,
    max_attempt_count: Option<u32>,
    queue: Option<String>,
    validators: Vec<Arc<dyn Validator>>,
    execution: Execution,
}

impl SchemaBuilder {
    pub fn new(declared_by: impl Into<String>) -> Self {
        Self {
            declared_by: declared_by.into(),
            job_type: None,
            versions: Vec::new(),
            fields: Vec::new(),
            max_attempt_count: None,
            queue: None,
            validators: Vec::new(),
            execution: Execution::Noop,
        }
    }

    /// Override the type derived from the declaring name
    pub fn job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    /// Add one accepted version
    pub fn version(mut self, version: impl ToString) -> Self {
        self.versions.push(version.to_string());
        self
    }

    /// Add accepted versions; the first one ever added is canonical
    pub fn versions<I, V>(mut self, versions: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: ToString,
    {
        self.versions
            .extend(versions.into_iter().map(|v| v.to_string()));
        self
    }

    pub fn field(mut self, field: impl Into<String>) -> Self {
        self.fields.push(field.into());
        self
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields.extend(fields.into_iter().map(Into::into));
        self
    }

    /// Treat messages delivered more than `count` times as poison
    pub fn max_attempt_count(mut self, count: u32) -> Self {
        self.max_attempt_count = Some(count);
        self
    }

    /// Bind jobs of this schema to a named queue
    pub fn queue(mut self, name: impl Into<String>) -> Self {
        self.queue = Some(name.into());
        self
    }

    pub fn validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validators.push(Arc::new(validator));
        self
    }

    /// Shorthand for a [`RequiredFields`] validator
    pub fn require<I, S>(self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.validator(RequiredFields::new(fields))
    }

    pub fn executes(mut self, executable: impl Executable + 'static) -> Self {
        self.execution = Execution::Job(Arc::new(executable));
        self
    }

    pub fn executes_fn<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = eyre::Result<()>> + Send + 'static,
    {
        self.executes(FnExecutable(f))
    }

    pub fn executes_with_message(mut self, executable: impl ExecutableWithMessage + 'static) -> Self {
        self.execution = Execution::WithMessage(Arc::new(executable));
        self
    }

    pub fn executes_with_message_fn<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Job, ReceivedMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = eyre::Result<()>> + Send + 'static,
    {
        self.executes_with_message(FnExecutableWithMessage(f))
    }

    /// Finish the declaration.
    ///
    /// Fails if a reserved field is declared or the type normalizes to
    /// nothing. Duplicate fields and versions are dropped, keeping the first.
    pub fn build(self) -> Result<JobSchema, JobQueueError> {
        let mut fields: Vec<String> = Vec::with_capacity(self.fields.len());
        for field in self.fields {
            if RESERVED_FIELDS.contains(&field.as_str()) {
                return Err(JobQueueError::ReservedField(field));
            }
            if !fields.contains(&field) {
                fields.push(field);
            }
        }

        let mut versions: Vec<String> = Vec::with_capacity(self.versions.len().max(1));
        for version in self.versions {
            if !versions.contains(&version) {
                versions.push(version);
            }
        }
        if versions.is_empty() {
            versions.push(DEFAULT_VERSION.to_string());
        }

        let job_type = normalize_type(self.job_type.as_deref().unwrap_or(&self.declared_by));
        if job_type.is_empty() {
            return Err(JobQueueError::Config(format!(
                "cannot derive a job type from '{}'",
                self.declared_by
            )));
        }

        Ok(JobSchema {
            declared_by: self.declared_by,
            job_type,
            versions,
            fields,
            max_attempt_count: self.max_attempt_count,
            queue: self.queue,
            validators: self.validators,
            execution: self.execution,
        })
    }
}
