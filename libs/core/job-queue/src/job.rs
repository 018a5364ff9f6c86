//! Job instances
//!
//! A [`Job`] is one materialized instance of a [`JobSchema`]: the schema plus
//! a value for each declared field. It produces the wire envelope when
//! enqueued and is rebuilt from one by the consumer loop.

use crate::codec::Envelope;
use crate::error::{JobQueueError, JobQueueResult};
use crate::queue::{QueueHandle, QueueRegistry};
use crate::schema::{Execution, JobSchema};
use crate::transport::{ReceivedMessage, SendOptions};
use crate::validation::ValidationReport;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

/// One instance of a job schema
#[derive(Debug, Clone)]
pub struct Job {
    schema: Arc<JobSchema>,
    data: Map<String, Value>,
}

impl Job {
    /// Empty job: every declared field is null
    pub fn new(schema: Arc<JobSchema>) -> Self {
        let data = schema
            .fields()
            .iter()
            .map(|field| (field.clone(), Value::Null))
            .collect();
        Self { schema, data }
    }

    /// Job with some fields set
    pub fn from_fields<I, K>(schema: Arc<JobSchema>, fields: I) -> JobQueueResult<Self>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        let mut job = Self::new(schema);
        for (field, value) in fields {
            job.set_raw(field.as_ref(), value)?;
        }
        Ok(job)
    }

    /// Rebuild a job from a decoded envelope.
    ///
    /// The envelope's type and version are not checked against the schema;
    /// resolving the schema already matched them. Data keys the schema does
    /// not declare are an error.
    pub fn from_envelope(schema: Arc<JobSchema>, envelope: Envelope) -> JobQueueResult<Self> {
        Self::from_fields(schema, envelope.data)
    }

    pub fn schema(&self) -> &Arc<JobSchema> {
        &self.schema
    }

    pub fn job_type(&self) -> &str {
        self.schema.job_type()
    }

    /// Version this job is produced under
    pub fn version(&self) -> &str {
        self.schema.current_version()
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    fn check_field(&self, field: &str) -> JobQueueResult<()> {
        if self.schema.has_field(field) {
            Ok(())
        } else {
            Err(JobQueueError::UnknownField {
                job_type: self.schema.job_type().to_string(),
                field: field.to_string(),
            })
        }
    }

    /// Raw value of a field; `None` for undeclared fields
    pub fn get_raw(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    /// Typed value of a field; `Ok(None)` when it is null
    pub fn get<T: DeserializeOwned>(&self, field: &str) -> JobQueueResult<Option<T>> {
        self.check_field(field)?;
        match self.data.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
        }
    }

    pub fn set<T: Serialize>(&mut self, field: &str, value: T) -> JobQueueResult<()> {
        let value = serde_json::to_value(value)?;
        self.set_raw(field, value)
    }

    pub fn set_raw(&mut self, field: &str, value: Value) -> JobQueueResult<()> {
        self.check_field(field)?;
        self.data.insert(field.to_string(), value);
        Ok(())
    }

    /// Wire form of this job
    pub fn envelope(&self) -> Envelope {
        Envelope {
            job_type: self.schema.job_type().to_string(),
            version: self.schema.current_version().to_string(),
            data: self.data.clone(),
        }
    }

    /// Run every validator of the schema, collecting errors in order
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::valid();
        for validator in self.schema.validators() {
            report.extend(validator.validate(self));
        }
        report
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_valid()
    }

    fn target_queue(
        &self,
        queues: &QueueRegistry,
        target: Option<&str>,
    ) -> JobQueueResult<Arc<QueueHandle>> {
        match target.or(self.schema.queue()) {
            Some(name) => queues.get(name),
            None => queues.default_queue(),
        }
    }

    /// Validate and send.
    ///
    /// Returns `Ok(false)` without touching any queue when validation fails.
    /// The queue is `target`, else the schema's bound queue, else the default.
    pub async fn enqueue(&self, queues: &QueueRegistry, target: Option<&str>) -> JobQueueResult<bool> {
        self.enqueue_with(queues, target, SendOptions::default()).await
    }

    /// [`enqueue`](Self::enqueue) with transport send options
    pub async fn enqueue_with(
        &self,
        queues: &QueueRegistry,
        target: Option<&str>,
        options: SendOptions,
    ) -> JobQueueResult<bool> {
        let report = self.validate();
        if !report.is_valid() {
            debug!(
                job_type = %self.job_type(),
                errors = ?report.errors(),
                "Job failed validation, not enqueued"
            );
            return Ok(false);
        }

        let queue = self.target_queue(queues, target)?;
        queue.enqueue(&self.envelope(), options).await?;
        Ok(true)
    }

    /// Validate and send, failing with the validation errors when invalid
    pub async fn enqueue_or_fail(&self, queues: &QueueRegistry, target: Option<&str>) -> JobQueueResult<()> {
        let report = self.validate();
        if !report.is_valid() {
            return Err(JobQueueError::Invalid(report.into_errors()));
        }

        let queue = self.target_queue(queues, target)?;
        queue.enqueue(&self.envelope(), SendOptions::default()).await?;
        Ok(())
    }

    /// Run the job's logic without a transport message
    pub async fn execute(&self) -> JobQueueResult<()> {
        self.execute_with(None).await
    }

    /// Run the job's logic, handing over the raw message if the schema asks for it
    pub async fn execute_with(&self, message: Option<&ReceivedMessage>) -> JobQueueResult<()> {
        match self.schema.execution() {
            Execution::Noop => Ok(()),
            Execution::Job(executable) => Ok(executable.execute(self).await?),
            Execution::WithMessage(executable) => match message {
                Some(message) => Ok(executable.execute(self, message).await?),
                None => Err(JobQueueError::execution(format!(
                    "job type {} requires the received message to execute",
                    self.job_type()
                ))),
            },
        }
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.job_type() == other.job_type() && self.data == other.data
    }
}
