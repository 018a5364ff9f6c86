//! Execution strategies for matched jobs
//!
//! Synchronous queues run the job inline and acknowledge only afterwards.
//! Asynchronous queues acknowledge first and hand the job to a detached
//! task the poller does not wait on while polling; failures there are logged
//! and nothing else. The worker joins whatever is still running before it stops.

use crate::error::{JobQueueError, JobQueueResult};
use crate::job::Job;
use crate::metrics::MetricsEmitter;
use crate::queue::QueueHandle;
use crate::transport::ReceivedMessage;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::Instant;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStrategy {
    /// Execute inline, acknowledge on success
    Synchronous,
    /// Acknowledge, then execute in a detached task
    Detached,
}

impl ExecutionStrategy {
    pub fn for_queue(queue: &QueueHandle) -> Self {
        if queue.is_asynchronous() {
            ExecutionStrategy::Detached
        } else {
            ExecutionStrategy::Synchronous
        }
    }
}

/// What the consumer does with a materialized job
///
/// The default, [`ExecuteJob`], runs the schema's execution. A custom handler
/// takes over that responsibility and may wrap, filter or replace it.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, job: &Job, message: &ReceivedMessage) -> JobQueueResult<()>;
}

/// Runs the job's own execution
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteJob;

#[async_trait]
impl MessageHandler for ExecuteJob {
    async fn handle(&self, job: &Job, message: &ReceivedMessage) -> JobQueueResult<()> {
        job.execute_with(Some(message)).await
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Run a handler, turning a panic into an execution error
pub async fn run_guarded(
    handler: &dyn MessageHandler,
    job: &Job,
    message: &ReceivedMessage,
) -> JobQueueResult<()> {
    match AssertUnwindSafe(handler.handle(job, message)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(JobQueueError::execution(format!(
            "job panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

/// Execute a job in a task of its own, tracked by `tasks`.
///
/// The task owns the job and the message; nothing is shared with the caller.
/// Its outcome is recorded in metrics and logged, never reported back.
pub fn spawn_detached(
    tasks: &mut JoinSet<()>,
    handler: Arc<dyn MessageHandler>,
    job: Job,
    message: ReceivedMessage,
    metrics: MetricsEmitter,
    started: Instant,
) -> AbortHandle {
    tasks.spawn(async move {
        let result = run_guarded(handler.as_ref(), &job, &message).await;
        metrics.record_execution(result.is_ok(), job.job_type(), started.elapsed(), &message);

        match result {
            Ok(()) => info!(
                job_type = %job.job_type(),
                message_id = %message.message_id,
                "Detached job completed"
            ),
            Err(e) => error!(
                job_type = %job.job_type(),
                message_id = %message.message_id,
                error = %e,
                body = %message.body_lossy(),
                "Error executing asynchronous job"
            ),
        }
    })
}
