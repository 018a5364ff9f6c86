//! The consumer loop
//!
//! [`JobWorker`] owns the receive -> match -> execute -> acknowledge cycle
//! for one queue. One message is handled at a time; the loop only stops at
//! iteration boundaries.
//!
//! Per iteration:
//! 1. receive at most one message
//! 2. decode the envelope, falling back to the queue's nested payload key;
//!    a body without type and version is logged and skipped
//! 3. resolve the schema; no schema is fatal for this message
//! 4. check the delivery count against the schema's max attempt count
//! 5. materialize the job
//! 6. synchronous queues execute, then delete on success; asynchronous
//!    queues delete, then execute detached
//! 7. record metrics
//!
//! Detached jobs are tracked while the loop runs and joined once it stops,
//! so stopping the worker never abandons a job whose message is already gone.

use crate::config::{ConsumerConfig, DeadLetterPolicy};
use crate::error::{JobQueueError, JobQueueResult};
use crate::execution::{run_guarded, spawn_detached, ExecuteJob, ExecutionStrategy, MessageHandler};
use crate::job::Job;
use crate::lifecycle::{LifecycleController, StopReason};
use crate::metrics::MetricsEmitter;
use crate::queue::QueueHandle;
use crate::registry::JobDefinitionRegistry;
use crate::transport::ReceivedMessage;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Where the loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Receiving,
    Matching,
    Executing,
    Acknowledging,
    /// A stop condition was met; the loop is winding down
    Draining,
    Stopped,
}

/// Counters of one `run`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Receive cycles
    pub iterations: u64,
    /// Messages received
    pub received: u64,
    /// Messages executed and acknowledged inline
    pub succeeded: u64,
    /// Messages that failed at any step
    pub failed: u64,
    /// Messages without type and version
    pub skipped: u64,
    /// Messages acknowledged and handed to a detached task
    pub dispatched: u64,
    /// Detached tasks that ended without completing
    pub detached_aborted: u64,
    pub stop_reason: Option<StopReason>,
}

/// What a single iteration ended with
enum Outcome {
    /// Nothing received, or nothing routable
    Empty,
    /// A routable message was handled, successfully or not
    Handled,
}

/// Consumer loop for one queue
///
/// # Example
///
/// ```rust,ignore
/// let worker = JobWorker::new(
///     queues.get("default")?,
///     JobDefinitionRegistry::global(),
///     ConsumerConfig::new().with_idle_timeout(Duration::from_secs(300)),
/// )
/// .with_metrics(MetricsEmitter::new(queues.settings(), queue.queue_ref().name()))
/// .with_shutdown(shutdown_rx);
///
/// let summary = worker.run().await?;
/// ```
pub struct JobWorker {
    queue: Arc<QueueHandle>,
    definitions: Arc<JobDefinitionRegistry>,
    config: ConsumerConfig,
    handler: Arc<dyn MessageHandler>,
    metrics: MetricsEmitter,
    shutdown: Option<watch::Receiver<bool>>,
    state: watch::Sender<LoopState>,
}

impl JobWorker {
    pub fn new(
        queue: Arc<QueueHandle>,
        definitions: Arc<JobDefinitionRegistry>,
        config: ConsumerConfig,
    ) -> Self {
        let (state, _) = watch::channel(LoopState::Idle);
        Self {
            queue,
            definitions,
            config,
            handler: Arc::new(ExecuteJob),
            metrics: MetricsEmitter::disabled(),
            shutdown: None,
            state,
        }
    }

    /// Replace the default handler, which runs the job's own execution
    pub fn with_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsEmitter) -> Self {
        self.metrics = metrics;
        self
    }

    /// Stop at the next iteration boundary once `true` is sent
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Follow the loop's state
    pub fn subscribe_state(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    pub fn queue(&self) -> &Arc<QueueHandle> {
        &self.queue
    }

    fn set_state(&self, state: LoopState) {
        self.state.send_replace(state);
    }

    /// Run until a stop condition is met.
    ///
    /// Processing errors are logged and the loop goes on, unless
    /// `raise_on_error` is set, in which case the first one is returned.
    pub async fn run(&self) -> JobQueueResult<PollSummary> {
        let strategy = ExecutionStrategy::for_queue(&self.queue);
        info!(
            queue = %self.queue.queue_ref().name(),
            strategy = ?strategy,
            max_executions = ?self.config.max_executions,
            idle_timeout = ?self.config.idle_timeout,
            "Starting job worker"
        );

        let mut lifecycle = LifecycleController::start(&self.config, self.shutdown.clone())?;
        let mut summary = PollSummary::default();
        let mut detached = JoinSet::new();
        let result = self
            .run_loop(&mut lifecycle, &mut summary, strategy, &mut detached)
            .await;

        self.set_state(LoopState::Draining);
        self.drain_detached(&mut detached, &mut summary).await;
        // restores the previous signal handlers
        drop(lifecycle);
        self.set_state(LoopState::Stopped);

        match result {
            Ok(reason) => {
                summary.stop_reason = Some(reason);
                info!(
                    queue = %self.queue.queue_ref().name(),
                    reason = ?reason,
                    iterations = summary.iterations,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    "Shutdown successful"
                );
                Ok(summary)
            }
            Err(e) => Err(e),
        }
    }

    async fn run_loop(
        &self,
        lifecycle: &mut LifecycleController,
        summary: &mut PollSummary,
        strategy: ExecutionStrategy,
        detached: &mut JoinSet<()>,
    ) -> JobQueueResult<StopReason> {
        loop {
            if lifecycle.executions_exhausted() {
                self.set_state(LoopState::Draining);
                return Ok(StopReason::MaxExecutions);
            }

            summary.iterations += 1;
            let outcome = self.poll_once(lifecycle, summary, strategy, detached).await?;
            self.set_state(LoopState::Idle);
            self.reap_detached(detached, summary);

            if lifecycle.idle_expired() {
                self.set_state(LoopState::Draining);
                return Ok(StopReason::IdleTimeout);
            }

            let handled = matches!(outcome, Outcome::Handled);
            if (self.config.always_sleep || !handled) && !self.config.poll_interval.is_zero() {
                lifecycle.pause(self.config.poll_interval).await;
            }

            if let Some(reason) = lifecycle.finish_iteration() {
                self.set_state(LoopState::Draining);
                return Ok(reason);
            }
        }
    }

    async fn poll_once(
        &self,
        lifecycle: &mut LifecycleController,
        summary: &mut PollSummary,
        strategy: ExecutionStrategy,
        detached: &mut JoinSet<()>,
    ) -> JobQueueResult<Outcome> {
        self.set_state(LoopState::Receiving);
        let visibility_timeout = self
            .config
            .visibility_timeout
            .unwrap_or_else(|| self.queue.visibility_timeout());

        let message = match self.queue.receive(visibility_timeout).await {
            Ok(message) => message,
            Err(e) => {
                self.metrics.record_poll(false);
                if self.config.raise_on_error {
                    return Err(e);
                }
                error!(
                    queue = %self.queue.queue_ref().name(),
                    error = %e,
                    "Unable to receive message"
                );
                return Ok(Outcome::Empty);
            }
        };
        let Some(message) = message else {
            self.metrics.record_poll(false);
            debug!(queue = %self.queue.queue_ref().name(), "No message received");
            return Ok(Outcome::Empty);
        };
        summary.received += 1;
        let started = Instant::now();

        self.set_state(LoopState::Matching);
        let raw = match self.queue.decode(&message) {
            Ok(raw) => raw,
            Err(e) => {
                self.metrics.record_poll(false);
                self.fail(e, &message, None, started, summary).await?;
                return Ok(Outcome::Handled);
            }
        };

        let (Some(job_type), Some(version)) = (raw.job_type(), raw.version()) else {
            // only bodies carrying a type and version count as received
            self.metrics.record_poll(false);
            summary.skipped += 1;
            info!(
                queue = %self.queue.queue_ref().name(),
                body = %message.body_lossy(),
                "Ignoring invalid message"
            );
            return Ok(Outcome::Empty);
        };
        self.metrics.record_poll(true);

        let Some(schema) = self.definitions.resolve(&job_type, &version) else {
            let err = JobQueueError::NoDefinition {
                job_type: job_type.clone(),
                version,
            };
            self.fail(err, &message, Some(&job_type), started, summary).await?;
            return Ok(Outcome::Handled);
        };
        lifecycle.mark_matched();

        if let Some(max_attempts) = schema.max_attempt_count() {
            if message.delivery_count > max_attempts {
                let err = JobQueueError::MaxAttemptsExceeded {
                    delivery_count: message.delivery_count,
                    max_attempts,
                };
                self.fail(err, &message, Some(&job_type), started, summary).await?;
                return Ok(Outcome::Handled);
            }
        }

        let job = match raw
            .into_envelope()
            .and_then(|envelope| Job::from_envelope(Arc::clone(&schema), envelope))
        {
            Ok(job) => job,
            Err(e) => {
                self.fail(e, &message, Some(&job_type), started, summary).await?;
                return Ok(Outcome::Handled);
            }
        };

        match strategy {
            ExecutionStrategy::Synchronous => {
                self.execute_inline(job, message, started, summary).await?;
            }
            ExecutionStrategy::Detached => {
                self.dispatch_detached(job, message, started, summary, detached)
                    .await?;
            }
        }
        Ok(Outcome::Handled)
    }

    async fn execute_inline(
        &self,
        job: Job,
        message: ReceivedMessage,
        started: Instant,
        summary: &mut PollSummary,
    ) -> JobQueueResult<()> {
        self.set_state(LoopState::Executing);
        debug!(
            job_type = %job.job_type(),
            message_id = %message.message_id,
            delivery_count = message.delivery_count,
            "Executing job"
        );
        if let Err(e) = run_guarded(self.handler.as_ref(), &job, &message).await {
            return self.fail(e, &message, Some(job.job_type()), started, summary).await;
        }

        self.set_state(LoopState::Acknowledging);
        if let Err(e) = self.queue.delete(&message).await {
            return self.fail(e, &message, Some(job.job_type()), started, summary).await;
        }

        summary.succeeded += 1;
        self.metrics
            .record_execution(true, job.job_type(), started.elapsed(), &message);
        Ok(())
    }

    async fn dispatch_detached(
        &self,
        job: Job,
        message: ReceivedMessage,
        started: Instant,
        summary: &mut PollSummary,
        detached: &mut JoinSet<()>,
    ) -> JobQueueResult<()> {
        // accepted once dispatched: acknowledge before anything runs
        self.set_state(LoopState::Acknowledging);
        if let Err(e) = self.queue.delete(&message).await {
            return self.fail(e, &message, Some(job.job_type()), started, summary).await;
        }

        self.set_state(LoopState::Executing);
        debug!(
            job_type = %job.job_type(),
            message_id = %message.message_id,
            "Dispatching detached job"
        );
        summary.dispatched += 1;
        spawn_detached(
            detached,
            Arc::clone(&self.handler),
            job,
            message,
            self.metrics.clone(),
            started,
        );
        Ok(())
    }

    /// Collect detached tasks that already finished, without waiting
    fn reap_detached(&self, detached: &mut JoinSet<()>, summary: &mut PollSummary) {
        while let Some(joined) = detached.try_join_next() {
            if let Err(e) = joined {
                self.detached_lost(e, summary);
            }
        }
    }

    /// Wait for every detached task still running
    async fn drain_detached(&self, detached: &mut JoinSet<()>, summary: &mut PollSummary) {
        if detached.is_empty() {
            return;
        }
        info!(
            queue = %self.queue.queue_ref().name(),
            in_flight = detached.len(),
            "Waiting for detached jobs to finish"
        );
        while let Some(joined) = detached.join_next().await {
            if let Err(e) = joined {
                self.detached_lost(e, summary);
            }
        }
    }

    fn detached_lost(&self, err: tokio::task::JoinError, summary: &mut PollSummary) {
        summary.detached_aborted += 1;
        error!(
            queue = %self.queue.queue_ref().name(),
            cancelled = err.is_cancelled(),
            error = %err,
            "Detached job ended without completing"
        );
    }

    /// Shared failure path: metrics, dead-letter policy, then raise or log.
    async fn fail(
        &self,
        err: JobQueueError,
        message: &ReceivedMessage,
        job_type: Option<&str>,
        started: Instant,
        summary: &mut PollSummary,
    ) -> JobQueueResult<()> {
        summary.failed += 1;
        if let Some(job_type) = job_type {
            self.metrics
                .record_execution(false, job_type, started.elapsed(), message);
        }

        if err.is_fatal_for_message() && self.config.dead_letter_policy == DeadLetterPolicy::Delete {
            match self.queue.delete(message).await {
                Ok(()) => warn!(
                    queue = %self.queue.queue_ref().name(),
                    message_id = %message.message_id,
                    error = %err,
                    "Deleted message that can never succeed"
                ),
                Err(delete_err) => warn!(
                    queue = %self.queue.queue_ref().name(),
                    message_id = %message.message_id,
                    error = %delete_err,
                    "Failed to delete dead message"
                ),
            }
        }

        if self.config.raise_on_error {
            return Err(err);
        }

        error!(
            queue = %self.queue.queue_ref().name(),
            job_type = job_type.unwrap_or("unknown"),
            message_id = %message.message_id,
            delivery_count = message.delivery_count,
            category = ?err.category(),
            error = %err,
            body = %message.body_lossy(),
            "Unable to process message"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{QueueOptions, QueueRegistry};
    use crate::schema::JobSchema;
    use crate::settings::QueueSettings;
    use crate::transport::{MockQueueTransport, QueueRef, ReceiptToken, TransportError};
    use chrono::Utc;
    use std::time::Duration;

    fn config() -> ConsumerConfig {
        ConsumerConfig::new()
            .with_signal_trap(false)
            .with_poll_interval(Duration::ZERO)
    }

    fn received(body: &str, delivery_count: u32) -> ReceivedMessage {
        ReceivedMessage {
            message_id: "m-1".to_string(),
            body: body.as_bytes().to_vec(),
            receipt: ReceiptToken::new("r-1"),
            delivery_count,
            sent_at: Utc::now(),
            first_received_at: None,
        }
    }

    async fn handle(mut transport: MockQueueTransport) -> Arc<QueueHandle> {
        transport
            .expect_ensure_queue()
            .returning(|name| Ok(QueueRef::new(name, format!("mock://{name}"))));
        let queues = QueueRegistry::new(QueueSettings::new("test", "development"), Arc::new(transport));
        queues.define_queue("default", QueueOptions::new()).await.unwrap()
    }

    fn definitions(schema: JobSchema) -> Arc<JobDefinitionRegistry> {
        let registry = JobDefinitionRegistry::new();
        registry.register(schema);
        Arc::new(registry)
    }

    fn failing() -> JobSchema {
        JobSchema::builder("Foo")
            .executes_fn(|_job| async { Err(eyre::eyre!("boom")) })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_max_executions_bounds_receive_cycles() {
        let mut transport = MockQueueTransport::new();
        transport
            .expect_receive()
            .times(2)
            .returning(|_, _, _| Ok(Vec::new()));

        let worker = JobWorker::new(
            handle(transport).await,
            Arc::new(JobDefinitionRegistry::new()),
            config().with_max_executions(2),
        );
        let summary = worker.run().await.unwrap();

        assert_eq!(summary.iterations, 2);
        assert_eq!(summary.received, 0);
        assert_eq!(summary.stop_reason, Some(StopReason::MaxExecutions));
        assert_eq!(worker.state(), LoopState::Stopped);
    }

    #[tokio::test]
    async fn test_zero_max_executions_never_receives() {
        let mut transport = MockQueueTransport::new();
        transport.expect_receive().times(0);

        let worker = JobWorker::new(
            handle(transport).await,
            Arc::new(JobDefinitionRegistry::new()),
            config().with_max_executions(0),
        );
        let summary = worker.run().await.unwrap();
        assert_eq!(summary.iterations, 0);
    }

    #[tokio::test]
    async fn test_receive_error_raised_when_configured() {
        let mut transport = MockQueueTransport::new();
        transport
            .expect_receive()
            .times(1)
            .returning(|_, _, _| Err(TransportError::Unavailable("timeout".to_string())));

        let worker = JobWorker::new(
            handle(transport).await,
            Arc::new(JobDefinitionRegistry::new()),
            config().with_max_executions(5).with_raise_on_error(true),
        );
        let result = worker.run().await;

        assert!(matches!(result, Err(JobQueueError::Transport(_))));
        assert_eq!(worker.state(), LoopState::Stopped);
    }

    #[tokio::test]
    async fn test_receive_error_logged_and_loop_continues() {
        let mut transport = MockQueueTransport::new();
        transport
            .expect_receive()
            .times(3)
            .returning(|_, _, _| Err(TransportError::Unavailable("timeout".to_string())));

        let worker = JobWorker::new(
            handle(transport).await,
            Arc::new(JobDefinitionRegistry::new()),
            config().with_max_executions(3),
        );
        let summary = worker.run().await.unwrap();
        assert_eq!(summary.iterations, 3);
    }

    #[tokio::test]
    async fn test_sync_failure_never_deletes() {
        let mut transport = MockQueueTransport::new();
        transport
            .expect_receive()
            .returning(|_, _, _| Ok(vec![received(r#"{"type":"foo","version":"1","data":{}}"#, 1)]));
        transport.expect_delete().times(0);

        let worker = JobWorker::new(handle(transport).await, definitions(failing()), config().with_max_executions(2));
        let summary = worker.run().await.unwrap();

        assert_eq!(summary.received, 2);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.succeeded, 0);
    }

    #[tokio::test]
    async fn test_sync_failure_raised_when_configured() {
        let mut transport = MockQueueTransport::new();
        transport
            .expect_receive()
            .times(1)
            .returning(|_, _, _| Ok(vec![received(r#"{"type":"foo","version":"1","data":{}}"#, 1)]));
        transport.expect_delete().times(0);

        let worker = JobWorker::new(
            handle(transport).await,
            definitions(failing()),
            config().with_raise_on_error(true),
        );
        let err = worker.run().await.unwrap_err();
        assert!(matches!(err, JobQueueError::Execution(ref msg) if msg.contains("boom")));
    }

    #[tokio::test]
    async fn test_success_deletes_with_receipt() {
        let mut transport = MockQueueTransport::new();
        transport
            .expect_receive()
            .times(1)
            .returning(|_, _, _| Ok(vec![received(r#"{"type":"foo","version":"1","data":{}}"#, 1)]));
        transport
            .expect_delete()
            .withf(|_, receipt| receipt.as_str() == "r-1")
            .times(1)
            .returning(|_, _| Ok(()));

        let schema = JobSchema::builder("Foo").build().unwrap();
        let worker = JobWorker::new(handle(transport).await, definitions(schema), config().with_max_executions(1));
        let summary = worker.run().await.unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 0);
    }

    #[tokio::test]
    async fn test_delete_policy_removes_unroutable_messages() {
        let mut transport = MockQueueTransport::new();
        transport
            .expect_receive()
            .times(1)
            .returning(|_, _, _| Ok(vec![received(r#"{"type":"unknown","version":"1"}"#, 1)]));
        transport.expect_delete().times(1).returning(|_, _| Ok(()));

        let worker = JobWorker::new(
            handle(transport).await,
            Arc::new(JobDefinitionRegistry::new()),
            config()
                .with_max_executions(1)
                .with_dead_letter_policy(DeadLetterPolicy::Delete),
        );
        let summary = worker.run().await.unwrap();
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn test_leave_policy_keeps_unroutable_messages() {
        let mut transport = MockQueueTransport::new();
        transport
            .expect_receive()
            .times(1)
            .returning(|_, _, _| Ok(vec![received(r#"{"type":"unknown","version":"1"}"#, 1)]));
        transport.expect_delete().times(0);

        let worker = JobWorker::new(
            handle(transport).await,
            Arc::new(JobDefinitionRegistry::new()),
            config().with_max_executions(1),
        );
        worker.run().await.unwrap();
    }

    #[tokio::test]
    async fn test_message_without_type_is_skipped() {
        let mut transport = MockQueueTransport::new();
        transport
            .expect_receive()
            .times(1)
            .returning(|_, _, _| Ok(vec![received(r#"{"hello":"world"}"#, 1)]));
        transport.expect_delete().times(0);

        let worker = JobWorker::new(
            handle(transport).await,
            Arc::new(JobDefinitionRegistry::new()),
            config()
                .with_max_executions(1)
                .with_dead_letter_policy(DeadLetterPolicy::Delete),
        );
        let summary = worker.run().await.unwrap();

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 0);
    }

    #[tokio::test]
    async fn test_state_is_published() {
        let mut transport = MockQueueTransport::new();
        transport.expect_receive().returning(|_, _, _| Ok(Vec::new()));

        let worker = JobWorker::new(
            handle(transport).await,
            Arc::new(JobDefinitionRegistry::new()),
            config().with_max_executions(1),
        );
        let mut states = worker.subscribe_state();
        assert_eq!(*states.borrow_and_update(), LoopState::Idle);

        worker.run().await.unwrap();
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), LoopState::Stopped);
    }
}
