//! Graceful shutdown on terminate signals
#![cfg(unix)]

use job_queue::{
    ConsumerConfig, InMemoryTransport, Job, JobDefinitionRegistry, JobSchema, JobWorker,
    QueueOptions, QueueRegistry, QueueSettings, StopReason,
};
use nix::sys::signal::{raise, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::Arc;
use std::time::Duration;

fn swap(signal: Signal, handler: SigHandler) -> SigAction {
    let action = SigAction::new(handler, SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(signal, &action) }.unwrap()
}

#[tokio::test]
async fn test_sigterm_finishes_current_message_then_restores_handler() {
    let original = swap(Signal::SIGTERM, SigHandler::SigIgn);

    let transport = Arc::new(InMemoryTransport::new());
    let queues = QueueRegistry::new(QueueSettings::new("test", "development"), transport.clone());
    let queue = queues
        .define_queue("default", QueueOptions::new().as_default())
        .await
        .unwrap();

    let definitions = Arc::new(JobDefinitionRegistry::new());
    let schema = definitions.register(
        JobSchema::builder("Terminator")
            .executes_fn(|_job| async {
                raise(Signal::SIGTERM)?;
                Ok(())
            })
            .build()
            .unwrap(),
    );
    for _ in 0..2 {
        Job::new(schema.clone()).enqueue(&queues, None).await.unwrap();
    }

    let config = ConsumerConfig::new()
        .with_poll_interval(Duration::ZERO)
        .with_max_executions(5);
    let summary = JobWorker::new(queue, definitions, config).run().await.unwrap();

    assert_eq!(summary.stop_reason, Some(StopReason::ShutdownRequested));
    assert_eq!(summary.succeeded, 1);
    assert_eq!(transport.len("test-default-development"), 1);

    let restored = swap(Signal::SIGTERM, original.handler());
    assert!(matches!(restored.handler(), SigHandler::SigIgn));
}
