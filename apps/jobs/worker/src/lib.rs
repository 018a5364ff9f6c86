//! Jobs Worker Service
//!
//! A single-queue consumer for versioned jobs.
//!
//! ## Architecture
//!
//! ```text
//! QueueRegistry ("default" -> {prefix}-default-{environment})
//!   ↓ (receive one message per poll, visibility timeout)
//! JobWorker
//!   ↓ (resolve type + version)
//! JobDefinitionRegistry → Greeting v2 | LegacyGreeting v1
//!   ↓
//! delete on success, redeliver on failure
//! ```
//!
//! The process-local transport is seeded with a few greetings on startup so
//! the loop has something to consume; it stops once idle or on HUP/INT/TERM.

use core_config::{env_optional, env_parse_or, ConfigError, Environment, FromEnv};
use eyre::{Result, WrapErr};
use job_queue::{
    init_metrics, render_metrics, ConsumerConfig, InMemoryTransport, Job, JobDefinitionRegistry,
    JobQueueResult, JobSchema, JobWorker, MetricsEmitter, QueueOptions, QueueRegistry,
    QueueSettings,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Consumer loop settings of this service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub idle_timeout: Option<Duration>,
    pub max_executions: Option<u64>,
    pub poll_interval: Duration,
    pub seed_jobs: usize,
}

impl WorkerSettings {
    pub fn consumer_config(&self) -> ConsumerConfig {
        let mut config = ConsumerConfig::new().with_poll_interval(self.poll_interval);
        if let Some(timeout) = self.idle_timeout {
            config = config.with_idle_timeout(timeout);
        }
        if let Some(count) = self.max_executions {
            config = config.with_max_executions(count);
        }
        config
    }
}

impl FromEnv for WorkerSettings {
    /// Reads:
    /// - JOBS_WORKER_IDLE_TIMEOUT_SECS: defaults to 30, 0 never times out
    /// - JOBS_WORKER_MAX_EXECUTIONS: optional
    /// - JOBS_WORKER_POLL_INTERVAL_MS: defaults to 1000
    /// - JOBS_WORKER_SEED_JOBS: defaults to 3
    fn from_env() -> Result<Self, ConfigError> {
        let idle_secs: u64 = env_parse_or("JOBS_WORKER_IDLE_TIMEOUT_SECS", 30)?;
        let max_executions = env_optional("JOBS_WORKER_MAX_EXECUTIONS")
            .map(|raw| {
                raw.trim().parse::<u64>().map_err(|e| ConfigError::ParseError {
                    key: "JOBS_WORKER_MAX_EXECUTIONS".to_string(),
                    details: e.to_string(),
                })
            })
            .transpose()?;
        let poll_ms: u64 = env_parse_or("JOBS_WORKER_POLL_INTERVAL_MS", 1000)?;

        Ok(Self {
            idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
            max_executions,
            poll_interval: Duration::from_millis(poll_ms),
            seed_jobs: env_parse_or("JOBS_WORKER_SEED_JOBS", 3)?,
        })
    }
}

async fn greet(job: Job) -> Result<()> {
    let name: Option<String> = job.get("name")?;
    let greeting = if job.schema().has_field("greeting") {
        job.get::<String>("greeting")?
    } else {
        None
    };

    info!(
        version = %job.version(),
        "{}, {}!",
        greeting.as_deref().unwrap_or("Hello"),
        name.as_deref().unwrap_or("stranger")
    );
    Ok(())
}

/// Register the jobs this service consumes; returns the current greeting schema
pub fn register_jobs(definitions: &JobDefinitionRegistry) -> JobQueueResult<Arc<JobSchema>> {
    let greeting = definitions.register(
        JobSchema::builder("Greeting")
            .version(2)
            .fields(["name", "greeting"])
            .require(["name"])
            .max_attempt_count(5)
            .executes_fn(greet)
            .build()?,
    );

    // producers that have not upgraded still send v1
    definitions.register(
        JobSchema::builder("LegacyGreeting")
            .job_type("greeting")
            .version(1)
            .field("name")
            .executes_fn(greet)
            .build()?,
    );

    Ok(greeting)
}

async fn seed(queues: &QueueRegistry, greeting: &Arc<JobSchema>, count: usize) -> Result<()> {
    for index in 0..count {
        let mut job = Job::new(greeting.clone());
        job.set("name", format!("worker-{index}"))?;
        job.enqueue_or_fail(queues, None)
            .await
            .wrap_err("Failed to enqueue seed job")?;
    }
    if count > 0 {
        info!(count, "Seeded greeting jobs");
    }
    Ok(())
}

/// Run the jobs worker
///
/// 1. Sets up error reports, logging and the Prometheus recorder
/// 2. Loads queue and consumer settings from the environment
/// 3. Registers job schemas and defines the default queue
/// 4. Consumes until idle, out of executions or signalled
///
/// # Errors
///
/// Returns an error if configuration is invalid, the queue cannot be defined,
/// or the loop stops on an error.
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    init_metrics().wrap_err("Failed to install Prometheus recorder")?;

    info!(environment = %environment.as_str(), "Starting jobs worker service");

    let settings = QueueSettings::from_env().wrap_err("Failed to load queue settings")?;
    let worker_settings = WorkerSettings::from_env().wrap_err("Failed to load worker settings")?;
    info!(
        prefix = %settings.prefix(),
        environment = %settings.environment(),
        idle_timeout = ?worker_settings.idle_timeout,
        max_executions = ?worker_settings.max_executions,
        "Worker configuration loaded"
    );

    let definitions = JobDefinitionRegistry::global();
    let greeting = register_jobs(&definitions).wrap_err("Failed to register job schemas")?;

    let queues = QueueRegistry::init_global(QueueRegistry::new(
        settings,
        Arc::new(InMemoryTransport::new()),
    ))
    .wrap_err("Failed to install queue registry")?;
    let queue = queues
        .define_queue("default", QueueOptions::new().as_default())
        .await
        .wrap_err("Failed to define default queue")?;

    seed(&queues, &greeting, worker_settings.seed_jobs).await?;

    let metrics = MetricsEmitter::new(queues.settings(), queue.queue_ref().name());
    let worker = JobWorker::new(queue, definitions, worker_settings.consumer_config())
        .with_metrics(metrics);

    let summary = worker.run().await.wrap_err("Consumer loop failed")?;
    info!(
        iterations = summary.iterations,
        received = summary.received,
        succeeded = summary.succeeded,
        failed = summary.failed,
        stop_reason = ?summary.stop_reason,
        "Jobs worker service stopped"
    );
    debug!(metrics = %render_metrics(), "Final metrics");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_settings_defaults() {
        temp_env::with_vars_unset(
            [
                "JOBS_WORKER_IDLE_TIMEOUT_SECS",
                "JOBS_WORKER_MAX_EXECUTIONS",
                "JOBS_WORKER_POLL_INTERVAL_MS",
                "JOBS_WORKER_SEED_JOBS",
            ],
            || {
                let settings = WorkerSettings::from_env().unwrap();
                assert_eq!(settings.idle_timeout, Some(Duration::from_secs(30)));
                assert_eq!(settings.max_executions, None);
                assert_eq!(settings.poll_interval, Duration::from_secs(1));
                assert_eq!(settings.seed_jobs, 3);
            },
        );
    }

    #[test]
    fn test_zero_idle_timeout_disables_it() {
        temp_env::with_vars(
            [
                ("JOBS_WORKER_IDLE_TIMEOUT_SECS", Some("0")),
                ("JOBS_WORKER_MAX_EXECUTIONS", Some("10")),
            ],
            || {
                let settings = WorkerSettings::from_env().unwrap();
                assert_eq!(settings.idle_timeout, None);

                let config = settings.consumer_config();
                assert_eq!(config.idle_timeout, None);
                assert_eq!(config.max_executions, Some(10));
            },
        );
    }

    #[test]
    fn test_invalid_max_executions() {
        temp_env::with_var("JOBS_WORKER_MAX_EXECUTIONS", Some("many"), || {
            let err = WorkerSettings::from_env().unwrap_err();
            assert!(err.to_string().contains("JOBS_WORKER_MAX_EXECUTIONS"));
        });
    }

    #[test]
    fn test_both_greeting_versions_resolve() {
        let definitions = JobDefinitionRegistry::new();
        let greeting = register_jobs(&definitions).unwrap();

        assert_eq!(greeting.job_type(), "greeting");
        assert_eq!(greeting.current_version(), "2");
        assert_eq!(
            definitions.resolve("greeting", "1").unwrap().declared_by(),
            "LegacyGreeting"
        );
        assert_eq!(
            definitions.resolve("greeting", "2").unwrap().declared_by(),
            "Greeting"
        );
    }

    #[tokio::test]
    async fn test_seeded_jobs_are_consumed() {
        let definitions = Arc::new(JobDefinitionRegistry::new());
        let greeting = register_jobs(&definitions).unwrap();
        let transport = Arc::new(InMemoryTransport::new());
        let queues = QueueRegistry::new(QueueSettings::new("test", "development"), transport.clone());
        let queue = queues
            .define_queue("default", QueueOptions::new().as_default())
            .await
            .unwrap();

        seed(&queues, &greeting, 2).await.unwrap();

        let config = ConsumerConfig::new()
            .with_signal_trap(false)
            .with_poll_interval(Duration::ZERO)
            .with_max_executions(2);
        let summary = JobWorker::new(queue, definitions, config).run().await.unwrap();

        assert_eq!(summary.succeeded, 2);
        assert!(transport.is_empty("test-default-development"));
    }
}
