//! Consumer metrics
//!
//! [`MetricsEmitter`] produces the per-poll and per-execution data points of
//! a consumer loop and hands them to a [`MetricsSink`]. It does nothing
//! unless the queue settings carry a metrics namespace.
//!
//! The default sink forwards to the `metrics` facade; [`init_metrics`]
//! installs a Prometheus recorder behind it. Names become
//! `{namespace}_{metric}` in snake case, e.g. `job_workers_success_count`.

use crate::settings::QueueSettings;
use crate::transport::ReceivedMessage;
use chrono::Utc;
use heck::ToSnakeCase;
use metrics::{counter, histogram, Label};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() -> Result<(), BuildError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok::<_, BuildError>(handle)
    })?;
    Ok(())
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

pub const MESSAGE_CHECK_COUNT: &str = "MessageCheckCount";
pub const MESSAGE_RECEIVED_COUNT: &str = "MessageReceivedCount";
pub const MESSAGE_MISS_COUNT: &str = "MessageMissCount";
pub const EXECUTION_COUNT: &str = "ExecutionCount";
pub const SUCCESS_COUNT: &str = "SuccessCount";
pub const ERROR_COUNT: &str = "ErrorCount";
pub const EXECUTION_TIME: &str = "ExecutionTime";
pub const TIME_TO_COMPLETION: &str = "TimeToCompletion";
pub const EXECUTION_ATTEMPTS: &str = "ExecutionAttempts";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricUnit {
    Count,
    Milliseconds,
}

/// One data point
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDatum {
    pub namespace: String,
    pub name: &'static str,
    pub value: f64,
    pub unit: MetricUnit,
    pub tags: Vec<(&'static str, String)>,
}

impl MetricDatum {
    /// Value of a tag
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Destination for metric data
pub trait MetricsSink: Send + Sync {
    fn record(&self, datum: &MetricDatum);
}

/// Sink forwarding to the `metrics` facade: counts become counters,
/// durations become histograms.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecorderSink;

impl MetricsSink for RecorderSink {
    fn record(&self, datum: &MetricDatum) {
        let name = format!(
            "{}_{}",
            datum.namespace.to_snake_case(),
            datum.name.to_snake_case()
        );
        let labels: Vec<Label> = datum
            .tags
            .iter()
            .map(|(key, value)| Label::new(key.to_snake_case(), value.clone()))
            .collect();

        match datum.unit {
            MetricUnit::Count => counter!(name, labels).increment(datum.value.max(0.0) as u64),
            MetricUnit::Milliseconds => histogram!(name, labels).record(datum.value),
        }
    }
}

/// Sink keeping every data point in memory
#[derive(Debug, Default)]
pub struct MemoryMetricsSink {
    data: Mutex<Vec<MetricDatum>>,
}

impl MemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far
    pub fn records(&self) -> Vec<MetricDatum> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Data points with the given metric name
    pub fn named(&self, name: &str) -> Vec<MetricDatum> {
        self.records()
            .into_iter()
            .filter(|d| d.name == name)
            .collect()
    }

    /// Sum of the values recorded under a metric name
    pub fn total(&self, name: &str) -> f64 {
        self.named(name).iter().map(|d| d.value).sum()
    }
}

impl MetricsSink for MemoryMetricsSink {
    fn record(&self, datum: &MetricDatum) {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(datum.clone());
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[derive(Clone)]
struct EmitterTarget {
    namespace: String,
    environment: String,
    queue_name: String,
    host: String,
    sink: Arc<dyn MetricsSink>,
}

/// Per-poll and per-execution metrics of one consumer loop
#[derive(Clone, Default)]
pub struct MetricsEmitter {
    target: Option<EmitterTarget>,
}

impl MetricsEmitter {
    /// Emitter that records nothing
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Emitter for a transport-level queue; disabled without a namespace
    pub fn new(settings: &QueueSettings, queue_name: &str) -> Self {
        let Some(namespace) = settings.metrics_namespace() else {
            return Self::disabled();
        };
        Self {
            target: Some(EmitterTarget {
                namespace: namespace.to_string(),
                environment: settings.environment().to_string(),
                queue_name: queue_name.to_string(),
                host: local_hostname(),
                sink: Arc::new(RecorderSink),
            }),
        }
    }

    /// Send data to `sink` instead of the `metrics` facade
    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        if let Some(target) = self.target.as_mut() {
            target.sink = sink;
        }
        self
    }

    /// Override the Host tag
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        if let Some(target) = self.target.as_mut() {
            target.host = host.into();
        }
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.target.is_some()
    }

    /// Record one poll attempt
    pub fn record_poll(&self, received: bool) {
        let Some(target) = &self.target else {
            return;
        };
        let received = if received { 1.0 } else { 0.0 };
        let tags = target.message_tags();

        target.emit(MESSAGE_CHECK_COUNT, 1.0, MetricUnit::Count, &tags);
        target.emit(MESSAGE_RECEIVED_COUNT, received, MetricUnit::Count, &tags);
        target.emit(MESSAGE_MISS_COUNT, 1.0 - received, MetricUnit::Count, &tags);
    }

    /// Record the outcome of one matched message.
    ///
    /// Latency since send and the delivery count are recorded on success only.
    pub fn record_execution(
        &self,
        successful: bool,
        job_type: &str,
        elapsed: Duration,
        message: &ReceivedMessage,
    ) {
        let Some(target) = &self.target else {
            return;
        };
        let mut tags = target.message_tags();
        tags.push(("JobType", job_type.to_string()));
        let success = if successful { 1.0 } else { 0.0 };

        target.emit(EXECUTION_COUNT, 1.0, MetricUnit::Count, &tags);
        target.emit(SUCCESS_COUNT, success, MetricUnit::Count, &tags);
        target.emit(ERROR_COUNT, 1.0 - success, MetricUnit::Count, &tags);
        target.emit(
            EXECUTION_TIME,
            elapsed.as_millis() as f64,
            MetricUnit::Milliseconds,
            &tags,
        );

        if successful {
            let since_sent = (Utc::now() - message.sent_at).num_milliseconds().max(0);
            target.emit(
                TIME_TO_COMPLETION,
                since_sent as f64,
                MetricUnit::Milliseconds,
                &tags,
            );
            target.emit(
                EXECUTION_ATTEMPTS,
                f64::from(message.delivery_count),
                MetricUnit::Count,
                &tags,
            );
        }
    }
}

impl EmitterTarget {
    fn message_tags(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Environment", self.environment.clone()),
            ("QueueName", self.queue_name.clone()),
            ("Host", self.host.clone()),
        ]
    }

    fn emit(&self, name: &'static str, value: f64, unit: MetricUnit, tags: &[(&'static str, String)]) {
        self.sink.record(&MetricDatum {
            namespace: self.namespace.clone(),
            name,
            value,
            unit,
            tags: tags.to_vec(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ReceiptToken;

    fn message(delivery_count: u32) -> ReceivedMessage {
        ReceivedMessage {
            message_id: "m-1".to_string(),
            body: Vec::new(),
            receipt: ReceiptToken::new("r-1"),
            delivery_count,
            sent_at: Utc::now() - chrono::Duration::seconds(2),
            first_received_at: None,
        }
    }

    fn emitter(sink: Arc<MemoryMetricsSink>) -> MetricsEmitter {
        let settings = QueueSettings::new("app", "production").with_metrics_namespace("JobWorkers");
        MetricsEmitter::new(&settings, "app-default-production")
            .with_sink(sink)
            .with_host("worker-1")
    }

    #[test]
    fn test_disabled_without_namespace() {
        let sink = Arc::new(MemoryMetricsSink::new());
        let settings = QueueSettings::new("app", "production");
        let emitter = MetricsEmitter::new(&settings, "app-default-production").with_sink(sink.clone());

        assert!(!emitter.is_enabled());
        emitter.record_poll(true);
        emitter.record_execution(true, "foo", Duration::from_millis(5), &message(1));
        assert!(sink.records().is_empty());
    }

    #[test]
    fn test_poll_metrics() {
        let sink = Arc::new(MemoryMetricsSink::new());
        let emitter = emitter(sink.clone());

        emitter.record_poll(true);
        emitter.record_poll(false);

        assert_eq!(sink.total(MESSAGE_CHECK_COUNT), 2.0);
        assert_eq!(sink.total(MESSAGE_RECEIVED_COUNT), 1.0);
        assert_eq!(sink.total(MESSAGE_MISS_COUNT), 1.0);

        let datum = &sink.named(MESSAGE_CHECK_COUNT)[0];
        assert_eq!(datum.namespace, "JobWorkers");
        assert_eq!(datum.tag("Environment"), Some("production"));
        assert_eq!(datum.tag("QueueName"), Some("app-default-production"));
        assert_eq!(datum.tag("Host"), Some("worker-1"));
        assert_eq!(datum.tag("JobType"), None);
    }

    #[test]
    fn test_successful_execution_metrics() {
        let sink = Arc::new(MemoryMetricsSink::new());
        emitter(sink.clone()).record_execution(true, "foo", Duration::from_millis(25), &message(3));

        assert_eq!(sink.total(EXECUTION_COUNT), 1.0);
        assert_eq!(sink.total(SUCCESS_COUNT), 1.0);
        assert_eq!(sink.total(ERROR_COUNT), 0.0);
        assert_eq!(sink.total(EXECUTION_TIME), 25.0);
        assert_eq!(sink.total(EXECUTION_ATTEMPTS), 3.0);
        assert!(sink.total(TIME_TO_COMPLETION) >= 2000.0);

        let datum = &sink.named(EXECUTION_TIME)[0];
        assert_eq!(datum.unit, MetricUnit::Milliseconds);
        assert_eq!(datum.tag("JobType"), Some("foo"));
    }

    #[test]
    fn test_failed_execution_skips_latency() {
        let sink = Arc::new(MemoryMetricsSink::new());
        emitter(sink.clone()).record_execution(false, "foo", Duration::from_millis(1), &message(1));

        assert_eq!(sink.total(ERROR_COUNT), 1.0);
        assert_eq!(sink.total(SUCCESS_COUNT), 0.0);
        assert!(sink.named(TIME_TO_COMPLETION).is_empty());
        assert!(sink.named(EXECUTION_ATTEMPTS).is_empty());
    }

    #[test]
    fn test_recorder_sink_without_recorder_is_noop() {
        RecorderSink.record(&MetricDatum {
            namespace: "JobWorkers".to_string(),
            name: SUCCESS_COUNT,
            value: 1.0,
            unit: MetricUnit::Count,
            tags: vec![("JobType", "foo".to_string())],
        });
    }
}
