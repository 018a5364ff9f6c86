//! Transport-level queue settings

use core_config::{env_optional, env_or_default, env_parse_or, env_required, ConfigError, FromEnv};
use std::time::Duration;

pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(60);

/// Settings shared by every queue of a process
///
/// Logical queue names are mapped to `"{prefix}-{name}-{environment}"` at
/// the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    prefix: String,
    environment: String,
    visibility_timeout: Duration,
    metrics_namespace: Option<String>,
}

impl QueueSettings {
    pub fn new(prefix: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            environment: environment.into(),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            metrics_namespace: None,
        }
    }

    /// Default visibility timeout for queues that don't set one
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Enable metrics under `namespace`
    pub fn with_metrics_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.metrics_namespace = Some(namespace.into());
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    pub fn metrics_namespace(&self) -> Option<&str> {
        self.metrics_namespace.as_deref()
    }

    /// Transport-level name of a logical queue
    pub fn queue_name(&self, name: &str) -> String {
        format!("{}-{}-{}", self.prefix, name, self.environment)
    }
}

impl FromEnv for QueueSettings {
    /// Reads:
    /// - JOB_QUEUE_PREFIX: required
    /// - JOB_QUEUE_ENVIRONMENT: defaults to APP_ENV, then "development"
    /// - JOB_QUEUE_VISIBILITY_TIMEOUT_SECS: defaults to 60
    /// - JOB_QUEUE_METRICS_NAMESPACE: optional, metrics are off when unset
    fn from_env() -> Result<Self, ConfigError> {
        let prefix = env_required("JOB_QUEUE_PREFIX")?;
        let environment = env_optional("JOB_QUEUE_ENVIRONMENT")
            .unwrap_or_else(|| env_or_default("APP_ENV", "development"));
        let visibility_secs = env_parse_or(
            "JOB_QUEUE_VISIBILITY_TIMEOUT_SECS",
            DEFAULT_VISIBILITY_TIMEOUT.as_secs(),
        )?;

        Ok(Self {
            prefix,
            environment,
            visibility_timeout: Duration::from_secs(visibility_secs),
            metrics_namespace: env_optional("JOB_QUEUE_METRICS_NAMESPACE"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_name() {
        let settings = QueueSettings::new("billing", "production");
        assert_eq!(settings.queue_name("emails"), "billing-emails-production");
        assert_eq!(settings.visibility_timeout(), Duration::from_secs(60));
        assert!(settings.metrics_namespace().is_none());
    }

    #[test]
    fn test_from_env_requires_prefix() {
        temp_env::with_var_unset("JOB_QUEUE_PREFIX", || {
            let err = QueueSettings::from_env().unwrap_err();
            assert!(err.to_string().contains("JOB_QUEUE_PREFIX"));
        });
    }

    #[test]
    fn test_from_env_defaults() {
        temp_env::with_vars(
            [
                ("JOB_QUEUE_PREFIX", Some("app")),
                ("JOB_QUEUE_ENVIRONMENT", None),
                ("APP_ENV", None),
                ("JOB_QUEUE_VISIBILITY_TIMEOUT_SECS", None),
                ("JOB_QUEUE_METRICS_NAMESPACE", None),
            ],
            || {
                let settings = QueueSettings::from_env().unwrap();
                assert_eq!(settings.prefix(), "app");
                assert_eq!(settings.environment(), "development");
                assert_eq!(settings.visibility_timeout(), DEFAULT_VISIBILITY_TIMEOUT);
                assert!(settings.metrics_namespace().is_none());
            },
        );
    }

    #[test]
    fn test_from_env_falls_back_to_app_env() {
        temp_env::with_vars(
            [
                ("JOB_QUEUE_PREFIX", Some("app")),
                ("JOB_QUEUE_ENVIRONMENT", None),
                ("APP_ENV", Some("staging")),
            ],
            || {
                let settings = QueueSettings::from_env().unwrap();
                assert_eq!(settings.queue_name("default"), "app-default-staging");
            },
        );
    }

    #[test]
    fn test_from_env_overrides() {
        temp_env::with_vars(
            [
                ("JOB_QUEUE_PREFIX", Some("app")),
                ("JOB_QUEUE_ENVIRONMENT", Some("qa")),
                ("JOB_QUEUE_VISIBILITY_TIMEOUT_SECS", Some("300")),
                ("JOB_QUEUE_METRICS_NAMESPACE", Some("JobWorkers")),
            ],
            || {
                let settings = QueueSettings::from_env().unwrap();
                assert_eq!(settings.environment(), "qa");
                assert_eq!(settings.visibility_timeout(), Duration::from_secs(300));
                assert_eq!(settings.metrics_namespace(), Some("JobWorkers"));
            },
        );
    }

    #[test]
    fn test_from_env_rejects_bad_timeout() {
        temp_env::with_vars(
            [
                ("JOB_QUEUE_PREFIX", Some("app")),
                ("JOB_QUEUE_VISIBILITY_TIMEOUT_SECS", Some("a minute")),
            ],
            || {
                assert!(matches!(
                    QueueSettings::from_env(),
                    Err(ConfigError::ParseError { .. })
                ));
            },
        );
    }
}
