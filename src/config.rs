use std::{env, time::Duration};

use crate::WorkerError;

pub const DEFAULT_BROKER_URL: &str = "nats://localhost:8094";
pub const DEFAULT_QUEUE_GROUP: &str = "workers";
pub const STATUS_SUBJECT: &str = "worker:status";

pub const BROKER_URL_ENV: &str = "BUSWORKER_BROKER_URL";
pub const QUEUE_GROUP_ENV: &str = "BUSWORKER_QUEUE_GROUP";
pub const DRAIN_TIMEOUT_ENV: &str = "BUSWORKER_DRAIN_TIMEOUT_SECS";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub broker_url: String,

    /// Prefix of the subscription subject, `<service_name>.<client_id>`.
    pub service_name: String,

    /// Announced as `inference:<model_name>`.
    pub model_name: String,

    pub queue_group: String,

    pub status_subject: String,

    pub connection_name: Option<String>,

    /// Upper bound on waiting for in-flight requests during shutdown.
    /// `None` waits for every request to finish or be cancelled.
    pub drain_timeout: Option<Duration>,
}

impl WorkerConfig {
    pub fn new(service_name: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            broker_url: DEFAULT_BROKER_URL.to_string(),
            service_name: service_name.into(),
            model_name: model_name.into(),
            queue_group: DEFAULT_QUEUE_GROUP.to_string(),
            status_subject: STATUS_SUBJECT.to_string(),
            connection_name: None,
            drain_timeout: None,
        }
    }

    pub fn with_broker_url(mut self, url: impl Into<String>) -> Self {
        self.broker_url = url.into();
        self
    }

    pub fn with_queue_group(mut self, queue_group: impl Into<String>) -> Self {
        self.queue_group = queue_group.into();
        self
    }

    pub fn with_status_subject(mut self, subject: impl Into<String>) -> Self {
        self.status_subject = subject.into();
        self
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = Some(timeout);
        self
    }

    /// Overrides fields from `BUSWORKER_*` environment variables.
    pub fn apply_env(self) -> Result<Self, WorkerError> {
        self.apply_vars(|key| env::var(key).ok())
    }

    fn apply_vars<F>(mut self, lookup: F) -> Result<Self, WorkerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(BROKER_URL_ENV) {
            self.broker_url = url;
        }
        if let Some(group) = lookup(QUEUE_GROUP_ENV) {
            self.queue_group = group;
        }
        if let Some(raw) = lookup(DRAIN_TIMEOUT_ENV) {
            let secs = parse_positive_secs(&raw).ok_or_else(|| {
                WorkerError::ConfigError(format!(
                    "{DRAIN_TIMEOUT_ENV} must be a positive number of seconds, got {raw:?}"
                ))
            })?;
            self.drain_timeout = Some(Duration::from_secs(secs));
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.service_name.is_empty() {
            return Err(WorkerError::ConfigError("service name is empty".into()));
        }
        if self.model_name.is_empty() {
            return Err(WorkerError::ConfigError("model name is empty".into()));
        }
        for (field, value) in [
            ("service name", &self.service_name),
            ("queue group", &self.queue_group),
            ("status subject", &self.status_subject),
        ] {
            if value.is_empty() || value.chars().any(char::is_whitespace) {
                return Err(WorkerError::ConfigError(format!(
                    "{field} {value:?} must be non-empty and free of whitespace"
                )));
            }
        }
        Ok(())
    }

    /// Subject this worker's connection listens on.
    pub fn request_subject(&self, client_id: &str) -> String {
        format!("{}.{}", self.service_name, client_id)
    }
}

fn parse_positive_secs(raw: &str) -> Option<u64> {
    let value = raw.trim().parse::<u64>().ok()?;
    (value > 0).then_some(value)
}
