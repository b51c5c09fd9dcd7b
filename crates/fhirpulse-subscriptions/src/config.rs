//! Subscription delivery settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How channel headers combine with the signature header on signed webhooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HeaderPolicy {
    /// A signed request carries only the content type and the signature.
    #[default]
    SignatureSupersedes,
    /// Custom headers are sent alongside the signature; a custom header
    /// with the same name as a generated one replaces it.
    Merge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Maximum jobs executing at once.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Maximum jobs claimed per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound on one job execution, after which the attempt is retried.
    #[serde(default = "default_job_timeout_ms")]
    pub job_timeout_ms: u64,
    /// How long a claimed job stays invisible to other workers.
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,
    /// Capacity of the in-memory queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_webhook_timeout_ms")]
    pub webhook_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_callback_timeout_ms")]
    pub callback_timeout_ms: u64,
    #[serde(default = "default_signature_header")]
    pub signature_header: String,
    #[serde(default)]
    pub header_policy: HeaderPolicy,
    /// Tenants allowed to run callbacks. `*` enables every tenant.
    #[serde(default)]
    pub callback_tenants: Vec<String>,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub queue: QueueSettings,
}

fn default_enabled() -> bool {
    true
}
fn default_workers() -> usize {
    4
}
fn default_batch_size() -> usize {
    16
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_job_timeout_ms() -> u64 {
    60_000
}
fn default_lease_ms() -> u64 {
    120_000
}
fn default_queue_capacity() -> usize {
    10_000
}
fn default_webhook_timeout_ms() -> u64 {
    30_000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_callback_timeout_ms() -> u64 {
    30_000
}
fn default_signature_header() -> String {
    "X-Signature".into()
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            workers: default_workers(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            job_timeout_ms: default_job_timeout_ms(),
            lease_ms: default_lease_ms(),
            queue_capacity: default_queue_capacity(),
            webhook_timeout_ms: default_webhook_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            callback_timeout_ms: default_callback_timeout_ms(),
            signature_header: default_signature_header(),
            header_policy: HeaderPolicy::default(),
            callback_tenants: Vec::new(),
            retry: RetrySettings::default(),
            queue: QueueSettings::default(),
        }
    }
}

impl SubscriptionSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.workers == 0 {
            return Err("subscriptions.workers must be > 0".into());
        }
        if self.batch_size == 0 {
            return Err("subscriptions.batch_size must be > 0".into());
        }
        if self.queue_capacity == 0 {
            return Err("subscriptions.queue_capacity must be > 0".into());
        }
        if self.job_timeout_ms == 0 || self.webhook_timeout_ms == 0 || self.callback_timeout_ms == 0
        {
            return Err("subscriptions timeouts must be > 0".into());
        }
        if self.lease_ms < self.job_timeout_ms {
            return Err("subscriptions.lease_ms must be >= subscriptions.job_timeout_ms".into());
        }
        let header = self.signature_header.trim();
        if header.is_empty()
            || !header
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err("subscriptions.signature_header must be a valid header name".into());
        }
        self.retry.validate()?;
        self.queue.validate()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }
    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_millis(self.webhook_timeout_ms)
    }
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
    pub fn callback_timeout(&self) -> Duration {
        Duration::from_millis(self.callback_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Attempts per job including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    300_000
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetrySettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("subscriptions.retry.max_attempts must be > 0".into());
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(
                "subscriptions.retry.base_delay_ms must be <= subscriptions.retry.max_delay_ms"
                    .into(),
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    #[serde(default)]
    pub backend: QueueBackend,
    /// Required for the postgres backend.
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_queue_pool_size")]
    pub pool_size: u32,
    /// How long the postgres backend keeps delivered and abandoned jobs.
    #[serde(default = "default_queue_retention_ms")]
    pub retention_ms: u64,
}

fn default_queue_pool_size() -> u32 {
    5
}
fn default_queue_retention_ms() -> u64 {
    7 * 24 * 60 * 60 * 1000
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            backend: QueueBackend::default(),
            database_url: None,
            pool_size: default_queue_pool_size(),
            retention_ms: default_queue_retention_ms(),
        }
    }
}

impl QueueSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.backend == QueueBackend::Postgres
            && self.database_url.as_deref().unwrap_or("").is_empty()
        {
            return Err("subscriptions.queue.backend=postgres requires database_url".into());
        }
        if self.pool_size == 0 {
            return Err("subscriptions.queue.pool_size must be > 0".into());
        }
        if self.retention_ms == 0 {
            return Err("subscriptions.queue.retention_ms must be > 0".into());
        }
        Ok(())
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }
}
