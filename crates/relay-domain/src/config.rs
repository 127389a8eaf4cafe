//! Runtime configuration
//!
//! The option set is closed: deserializing a config with an unknown field
//! fails instead of silently ignoring it. Every value can also be supplied
//! through `RELAY_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Relay runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    /// Deployment environment, first token of every wire subject
    #[serde(default = "default_env")]
    pub env: String,

    /// Application name, second token of canonical wire subjects
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// NATS server URLs
    #[serde(default = "default_nats_urls")]
    pub nats_urls: Vec<String>,

    /// Worker tasks per pull subscription
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Parallel handler executions per message
    #[serde(default = "default_per_message_concurrency")]
    pub per_message_concurrency: usize,

    /// Maximum delivery attempts before dead-lettering
    #[serde(default = "default_max_deliver")]
    pub max_deliver: u64,

    /// Consumer ack wait in milliseconds
    #[serde(default = "default_ack_wait_ms")]
    pub ack_wait_ms: u64,

    /// Consumer redelivery backoff schedule in milliseconds; empty means the
    /// server applies plain ack-wait redelivery
    #[serde(default)]
    pub backoff_ms: Vec<u64>,

    /// Per-handler timeout in milliseconds; 0 disables the timeout
    #[serde(default)]
    pub subscriber_timeout_ms: u64,

    /// Store-then-publish through the outbox repository
    #[serde(default)]
    pub use_outbox: bool,

    /// Dedupe deliveries through the inbox repository
    #[serde(default)]
    pub use_inbox: bool,

    /// Route poisoned messages to the dead-letter stream
    #[serde(default = "default_use_dlq")]
    pub use_dlq: bool,

    /// Dead-letter subject; defaults to `{env}.events.dlq`
    #[serde(default)]
    pub dlq_subject: Option<String>,

    /// Additional delivery ceiling applied on top of `max_deliver`
    #[serde(default = "default_dlq_max_attempts")]
    pub dlq_max_attempts: u64,

    /// Main stream name; defaults to `{env}-events`
    #[serde(default)]
    pub stream_name: Option<String>,
}

fn default_env() -> String {
    "development".to_string()
}

fn default_app_name() -> String {
    "relay".to_string()
}

fn default_nats_urls() -> Vec<String> {
    vec!["nats://localhost:4222".to_string()]
}

fn default_concurrency() -> usize {
    10
}

fn default_per_message_concurrency() -> usize {
    5
}

fn default_max_deliver() -> u64 {
    5
}

fn default_ack_wait_ms() -> u64 {
    30_000
}

fn default_use_dlq() -> bool {
    true
}

fn default_dlq_max_attempts() -> u64 {
    10
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            env: default_env(),
            app_name: default_app_name(),
            nats_urls: default_nats_urls(),
            concurrency: default_concurrency(),
            per_message_concurrency: default_per_message_concurrency(),
            max_deliver: default_max_deliver(),
            ack_wait_ms: default_ack_wait_ms(),
            backoff_ms: Vec::new(),
            subscriber_timeout_ms: 0,
            use_outbox: false,
            use_inbox: false,
            use_dlq: default_use_dlq(),
            dlq_subject: None,
            dlq_max_attempts: default_dlq_max_attempts(),
            stream_name: None,
        }
    }
}

impl RelayConfig {
    /// Create configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            env: std::env::var("RELAY_ENV").unwrap_or(defaults.env),
            app_name: std::env::var("RELAY_APP_NAME").unwrap_or(defaults.app_name),
            nats_urls: std::env::var("RELAY_NATS_URLS")
                .map(|s| s.split(',').map(|u| u.trim().to_string()).collect())
                .unwrap_or(defaults.nats_urls),
            concurrency: env_parse("RELAY_CONCURRENCY", defaults.concurrency),
            per_message_concurrency: env_parse(
                "RELAY_PER_MESSAGE_CONCURRENCY",
                defaults.per_message_concurrency,
            ),
            max_deliver: env_parse("RELAY_MAX_DELIVER", defaults.max_deliver),
            ack_wait_ms: env_parse("RELAY_ACK_WAIT_MS", defaults.ack_wait_ms),
            backoff_ms: std::env::var("RELAY_BACKOFF_MS")
                .map(|s| s.split(',').filter_map(|v| v.trim().parse().ok()).collect())
                .unwrap_or_default(),
            subscriber_timeout_ms: env_parse("RELAY_SUBSCRIBER_TIMEOUT_MS", 0),
            use_outbox: env_flag("RELAY_USE_OUTBOX", false),
            use_inbox: env_flag("RELAY_USE_INBOX", false),
            use_dlq: env_flag("RELAY_USE_DLQ", true),
            dlq_subject: std::env::var("RELAY_DLQ_SUBJECT").ok(),
            dlq_max_attempts: env_parse("RELAY_DLQ_MAX_ATTEMPTS", defaults.dlq_max_attempts),
            stream_name: std::env::var("RELAY_STREAM_NAME").ok(),
        }
    }

    /// Parse configuration from JSON, rejecting unknown fields.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn ack_wait(&self) -> Duration {
        Duration::from_millis(self.ack_wait_ms)
    }

    /// Per-handler timeout; `None` when disabled.
    pub fn subscriber_timeout(&self) -> Option<Duration> {
        (self.subscriber_timeout_ms > 0).then(|| Duration::from_millis(self.subscriber_timeout_ms))
    }

    pub fn backoff(&self) -> Vec<Duration> {
        self.backoff_ms.iter().map(|ms| Duration::from_millis(*ms)).collect()
    }

    pub fn stream_name(&self) -> String {
        self.stream_name
            .clone()
            .unwrap_or_else(|| format!("{}-events", self.env))
    }

    pub fn dlq_stream_name(&self) -> String {
        format!("{}-dlq", self.stream_name())
    }

    pub fn dlq_subject(&self) -> String {
        self.dlq_subject
            .clone()
            .unwrap_or_else(|| format!("{}.events.dlq", self.env))
    }

    /// The delivery ceiling after which a message is dead-lettered: the
    /// lower of `max_deliver` and `dlq_max_attempts`.
    pub fn delivery_ceiling(&self) -> u64 {
        self.max_deliver.min(self.dlq_max_attempts)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|s| s == "true" || s == "1")
        .unwrap_or(default)
}
