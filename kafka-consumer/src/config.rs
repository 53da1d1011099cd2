use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;

use crate::error::ConfigError;
use crate::orchestrator::DeliveryMode;
use crate::processor::Processor;
use crate::runtime::TopicProcessor;

pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(45);
pub const DEFAULT_REBALANCE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_FETCH_MAX_BYTES: usize = 50 * 1024 * 1024;
pub const DEFAULT_MAX_POLL_RECORDS: usize = 500;

/// Client certificate, key and CA used for mTLS to the brokers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    /// Expected broker hostname, when it differs from the bootstrap address.
    pub server_name: Option<String>,
}

/// Configuration of one runtime instance: the group it joins, the topics it
/// subscribes to with their processors, and the host client's fetch sizing.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub brokers: Vec<String>,
    pub group_id: String,
    pub topics: Vec<TopicProcessor>,
    pub session_timeout: Duration,
    pub rebalance_timeout: Duration,
    pub fetch_max_bytes: usize,
    /// Fetches the pump may hold queued ahead of the event loop. `None` does
    /// not lift the bound in this queue: it keeps a single hand-off slot and
    /// leaves prefetching to the host client's own queue limits. `Some(n)`
    /// lets up to `n` fetches wait here.
    pub max_concurrent_fetches: Option<usize>,
    /// Upper bound on the records gathered by a single poll.
    pub max_poll_records: usize,
    pub tls: Option<TlsConfig>,
}

impl ConsumerConfig {
    pub fn new<S: Into<String>>(brokers: impl IntoIterator<Item = S>, group_id: &str) -> Self {
        Self {
            brokers: brokers.into_iter().map(Into::into).collect(),
            group_id: group_id.to_string(),
            topics: vec![],
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            rebalance_timeout: DEFAULT_REBALANCE_TIMEOUT,
            fetch_max_bytes: DEFAULT_FETCH_MAX_BYTES,
            max_concurrent_fetches: None,
            max_poll_records: DEFAULT_MAX_POLL_RECORDS,
            tls: None,
        }
    }

    pub fn with_topic(mut self, topic: TopicProcessor) -> Self {
        self.topics.push(topic);
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn with_rebalance_timeout(mut self, timeout: Duration) -> Self {
        self.rebalance_timeout = timeout;
        self
    }

    pub fn with_fetch_max_bytes(mut self, bytes: usize) -> Self {
        self.fetch_max_bytes = bytes;
        self
    }

    pub fn with_max_concurrent_fetches(mut self, fetches: usize) -> Self {
        self.max_concurrent_fetches = Some(fetches);
        self
    }

    pub fn with_max_poll_records(mut self, records: usize) -> Self {
        self.max_poll_records = records;
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn topic_names(&self) -> Vec<&str> {
        self.topics.iter().map(|t| t.topic.as_str()).collect()
    }

    /// Capacity of the channel between the fetch pump and the event loop.
    /// Unset means one slot; see [`ConsumerConfig::max_concurrent_fetches`].
    pub fn fetch_queue_capacity(&self) -> usize {
        self.max_concurrent_fetches.unwrap_or(1).max(1)
    }

    /// Rejects configurations the runtime cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topics.is_empty() {
            return Err(ConfigError::NoTopics);
        }

        let mut seen = HashSet::new();
        for topic in &self.topics {
            if topic.topic.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    name: "topic",
                    reason: "topic names must not be empty".to_string(),
                });
            }
            if !seen.insert(topic.topic.as_str()) {
                return Err(ConfigError::DuplicateTopic(topic.topic.clone()));
            }
        }

        if self.brokers.is_empty() {
            return Err(ConfigError::NoBrokers);
        }
        for broker in &self.brokers {
            validate_broker(broker)?;
        }

        if self.group_id.trim().is_empty() {
            return Err(ConfigError::EmptyGroupId);
        }

        if self.session_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                name: "session_timeout",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.rebalance_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                name: "rebalance_timeout",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.fetch_max_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                name: "fetch_max_bytes",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_concurrent_fetches == Some(0) {
            return Err(ConfigError::InvalidValue {
                name: "max_concurrent_fetches",
                reason: "must be greater than zero when set".to_string(),
            });
        }
        if self.max_poll_records == 0 {
            return Err(ConfigError::InvalidValue {
                name: "max_poll_records",
                reason: "must be greater than zero".to_string(),
            });
        }

        if let Some(tls) = &self.tls {
            validate_tls(tls)?;
        }

        Ok(())
    }
}

fn validate_broker(broker: &str) -> Result<(), ConfigError> {
    let malformed = || ConfigError::MalformedBroker(broker.to_string());
    let (host, port) = broker.trim().rsplit_once(':').ok_or_else(malformed)?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(malformed());
    }
    Ok(())
}

fn validate_tls(tls: &TlsConfig) -> Result<(), ConfigError> {
    if tls.cert_file.is_some() != tls.key_file.is_some() {
        return Err(ConfigError::IncompleteTlsKeyPair);
    }

    for path in [&tls.cert_file, &tls.key_file, &tls.ca_file]
        .into_iter()
        .flatten()
    {
        if !is_readable_file(path) {
            return Err(ConfigError::MissingTlsFile(path.display().to_string()));
        }
    }
    Ok(())
}

fn is_readable_file(path: &Path) -> bool {
    std::fs::File::open(path).is_ok_and(|f| f.metadata().is_ok_and(|m| m.is_file()))
}

/// A duration read from the environment: `45s`, `500ms`, `2m`, `1h`, or bare seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvDuration(pub Duration);

impl FromStr for EnvDuration {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let invalid = || ConfigError::InvalidDuration(s.to_string());

        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (amount, unit) = trimmed.split_at(split);
        let amount: u64 = amount.parse().map_err(|_| invalid())?;

        let duration = match unit.trim() {
            "" | "s" => Duration::from_secs(amount),
            "ms" => Duration::from_millis(amount),
            "m" => Duration::from_secs(amount.checked_mul(60).ok_or_else(invalid)?),
            "h" => Duration::from_secs(amount.checked_mul(3600).ok_or_else(invalid)?),
            _ => return Err(invalid()),
        };
        Ok(EnvDuration(duration))
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_brokers: String, // Comma-delimited host:port list

    #[envconfig(default = "kafka-consumer")]
    pub kafka_group_id: String,

    pub kafka_topic: String, // Comma-delimited, one processor per topic

    #[envconfig(default = "at_least_once")]
    pub kafka_delivery_semantics: DeliveryMode,

    #[envconfig(default = "45s")]
    pub kafka_session_timeout: EnvDuration,

    #[envconfig(default = "30s")]
    pub kafka_rebalance_timeout: EnvDuration,

    #[envconfig(default = "52428800")] // 50MiB
    pub kafka_fetch_max_bytes: usize,

    // Fetches queued between the poller and the event loop. Unset keeps a
    // single slot and relies on librdkafka's prefetch limits.
    pub kafka_max_concurrent_fetches: Option<usize>,

    #[envconfig(default = "500")]
    pub kafka_max_poll_records: usize,

    // TLS, enabled when any of the files or the server name is set
    pub kafka_tls_cert_file: Option<String>,
    pub kafka_tls_key_file: Option<String>,
    pub kafka_tls_ca_file: Option<String>,
    pub kafka_tls_server_name: Option<String>,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    // Telemetry
    pub otel_exporter_otlp_endpoint: Option<String>,

    #[envconfig(default = "kafka-consumer")]
    pub otel_service_name: String,

    #[envconfig(default = "30")] // 30 seconds
    pub shutdown_timeout_secs: u64,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    /// Get server bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn tls(&self) -> Option<TlsConfig> {
        let tls = TlsConfig {
            cert_file: self.kafka_tls_cert_file.as_deref().map(PathBuf::from),
            key_file: self.kafka_tls_key_file.as_deref().map(PathBuf::from),
            ca_file: self.kafka_tls_ca_file.as_deref().map(PathBuf::from),
            server_name: self.kafka_tls_server_name.clone(),
        };
        // a server name only makes sense over TLS, so it turns TLS on as well
        let enabled = tls.cert_file.is_some()
            || tls.key_file.is_some()
            || tls.ca_file.is_some()
            || tls.server_name.is_some();
        enabled.then_some(tls)
    }

    /// Builds the runtime configuration, attaching `processor` to every configured topic.
    pub fn to_consumer_config(&self, processor: Arc<dyn Processor>) -> ConsumerConfig {
        let mut config = ConsumerConfig::new(split_list(&self.kafka_brokers), &self.kafka_group_id)
            .with_session_timeout(self.kafka_session_timeout.0)
            .with_rebalance_timeout(self.kafka_rebalance_timeout.0)
            .with_fetch_max_bytes(self.kafka_fetch_max_bytes)
            .with_max_poll_records(self.kafka_max_poll_records);

        for topic in split_list(&self.kafka_topic) {
            config = config.with_topic(TopicProcessor::new(
                topic,
                processor.clone(),
                self.kafka_delivery_semantics,
            ));
        }
        if let Some(fetches) = self.kafka_max_concurrent_fetches {
            config = config.with_max_concurrent_fetches(fetches);
        }
        if let Some(tls) = self.tls() {
            config = config.with_tls(tls);
        }
        config
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
