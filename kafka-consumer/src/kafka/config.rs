use std::time::Duration;

use rdkafka::ClientConfig;
use tracing::info;

use crate::config::{ConsumerConfig, TlsConfig};

/// librdkafka refuses a receive buffer smaller than `fetch.max.bytes + 512`.
const RECEIVE_MESSAGE_OVERHEAD: usize = 512;
const DEFAULT_RECEIVE_MESSAGE_MAX_BYTES: usize = 100_000_000;

/// librdkafka configuration builder for the runtime's group consumer.
///
/// `new` sets the settings the runtime depends on: manual commits only,
/// cooperative-sticky assignment and earliest reset for new groups. The
/// `with_*` methods layer the tunables of a [`ConsumerConfig`] on top.
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id);

        // offsets only move through explicit commits from partition workers
        config
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("partition.assignment.strategy", "cooperative-sticky")
            .set("auto.offset.reset", "earliest")
            .set("socket.timeout.ms", "10000");

        Self { config }
    }

    pub fn from_consumer_config(consumer: &ConsumerConfig) -> Self {
        let mut builder = Self::new(&consumer.brokers.join(","), &consumer.group_id)
            .with_session_timeout(consumer.session_timeout)
            .with_rebalance_timeout(consumer.rebalance_timeout, consumer.session_timeout)
            .with_fetch_max_bytes(consumer.fetch_max_bytes);

        if let Some(tls) = &consumer.tls {
            builder = builder.with_tls(tls);
        }
        builder
    }

    /// How long the broker waits for heartbeats before declaring this member dead.
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.config
            .set("session.timeout.ms", timeout.as_millis().to_string());
        self
    }

    /// Maps the rebalance timeout onto `max.poll.interval.ms`, the bound librdkafka
    /// places on rejoining the group. It may not be lower than the session timeout.
    pub fn with_rebalance_timeout(mut self, timeout: Duration, session_timeout: Duration) -> Self {
        let effective = timeout.max(session_timeout);
        if effective != timeout {
            info!(
                "Raising rebalance timeout from {:?} to the session timeout {:?}",
                timeout, session_timeout
            );
        }
        self.config
            .set("max.poll.interval.ms", effective.as_millis().to_string());
        self
    }

    /// Set maximum bytes to fetch from broker in a single request
    pub fn with_fetch_max_bytes(mut self, bytes: usize) -> Self {
        let receive_max =
            DEFAULT_RECEIVE_MESSAGE_MAX_BYTES.max(bytes.saturating_add(RECEIVE_MESSAGE_OVERHEAD));
        self.config
            .set("fetch.max.bytes", bytes.to_string())
            .set("receive.message.max.bytes", receive_max.to_string());
        self
    }

    /// Enable TLS, with client certificate and CA when configured
    pub fn with_tls(mut self, tls: &TlsConfig) -> Self {
        self.config.set("security.protocol", "ssl");

        if let Some(cert) = &tls.cert_file {
            self.config
                .set("ssl.certificate.location", cert.display().to_string());
        }
        if let Some(key) = &tls.key_file {
            self.config
                .set("ssl.key.location", key.display().to_string());
        }
        if let Some(ca) = &tls.ca_file {
            self.config.set("ssl.ca.location", ca.display().to_string());
        }
        // librdkafka has no SNI override; a configured server name turns on
        // hostname verification of the broker certificates instead
        if tls.server_name.is_some() {
            self.config
                .set("ssl.endpoint.identification.algorithm", "https");
        }
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}
