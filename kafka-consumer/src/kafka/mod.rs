// Kafka module - host client surface, rdkafka implementation and worker adapters
pub mod adapters;
pub mod client;
pub mod config;
pub mod message;
pub mod rdkafka_client;
pub mod types;

// Public API
pub use client::{Committer, KafkaClient, RebalanceEvent, RebalanceSender};
pub use config::ClientConfigBuilder;
pub use message::Message;
pub use rdkafka_client::RdKafkaClient;
pub use types::{Fetch, Record, RecordHeader, TopicPartition};
