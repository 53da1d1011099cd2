use rdkafka::error::KafkaError;
use thiserror::Error;

/// Errors surfaced by the consumer runtime.
///
/// Transport failures from the host client are carried as `Kafka` or `Commit`,
/// cancellation of the root token is `Cancelled`, and anything that prevents the
/// runtime from starting is a `Config` error.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("failed to commit offsets for {topic}:{partition}: {source}")]
    Commit {
        topic: String,
        partition: i32,
        #[source]
        source: KafkaError,
    },

    #[error("consumer cancelled")]
    Cancelled,

    #[error("kafka client closed")]
    ClientClosed,

    #[error("partition worker for {topic}:{partition} panicked")]
    WorkerPanicked { topic: String, partition: i32 },

    #[error("runtime task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),

    #[error("no processor registered for topic {0}")]
    UnknownTopic(String),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl ConsumerError {
    /// Cancellation and client shutdown are orderly exits, not failures.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ConsumerError::Cancelled | ConsumerError::ClientClosed)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("at least one topic must be configured")]
    NoTopics,

    #[error("at least one broker must be configured")]
    NoBrokers,

    #[error("malformed broker address '{0}', expected host:port")]
    MalformedBroker(String),

    #[error("consumer group id must not be empty")]
    EmptyGroupId,

    #[error("topic '{0}' is configured more than once")]
    DuplicateTopic(String),

    #[error("TLS file '{0}' is not readable")]
    MissingTlsFile(String),

    #[error("TLS certificate and key must be configured together")]
    IncompleteTlsKeyPair,

    #[error("invalid duration '{0}'")]
    InvalidDuration(String),

    #[error("invalid delivery semantics '{0}', expected at_least_once or at_most_once")]
    InvalidDeliveryMode(String),

    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },
}
