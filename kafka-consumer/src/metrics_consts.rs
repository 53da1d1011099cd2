// ==== Stable consumer metrics ====
/// Counter incremented once per record after the processor returns, regardless of outcome
pub const MESSAGES_PROCESSED: &str = "messaging.client.messages.processed";

/// Counter incremented by the number of records whose offsets were committed
pub const MESSAGES_COMMITTED: &str = "messaging.client.messages.committed";

/// Counter incremented once per record whose processor returned a failure
pub const PROCESSING_FAILURES: &str = "messaging.client.processing.failures";

// ==== Labels ====
pub const LABEL_DESTINATION_NAME: &str = "messaging.destination.name";
pub const LABEL_PARTITION_ID: &str = "messaging.destination.partition.id";
pub const LABEL_DELIVERY_SEMANTICS: &str = "delivery.semantics";
pub const LABEL_ERROR_TYPE: &str = "error.type";

// ==== Operational metrics ====
/// Histogram of processor call duration in seconds
pub const PROCESS_DURATION: &str = "messaging.client.process.duration";

/// Counter for partitions handed to this consumer
pub const PARTITIONS_ASSIGNED: &str = "messaging.client.partitions.assigned";

/// Counter for partitions relinquished through a graceful revocation
pub const PARTITIONS_REVOKED: &str = "messaging.client.partitions.revoked";

/// Counter for partitions taken away involuntarily (session timeout, fencing)
pub const PARTITIONS_LOST: &str = "messaging.client.partitions.lost";

/// Gauge for partitions that currently have a running worker
pub const PARTITIONS_LIVE: &str = "messaging.client.partitions.live";

/// Counter for fetches dropped because their partition had no live worker
pub const FETCHES_DROPPED: &str = "messaging.client.fetches.dropped";

/// Counter for errors surfaced by the host client while polling, labelled by level and kind
pub const KAFKA_CLIENT_ERRORS: &str = "messaging.client.kafka.errors";
