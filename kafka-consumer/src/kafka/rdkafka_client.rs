//! rdkafka-backed host client.
//!
//! [`RuntimeContext`] turns librdkafka's synchronous rebalance callbacks into
//! rebalance events, [`KafkaCommitter`] commits through the shared consumer,
//! and [`RdKafkaClient`] polls records and groups them into fetches.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::FutureExt;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Headers, Message as _};
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConsumerConfig;
use crate::error::ConsumerError;
use crate::kafka::client::{Committer, KafkaClient, RebalanceSender};
use crate::kafka::config::ClientConfigBuilder;
use crate::kafka::types::{assignments_from_list, Fetch, Record, RecordHeader, TopicPartition};
use crate::metrics_consts::KAFKA_CLIENT_ERRORS;

type RuntimeConsumer = StreamConsumer<RuntimeContext>;

pub struct RuntimeContext {
    rebalance: RebalanceSender,
    /// Set right after the consumer is created; committers handed out on
    /// assignment commit through it.
    consumer: OnceLock<Weak<RuntimeConsumer>>,
}

impl RuntimeContext {
    pub fn new(rebalance: RebalanceSender) -> Self {
        Self {
            rebalance,
            consumer: OnceLock::new(),
        }
    }

    fn committer(&self) -> Arc<dyn Committer> {
        Arc::new(KafkaCommitter {
            consumer: self.consumer.get().cloned().unwrap_or_default(),
        })
    }
}

impl ClientContext for RuntimeContext {}

impl ConsumerContext for RuntimeContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                // cooperative-sticky triggers rebalances that move nothing
                if partitions.count() == 0 {
                    debug!("Skipping empty revoke rebalance (cooperative-sticky no-op)");
                    return;
                }

                let assignments = assignments_from_list(partitions);
                if base_consumer.assignment_lost() {
                    warn!("Lost {} partitions", partitions.count());
                    self.rebalance.on_lost(&assignments);
                } else {
                    info!("Revoking {} partitions", partitions.count());
                    self.rebalance.on_revoked(&assignments);
                }
            }
            Rebalance::Assign(partitions) => {
                debug!(
                    "Pre-rebalance assign event for {} partitions",
                    partitions.count()
                );
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Assign(partitions) = rebalance {
            if partitions.count() == 0 {
                debug!("Skipping empty assign rebalance (cooperative-sticky no-op)");
                return;
            }

            info!("Assigned {} partitions", partitions.count());
            self.rebalance
                .on_assigned(&assignments_from_list(partitions), self.committer());
        }
    }
}

/// Commits record offsets through the group consumer.
pub struct KafkaCommitter {
    consumer: Weak<RuntimeConsumer>,
}

#[async_trait]
impl Committer for KafkaCommitter {
    async fn commit_records(&self, records: &[Record]) -> Result<(), ConsumerError> {
        let next_offsets = next_offsets(records);
        let Some((first, _)) = next_offsets.iter().next() else {
            return Ok(());
        };
        let (topic, partition) = (first.topic().to_string(), first.partition());

        let mut list = TopicPartitionList::new();
        for (tp, next_offset) in &next_offsets {
            list.add_partition_offset(tp.topic(), tp.partition(), Offset::Offset(*next_offset))?;
        }

        let Some(consumer) = self.consumer.upgrade() else {
            return Err(ConsumerError::ClientClosed);
        };

        // a synchronous commit blocks on the broker round trip
        tokio::task::spawn_blocking(move || consumer.commit(&list, CommitMode::Sync))
            .await?
            .map_err(|source| ConsumerError::Commit {
                topic,
                partition,
                source,
            })
    }
}

/// The offset to commit per partition: one past the highest record offset.
fn next_offsets(records: &[Record]) -> BTreeMap<TopicPartition, i64> {
    let mut offsets = BTreeMap::new();
    for record in records {
        let next = offsets.entry(record.topic_partition()).or_insert(0);
        *next = (*next).max(record.offset + 1);
    }
    offsets
}

pub struct RdKafkaClient {
    consumer: Arc<RuntimeConsumer>,
    max_poll_records: usize,
    closed: CancellationToken,
}

impl RdKafkaClient {
    /// Creates the consumer and subscribes it to every configured topic.
    /// Rebalance notifications flow into `rebalance`.
    pub fn new(config: &ConsumerConfig, rebalance: RebalanceSender) -> Result<Self, ConsumerError> {
        let consumer: RuntimeConsumer = ClientConfigBuilder::from_consumer_config(config)
            .build()
            .create_with_context(RuntimeContext::new(rebalance))?;
        let consumer = Arc::new(consumer);

        if consumer
            .context()
            .consumer
            .set(Arc::downgrade(&consumer))
            .is_err()
        {
            warn!("Consumer handle was already registered with its context");
        }

        consumer.subscribe(&config.topic_names())?;
        info!(
            messaging.consumer.group.name = %config.group_id,
            "Subscribed to topics: {:?}",
            config.topic_names()
        );

        Ok(Self {
            consumer,
            max_poll_records: config.max_poll_records.max(1),
            closed: CancellationToken::new(),
        })
    }

    async fn recv_record(&self) -> Result<Record, ConsumerError> {
        let mut error_count = 0;
        loop {
            let received = tokio::select! {
                biased;

                _ = self.closed.cancelled() => return Err(ConsumerError::ClientClosed),
                received = self.consumer.recv() => received,
            };

            match received {
                Ok(message) => return Ok(record_from_message(&message)),
                Err(e) => {
                    error_count += 1;
                    if let Some(fatal) = handle_kafka_error(e, error_count).await {
                        return Err(fatal);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl KafkaClient for RdKafkaClient {
    async fn poll_fetches(&self) -> Result<Vec<Fetch>, ConsumerError> {
        if self.closed.is_cancelled() {
            return Err(ConsumerError::ClientClosed);
        }

        let mut records = vec![self.recv_record().await?];

        // drain what is already buffered without waiting for more
        while records.len() < self.max_poll_records {
            match self.consumer.recv().now_or_never() {
                Some(Ok(message)) => records.push(record_from_message(&message)),
                Some(Err(e)) => {
                    if is_fatal(&e) {
                        return Err(fatal_error(e));
                    }
                    debug!("Stopping drain on kafka error: {e}");
                    break;
                }
                None => break,
            }
        }

        Ok(group_into_fetches(records))
    }

    fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();

        info!("Closing kafka consumer, leaving the group");
        self.consumer.unsubscribe();
    }
}

fn record_from_message(message: &BorrowedMessage<'_>) -> Record {
    let timestamp = message
        .timestamp()
        .to_millis()
        .map(|ms| UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64))
        .unwrap_or_else(SystemTime::now);

    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|h| RecordHeader::new(h.key, h.value.unwrap_or_default()))
                .collect()
        })
        .unwrap_or_default();

    Record {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        timestamp,
        key: message.key().map(<[u8]>::to_vec).unwrap_or_default(),
        value: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        headers,
    }
}

/// Groups records into single-partition fetches, keeping each partition's
/// records in arrival order and the fetches in order of first appearance.
fn group_into_fetches(records: Vec<Record>) -> Vec<Fetch> {
    let mut fetches: Vec<Fetch> = vec![];
    let mut index: HashMap<TopicPartition, usize> = HashMap::new();

    for record in records {
        let tp = record.topic_partition();
        let slot = *index.entry(tp).or_insert_with(|| {
            fetches.push(Fetch::new(record.topic.clone(), record.partition, vec![]));
            fetches.len() - 1
        });
        fetches[slot].records.push(record);
    }
    fetches
}

fn is_fatal(e: &KafkaError) -> bool {
    match e {
        KafkaError::MessageConsumptionFatal(_) | KafkaError::Canceled => true,
        KafkaError::Global(code) => *code == RDKafkaErrorCode::Authentication,
        _ => false,
    }
}

fn fatal_error(e: KafkaError) -> ConsumerError {
    match e {
        KafkaError::Canceled => ConsumerError::ClientClosed,
        other => ConsumerError::Kafka(other),
    }
}

fn record_client_error(level: &'static str, kind: &'static str) {
    metrics::counter!(KAFKA_CLIENT_ERRORS, &[("level", level), ("error", kind)]).increment(1);
}

/// Logs a consumption error and backs off. Returns the error when polling cannot go on.
async fn handle_kafka_error(e: KafkaError, current_count: u64) -> Option<ConsumerError> {
    if is_fatal(&e) {
        if matches!(e, KafkaError::Canceled) {
            info!("Consumer canceled - shutting down");
            record_client_error("info", "canceled");
        } else {
            error!("Fatal Kafka consumer error: {e}");
            record_client_error("fatal", "consumer");
        }
        return Some(fatal_error(e));
    }

    match &e {
        KafkaError::MessageConsumption(code) => match code {
            RDKafkaErrorCode::PartitionEOF => record_client_error("info", "partition_eof"),
            RDKafkaErrorCode::OperationTimedOut => record_client_error("info", "op_timed_out"),
            RDKafkaErrorCode::OffsetOutOfRange => {
                // auto.offset.reset repositions the partition
                warn!("Offset out of range - seeking to configured offset reset policy");
                record_client_error("info", "offset_out_of_range");
                sleep(Duration::from_millis(500)).await;
            }
            _ => {
                warn!("Kafka consumer error: {code:?}");
                record_client_error("warn", "consumer");
                sleep(Duration::from_millis(100 * current_count.min(10))).await;
            }
        },

        KafkaError::Global(RDKafkaErrorCode::AllBrokersDown) => {
            warn!("All brokers down - waiting for reconnect");
            record_client_error("warn", "all_brokers_down");
            sleep(Duration::from_secs(current_count.min(5))).await;
        }

        KafkaError::Global(RDKafkaErrorCode::BrokerTransportFailure) => {
            warn!("Broker transport failure - waiting for reconnect");
            record_client_error("warn", "broker_transport");
            sleep(Duration::from_secs(current_count.min(3))).await;
        }

        KafkaError::Global(code) => {
            warn!("Global Kafka error: {code:?}");
            record_client_error("warn", "global");
            sleep(Duration::from_millis(500 * current_count.min(6))).await;
        }

        _ => {
            error!("Unexpected error: {e:?}");
            record_client_error("warn", "unexpected");
            sleep(Duration::from_millis(100 * current_count.min(10))).await;
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::record;

    #[test]
    fn test_group_into_fetches_keeps_arrival_order() {
        let records = vec![
            record("orders", 1, 10),
            record("orders", 0, 3),
            record("orders", 1, 11),
            record("payments", 0, 7),
            record("orders", 0, 4),
        ];

        let fetches = group_into_fetches(records);

        let summary: Vec<(String, Vec<i64>)> = fetches
            .iter()
            .map(|f| {
                (
                    f.topic_partition().to_string(),
                    f.records.iter().map(|r| r.offset).collect(),
                )
            })
            .collect();
        assert_eq!(
            summary,
            vec![
                ("orders:1".to_string(), vec![10, 11]),
                ("orders:0".to_string(), vec![3, 4]),
                ("payments:0".to_string(), vec![7]),
            ]
        );
    }

    #[test]
    fn test_next_offsets_is_one_past_max() {
        let records = vec![
            record("orders", 0, 5),
            record("orders", 0, 6),
            record("orders", 2, 40),
            record("orders", 0, 7),
        ];

        let offsets = next_offsets(&records);
        assert_eq!(offsets[&TopicPartition::new("orders", 0)], 8);
        assert_eq!(offsets[&TopicPartition::new("orders", 2)], 41);
    }

    #[test]
    fn test_fatal_classification() {
        assert!(is_fatal(&KafkaError::Canceled));
        assert!(is_fatal(&KafkaError::MessageConsumptionFatal(
            RDKafkaErrorCode::Fatal
        )));
        assert!(is_fatal(&KafkaError::Global(RDKafkaErrorCode::Authentication)));
        assert!(!is_fatal(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::PartitionEOF
        )));
        assert!(!is_fatal(&KafkaError::Global(
            RDKafkaErrorCode::AllBrokersDown
        )));

        assert!(matches!(
            fatal_error(KafkaError::Canceled),
            ConsumerError::ClientClosed
        ));
    }

    #[tokio::test]
    async fn test_transient_errors_are_absorbed() {
        let absorbed = handle_kafka_error(
            KafkaError::MessageConsumption(RDKafkaErrorCode::PartitionEOF),
            1,
        )
        .await;
        assert!(absorbed.is_none());

        let fatal = handle_kafka_error(
            KafkaError::MessageConsumptionFatal(RDKafkaErrorCode::Fatal),
            1,
        )
        .await;
        assert!(matches!(fatal, Some(ConsumerError::Kafka(_))));
    }
}
