use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::ConsumerError;
use crate::kafka::adapters::{Acknowledger, FetchConsumer};
use crate::kafka::message::Message;
use crate::kafka::types::TopicPartition;
use crate::orchestrator::{DeliveryMode, MessageHandler, PartitionOrchestrator, PartitionTask};
use crate::processor::Processor;
use crate::telemetry::ConsumerMetrics;

/// Process-then-commit. A record whose processor call succeeded is never lost,
/// but records can be redelivered, so the processor must be idempotent.
pub struct AtLeastOnceOrchestrator {
    group_id: Arc<str>,
    processor: Arc<dyn Processor>,
}

impl AtLeastOnceOrchestrator {
    pub fn new(group_id: &str, processor: Arc<dyn Processor>) -> Self {
        Self {
            group_id: Arc::from(group_id),
            processor,
        }
    }
}

impl PartitionOrchestrator for AtLeastOnceOrchestrator {
    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::AtLeastOnce
    }

    fn partition_worker(
        &self,
        topic_partition: TopicPartition,
        consumer: Box<dyn FetchConsumer>,
        acknowledger: Arc<dyn Acknowledger>,
        cancel: CancellationToken,
    ) -> PartitionTask {
        let metrics = ConsumerMetrics::for_partition(&topic_partition, DeliveryMode::AtLeastOnce);
        let worker = AtLeastOnceWorker {
            topic_partition,
            handler: MessageHandler::new(self.group_id.clone(), self.processor.clone(), metrics),
            consumer,
            acknowledger,
            cancel,
        };
        Box::pin(worker.run())
    }
}

struct AtLeastOnceWorker {
    topic_partition: TopicPartition,
    handler: MessageHandler,
    consumer: Box<dyn FetchConsumer>,
    acknowledger: Arc<dyn Acknowledger>,
    cancel: CancellationToken,
}

impl AtLeastOnceWorker {
    async fn run(mut self) -> Result<(), ConsumerError> {
        info!(
            "Starting at-least-once partition worker for {}",
            self.topic_partition
        );

        loop {
            let Some(fetch) = self.consumer.consume(&self.cancel).await? else {
                info!(
                    "Partition {} reached end of queue, worker exiting",
                    self.topic_partition
                );
                return Ok(());
            };

            for record in &fetch.records {
                if self.cancel.is_cancelled() {
                    return Err(ConsumerError::Cancelled);
                }
                // failures are absorbed: skipping the commit would stall the
                // partition behind a single bad record
                self.handler
                    .handle(&self.cancel, Message::from(record))
                    .await;
            }

            if let Err(e) = self
                .acknowledger
                .acknowledge(&self.cancel, &fetch.records)
                .await
            {
                if !e.is_cancellation() {
                    error!(
                        messaging.destination.name = %fetch.topic,
                        messaging.destination.partition.id = fetch.partition,
                        messaging.kafka.offset = fetch.last_offset().unwrap_or_default(),
                        error = %e,
                        "failed to commit processed records, batch will be redelivered"
                    );
                }
                return Err(e);
            }

            self.handler.metrics().record_committed(fetch.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::adapters::CommitAcknowledger;
    use crate::metrics_consts::*;
    use crate::processor::FailureKind;
    use crate::telemetry::test_metrics::counter_value;
    use crate::test_utils::{fetch_of, MemoryBroker, QueueConsumer, RecordingProcessor};

    const GROUP: &str = "alo-unit";

    fn worker_for(
        broker: &Arc<MemoryBroker>,
        processor: Arc<RecordingProcessor>,
        fetches: Vec<crate::kafka::types::Fetch>,
        cancel: CancellationToken,
        topic: &str,
    ) -> PartitionTask {
        let orchestrator = AtLeastOnceOrchestrator::new(GROUP, processor);
        orchestrator.partition_worker(
            TopicPartition::new(topic, 0),
            Box::new(QueueConsumer::new(fetches)),
            Arc::new(CommitAcknowledger::new(broker.committer(GROUP))),
            cancel,
        )
    }

    #[tokio::test]
    async fn test_processes_in_order_then_commits_each_fetch() {
        crate::telemetry::test_metrics::snapshotter();
        let topic = "alo-in-order";
        let broker = MemoryBroker::new();
        let processor = Arc::new(RecordingProcessor::new(broker.sequence()));

        let fetches = vec![fetch_of(topic, 0, 0..4), fetch_of(topic, 0, 4..10)];
        worker_for(
            &broker,
            processor.clone(),
            fetches,
            CancellationToken::new(),
            topic,
        )
        .await
        .unwrap();

        assert_eq!(processor.offsets(), (0..10).collect::<Vec<_>>());

        let commits = broker.commits_for(topic, 0);
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].offsets, vec![0, 1, 2, 3]);
        assert_eq!(commits[1].offsets, vec![4, 5, 6, 7, 8, 9]);
        assert_eq!(
            broker.committed_offset(GROUP, &TopicPartition::new(topic, 0)),
            Some(10)
        );

        // every record of a fetch is processed before that fetch is committed
        let processed = processor.processed();
        assert!(processed[3].seq < commits[0].seq);
        assert!(commits[0].seq < processed[4].seq);

        let labels = [
            (LABEL_DESTINATION_NAME, topic),
            (LABEL_DELIVERY_SEMANTICS, "at_least_once"),
        ];
        assert_eq!(counter_value(MESSAGES_PROCESSED, &labels), 10);
        assert_eq!(counter_value(MESSAGES_COMMITTED, &labels), 10);
        assert_eq!(counter_value(PROCESSING_FAILURES, &labels), 0);
    }

    #[tokio::test]
    async fn test_processor_failures_do_not_skip_commit() {
        crate::telemetry::test_metrics::snapshotter();
        let topic = "alo-failures";
        let broker = MemoryBroker::new();
        let processor = Arc::new(
            RecordingProcessor::new(broker.sequence())
                .failing_when(|m| (m.offset % 2 == 1).then_some(FailureKind::Validation)),
        );

        worker_for(
            &broker,
            processor.clone(),
            vec![fetch_of(topic, 0, 0..6)],
            CancellationToken::new(),
            topic,
        )
        .await
        .unwrap();

        assert_eq!(processor.offsets(), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(
            broker.committed_offset(GROUP, &TopicPartition::new(topic, 0)),
            Some(6)
        );

        assert_eq!(
            counter_value(
                PROCESSING_FAILURES,
                &[
                    (LABEL_DESTINATION_NAME, topic),
                    (LABEL_ERROR_TYPE, "validation")
                ]
            ),
            3
        );
        assert_eq!(
            counter_value(MESSAGES_PROCESSED, &[(LABEL_DESTINATION_NAME, topic)]),
            6
        );
    }

    #[tokio::test]
    async fn test_commit_failure_stops_worker() {
        let topic = "alo-commit-failure";
        let broker = MemoryBroker::new();
        let processor = Arc::new(RecordingProcessor::new(broker.sequence()));
        broker.fail_next_commits(1);

        let result = worker_for(
            &broker,
            processor.clone(),
            vec![fetch_of(topic, 0, 0..3), fetch_of(topic, 0, 3..6)],
            CancellationToken::new(),
            topic,
        )
        .await;

        assert!(matches!(result, Err(ConsumerError::Commit { .. })));
        // the second fetch is never touched
        assert_eq!(processor.offsets(), vec![0, 1, 2]);
        assert_eq!(
            broker.committed_offset(GROUP, &TopicPartition::new(topic, 0)),
            None
        );
    }

    #[tokio::test]
    async fn test_cancellation_stops_before_commit() {
        let topic = "alo-cancel";
        let broker = MemoryBroker::new();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let processor = Arc::new(RecordingProcessor::new(broker.sequence()).on_process(
            move |m| {
                if m.offset == 1 {
                    trigger.cancel();
                }
            },
        ));

        let result = worker_for(
            &broker,
            processor.clone(),
            vec![fetch_of(topic, 0, 0..5)],
            cancel,
            topic,
        )
        .await;

        assert!(matches!(result, Err(ConsumerError::Cancelled)));
        assert_eq!(processor.offsets(), vec![0, 1]);
        assert!(broker.commits_for(topic, 0).is_empty());
    }
}
