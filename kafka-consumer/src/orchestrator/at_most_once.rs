use std::sync::Arc;

use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::ConsumerError;
use crate::kafka::adapters::{Acknowledger, FetchConsumer};
use crate::kafka::message::Message;
use crate::kafka::types::TopicPartition;
use crate::orchestrator::{DeliveryMode, MessageHandler, PartitionOrchestrator, PartitionTask};
use crate::processor::Processor;
use crate::telemetry::ConsumerMetrics;

/// Commit-then-process. Each record is processed at most once; a record whose
/// commit succeeded but whose processing failed, or never finished, is lost.
///
/// Records of a committed fetch can no longer be redelivered, so they are
/// processed concurrently. The next fetch is only committed once the previous
/// batch finished, so fetches are committed one at a time, in offset order.
pub struct AtMostOnceOrchestrator {
    group_id: Arc<str>,
    processor: Arc<dyn Processor>,
}

impl AtMostOnceOrchestrator {
    pub fn new(group_id: &str, processor: Arc<dyn Processor>) -> Self {
        Self {
            group_id: Arc::from(group_id),
            processor,
        }
    }
}

impl PartitionOrchestrator for AtMostOnceOrchestrator {
    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::AtMostOnce
    }

    fn partition_worker(
        &self,
        topic_partition: TopicPartition,
        consumer: Box<dyn FetchConsumer>,
        acknowledger: Arc<dyn Acknowledger>,
        cancel: CancellationToken,
    ) -> PartitionTask {
        let metrics = ConsumerMetrics::for_partition(&topic_partition, DeliveryMode::AtMostOnce);
        let worker = AtMostOnceWorker {
            topic_partition,
            handler: Arc::new(MessageHandler::new(
                self.group_id.clone(),
                self.processor.clone(),
                metrics,
            )),
            consumer,
            acknowledger,
            cancel,
            in_flight: JoinSet::new(),
        };
        Box::pin(worker.run())
    }
}

struct AtMostOnceWorker {
    topic_partition: TopicPartition,
    handler: Arc<MessageHandler>,
    consumer: Box<dyn FetchConsumer>,
    acknowledger: Arc<dyn Acknowledger>,
    cancel: CancellationToken,
    in_flight: JoinSet<()>,
}

impl AtMostOnceWorker {
    async fn run(mut self) -> Result<(), ConsumerError> {
        info!(
            "Starting at-most-once partition worker for {}",
            self.topic_partition
        );

        let result = self.consume_and_dispatch().await;

        // already-committed records get to finish (or observe cancellation)
        if !self.in_flight.is_empty() {
            debug!(
                "Waiting for {} in-flight messages on {}",
                self.in_flight.len(),
                self.topic_partition
            );
        }
        let mut drained = Ok(());
        while let Some(joined) = self.in_flight.join_next().await {
            if let Err(e) = self.check_joined(joined) {
                drained = drained.and(Err(e));
            }
        }

        info!("At-most-once worker for {} exiting", self.topic_partition);
        result.and(drained)
    }

    /// Waits for the previous batch before taking the next fetch, so a slow
    /// processor holds back consumption and only one committed batch is ever
    /// in flight.
    async fn await_batch(&mut self) -> Result<(), ConsumerError> {
        while let Some(joined) = self.in_flight.join_next().await {
            self.check_joined(joined)?;
        }
        Ok(())
    }

    fn check_joined(&self, joined: Result<(), JoinError>) -> Result<(), ConsumerError> {
        match joined {
            Ok(()) => Ok(()),
            Err(e) if e.is_panic() => {
                error!(
                    messaging.destination.name = %self.topic_partition.topic(),
                    messaging.destination.partition.id = self.topic_partition.partition(),
                    "processor panicked on a committed record"
                );
                Err(ConsumerError::WorkerPanicked {
                    topic: self.topic_partition.topic().to_string(),
                    partition: self.topic_partition.partition(),
                })
            }
            Err(e) => Err(ConsumerError::TaskFailed(e)),
        }
    }

    async fn consume_and_dispatch(&mut self) -> Result<(), ConsumerError> {
        loop {
            self.await_batch().await?;

            let Some(fetch) = self.consumer.consume(&self.cancel).await? else {
                return Ok(());
            };

            if let Err(e) = self
                .acknowledger
                .acknowledge(&self.cancel, &fetch.records)
                .await
            {
                if !e.is_cancellation() {
                    error!(
                        messaging.destination.name = %fetch.topic,
                        messaging.destination.partition.id = fetch.partition,
                        messaging.kafka.offset = fetch.first_offset().unwrap_or_default(),
                        error = %e,
                        "failed to commit fetched records, skipping their processing"
                    );
                }
                return Err(e);
            }

            self.handler.metrics().record_committed(fetch.len());

            for record in fetch.records {
                let handler = self.handler.clone();
                let cancel = self.cancel.clone();
                self.in_flight.spawn(async move {
                    handler.handle(&cancel, Message::from(record)).await;
                });
            }
        }
    }
}
