//! Partition orchestrators: one per subscribed topic, each building a worker
//! task for every live assignment of one of the topic's partitions.
//!
//! The delivery mode picks the implementation:
//! - [`AtLeastOnceOrchestrator`] processes a fetch, then commits it.
//! - [`AtMostOnceOrchestrator`] commits a fetch, then processes it concurrently.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{error, Instrument};

use crate::error::{ConfigError, ConsumerError};
use crate::kafka::adapters::{Acknowledger, FetchConsumer};
use crate::kafka::message::Message;
use crate::kafka::types::TopicPartition;
use crate::processor::Processor;
use crate::telemetry::{self, ConsumerMetrics};

pub mod at_least_once;
pub mod at_most_once;

pub use at_least_once::AtLeastOnceOrchestrator;
pub use at_most_once::AtMostOnceOrchestrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryMode {
    AtLeastOnce,
    AtMostOnce,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::AtLeastOnce => "at_least_once",
            DeliveryMode::AtMostOnce => "at_most_once",
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "at_least_once" => Ok(DeliveryMode::AtLeastOnce),
            "at_most_once" => Ok(DeliveryMode::AtMostOnce),
            _ => Err(ConfigError::InvalidDeliveryMode(s.to_string())),
        }
    }
}

/// A partition worker: runs until its fetch source reports end-of-queue, the
/// runtime is cancelled, or a commit fails.
pub type PartitionTask = BoxFuture<'static, Result<(), ConsumerError>>;

pub trait PartitionOrchestrator: Send + Sync {
    fn delivery_mode(&self) -> DeliveryMode;

    fn partition_worker(
        &self,
        topic_partition: TopicPartition,
        consumer: Box<dyn FetchConsumer>,
        acknowledger: Arc<dyn Acknowledger>,
        cancel: CancellationToken,
    ) -> PartitionTask;
}

pub fn orchestrator_for(
    mode: DeliveryMode,
    group_id: &str,
    processor: Arc<dyn Processor>,
) -> Arc<dyn PartitionOrchestrator> {
    match mode {
        DeliveryMode::AtLeastOnce => Arc::new(AtLeastOnceOrchestrator::new(group_id, processor)),
        DeliveryMode::AtMostOnce => Arc::new(AtMostOnceOrchestrator::new(group_id, processor)),
    }
}

/// Runs the processor for one message inside its span and records the outcome.
/// Processor failures end here: they are logged and counted, never returned.
pub(crate) struct MessageHandler {
    group_id: Arc<str>,
    processor: Arc<dyn Processor>,
    metrics: ConsumerMetrics,
}

impl MessageHandler {
    pub(crate) fn new(
        group_id: Arc<str>,
        processor: Arc<dyn Processor>,
        metrics: ConsumerMetrics,
    ) -> Self {
        Self {
            group_id,
            processor,
            metrics,
        }
    }

    pub(crate) fn metrics(&self) -> &ConsumerMetrics {
        &self.metrics
    }

    pub(crate) async fn handle(&self, cancel: &CancellationToken, message: Message) {
        let span = telemetry::process_span(&self.group_id, &message);
        let started = Instant::now();

        let result = self
            .processor
            .process(cancel, &message)
            .instrument(span.clone())
            .await;

        self.metrics.record_processed(started.elapsed());

        if let Err(e) = result {
            telemetry::record_span_failure(&span, &e);
            self.metrics.record_failure(e.kind());
            error!(
                parent: &span,
                messaging.consumer.group.name = %self.group_id,
                messaging.destination.name = %message.topic,
                messaging.destination.partition.id = message.partition,
                messaging.kafka.offset = message.offset,
                error = %e,
                "failed to process message"
            );
        }
    }
}
