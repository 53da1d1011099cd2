//! Runtime driver: wires a host client to the event loop, runs the fetch pump
//! next to it, and tears both down on cancellation or failure.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConsumerConfig;
use crate::error::{ConfigError, ConsumerError};
use crate::event_loop::EventLoop;
use crate::kafka::client::{rebalance_channel, KafkaClient, RebalanceReceiver};
use crate::kafka::rdkafka_client::RdKafkaClient;
use crate::kafka::types::Fetch;
use crate::orchestrator::{orchestrator_for, DeliveryMode, PartitionOrchestrator};
use crate::processor::Processor;

/// A subscribed topic together with the processor and delivery mode its
/// records are handled with.
#[derive(Clone)]
pub struct TopicProcessor {
    pub topic: String,
    pub processor: Arc<dyn Processor>,
    pub delivery_mode: DeliveryMode,
}

impl TopicProcessor {
    pub fn new(
        topic: impl Into<String>,
        processor: Arc<dyn Processor>,
        delivery_mode: DeliveryMode,
    ) -> Self {
        Self {
            topic: topic.into(),
            processor,
            delivery_mode,
        }
    }

    pub fn at_least_once(topic: impl Into<String>, processor: Arc<dyn Processor>) -> Self {
        Self::new(topic, processor, DeliveryMode::AtLeastOnce)
    }

    pub fn at_most_once(topic: impl Into<String>, processor: Arc<dyn Processor>) -> Self {
        Self::new(topic, processor, DeliveryMode::AtMostOnce)
    }
}

impl fmt::Debug for TopicProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicProcessor")
            .field("topic", &self.topic)
            .field("delivery_mode", &self.delivery_mode)
            .finish_non_exhaustive()
    }
}

pub struct Runtime<C: KafkaClient> {
    client: Arc<C>,
    event_loop: EventLoop,
    fetches: mpsc::Sender<Fetch>,
    cancel: CancellationToken,
}

impl Runtime<RdKafkaClient> {
    /// Validates `config`, builds the rdkafka client with its rebalance
    /// callbacks wired to a new event loop, and subscribes to the topics.
    pub fn connect(
        config: &ConsumerConfig,
        cancel: CancellationToken,
    ) -> Result<Self, ConsumerError> {
        config.validate()?;

        let (rebalance_tx, rebalance_rx) = rebalance_channel();
        let client = Arc::new(RdKafkaClient::new(config, rebalance_tx)?);
        Self::new(client, rebalance_rx, config, cancel)
    }
}

impl<C: KafkaClient> Runtime<C> {
    /// Builds a runtime over an existing client. `rebalance` must be the
    /// receiving half of the channel whose sender the client reports to.
    pub fn new(
        client: Arc<C>,
        rebalance: RebalanceReceiver,
        config: &ConsumerConfig,
        cancel: CancellationToken,
    ) -> Result<Self, ConsumerError> {
        if config.topics.is_empty() {
            return Err(ConfigError::NoTopics.into());
        }

        let mut orchestrators: HashMap<String, Arc<dyn PartitionOrchestrator>> = HashMap::new();
        for topic in &config.topics {
            let orchestrator =
                orchestrator_for(topic.delivery_mode, &config.group_id, topic.processor.clone());
            if orchestrators
                .insert(topic.topic.clone(), orchestrator)
                .is_some()
            {
                return Err(ConfigError::DuplicateTopic(topic.topic.clone()).into());
            }
        }

        let (fetches_tx, fetches_rx) = mpsc::channel(config.fetch_queue_capacity());
        let event_loop = EventLoop::new(
            &config.group_id,
            orchestrators,
            fetches_rx,
            rebalance,
            cancel.clone(),
        );

        Ok(Self {
            client,
            event_loop,
            fetches: fetches_tx,
            cancel,
        })
    }

    /// Runs until the cancellation token fires or a fatal error occurs.
    ///
    /// Returns `Ok(())` on a clean shutdown, otherwise the first failure of the
    /// event loop (worker errors included) or of the fetch pump.
    pub async fn run(self) -> Result<(), ConsumerError> {
        let Runtime {
            client,
            event_loop,
            fetches,
            cancel,
        } = self;

        info!("Starting kafka consumer runtime");
        crate::telemetry::describe_metrics();

        let pump = tokio::spawn(fetch_pump(client.clone(), fetches, cancel.clone()));
        let event_loop = tokio::spawn(event_loop.run());

        // the event loop ends on cancellation, on a worker failure, or once the
        // pump is gone; it has drained every worker by the time it returns
        let loop_result = match event_loop.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "event loop task failed");
                Err(ConsumerError::TaskFailed(e))
            }
        };

        cancel.cancel();
        client.close();

        let pump_result = match pump.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "fetch pump task failed");
                Err(ConsumerError::TaskFailed(e))
            }
        };

        match (loop_result, pump_result) {
            (Err(e), _) if !e.is_cancellation() => Err(e),
            (_, Err(e)) if !e.is_cancellation() => Err(e),
            _ => {
                info!("Kafka consumer runtime stopped cleanly");
                Ok(())
            }
        }
    }
}

/// Polls the client and hands each fetch to the event loop, one at a time.
async fn fetch_pump<C: KafkaClient>(
    client: Arc<C>,
    fetches: mpsc::Sender<Fetch>,
    cancel: CancellationToken,
) -> Result<(), ConsumerError> {
    loop {
        let polled = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("Fetch pump cancelled");
                return Ok(());
            }
            polled = client.poll_fetches() => polled,
        };

        let batch = match polled {
            Ok(batch) => batch,
            Err(e) if e.is_cancellation() => {
                info!("Kafka client closed, fetch pump exiting");
                return Ok(());
            }
            Err(e) => {
                error!(error = %e, "failed to poll fetches from kafka");
                return Err(e);
            }
        };

        for fetch in batch {
            if fetch.is_empty() {
                continue;
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Fetch pump cancelled while handing off a fetch");
                    return Ok(());
                }
                sent = fetches.send(fetch) => {
                    if sent.is_err() {
                        warn!("Event loop is gone, fetch pump exiting");
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::kafka::types::TopicPartition;
    use crate::test_utils::{MemoryBroker, MemoryClient, RecordingProcessor};

    const GROUP: &str = "runtime-unit";

    #[tokio::test]
    async fn test_runtime_rejects_empty_topics() {
        let broker = MemoryBroker::new();
        let (tx, rx) = rebalance_channel();
        let client = Arc::new(MemoryClient::new(broker, GROUP, tx));

        let result = Runtime::new(
            client,
            rx,
            &ConsumerConfig::new(["localhost:9092"], GROUP),
            CancellationToken::new(),
        );
        assert!(matches!(
            result,
            Err(ConsumerError::Config(ConfigError::NoTopics))
        ));
    }

    #[tokio::test]
    async fn test_runtime_consumes_and_shuts_down_cleanly() {
        let topic = "runtime-clean";
        let broker = MemoryBroker::new();
        for i in 0..5 {
            broker.produce(topic, 0, &format!("m{i}"));
        }
        let processor = Arc::new(RecordingProcessor::new(broker.sequence()));

        let (tx, rx) = rebalance_channel();
        let client = Arc::new(MemoryClient::new(broker.clone(), GROUP, tx));
        let cancel = CancellationToken::new();
        let config = ConsumerConfig::new(["localhost:9092"], GROUP)
            .with_topic(TopicProcessor::at_least_once(topic, processor.clone()));

        let runtime = Runtime::new(client.clone(), rx, &config, cancel.clone()).unwrap();
        let handle = tokio::spawn(runtime.run());

        client.assign(topic, &[0]);
        for _ in 0..1000 {
            if broker.committed_offset(GROUP, &TopicPartition::new(topic, 0)) == Some(5) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("runtime stops in time")
            .unwrap();

        assert!(result.is_ok());
        assert!(client.is_closed());
        assert_eq!(processor.values(), vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[test]
    fn test_topic_processor_debug_omits_processor() {
        let tp = TopicProcessor::at_most_once(
            "orders",
            Arc::new(RecordingProcessor::new(Default::default())),
        );
        assert_eq!(
            format!("{tp:?}"),
            "TopicProcessor { topic: \"orders\", delivery_mode: AtMostOnce, .. }"
        );
    }
}
