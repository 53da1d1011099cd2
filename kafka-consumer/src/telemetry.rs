//! Telemetry sidecar for the partition workers: counters keyed by
//! `{topic, partition, delivery semantics}` and one consumer span per record.

use std::time::Duration;

use metrics::Unit;
use opentelemetry::propagation::Extractor;
use opentelemetry::trace::{SpanContext, TraceContextExt};
use tracing::{field, info_span, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::kafka::message::Message;
use crate::kafka::types::{RecordHeader, TopicPartition};
use crate::metrics_consts::*;
use crate::orchestrator::DeliveryMode;
use crate::processor::{FailureKind, ProcessorError};

/// Registers units and descriptions for the stable counters. Safe to call more than once.
pub fn describe_metrics() {
    metrics::describe_counter!(
        MESSAGES_PROCESSED,
        Unit::Count,
        "Messages handed to a processor, regardless of outcome ({message})"
    );
    metrics::describe_counter!(
        MESSAGES_COMMITTED,
        Unit::Count,
        "Messages whose offsets were committed ({message})"
    );
    metrics::describe_counter!(
        PROCESSING_FAILURES,
        Unit::Count,
        "Processor failures ({failure})"
    );
    metrics::describe_histogram!(
        PROCESS_DURATION,
        Unit::Seconds,
        "Time spent inside the processor per message"
    );
    metrics::describe_counter!(
        PARTITIONS_ASSIGNED,
        Unit::Count,
        "Partitions assigned to this consumer"
    );
    metrics::describe_counter!(
        PARTITIONS_REVOKED,
        Unit::Count,
        "Partitions revoked from this consumer"
    );
    metrics::describe_counter!(PARTITIONS_LOST, Unit::Count, "Partitions lost by this consumer");
    metrics::describe_gauge!(
        PARTITIONS_LIVE,
        Unit::Count,
        "Partitions with a running worker"
    );
    metrics::describe_counter!(
        FETCHES_DROPPED,
        Unit::Count,
        "Fetches dropped because their partition had no running worker"
    );
    metrics::describe_counter!(
        KAFKA_CLIENT_ERRORS,
        Unit::Count,
        "Errors reported by the kafka client while polling"
    );
}

/// Counter helper holding the baseline labels of one partition worker.
#[derive(Debug, Clone)]
pub struct ConsumerMetrics {
    baseline_labels: Vec<(String, String)>,
}

impl ConsumerMetrics {
    pub fn for_partition(topic_partition: &TopicPartition, mode: DeliveryMode) -> Self {
        Self {
            baseline_labels: vec![
                (
                    LABEL_DESTINATION_NAME.to_string(),
                    topic_partition.topic().to_string(),
                ),
                (
                    LABEL_PARTITION_ID.to_string(),
                    topic_partition.partition().to_string(),
                ),
                (
                    LABEL_DELIVERY_SEMANTICS.to_string(),
                    mode.as_str().to_string(),
                ),
            ],
        }
    }

    pub fn record_processed(&self, elapsed: Duration) {
        metrics::counter!(MESSAGES_PROCESSED, &self.baseline_labels).increment(1);
        metrics::histogram!(PROCESS_DURATION, &self.baseline_labels)
            .record(elapsed.as_secs_f64());
    }

    pub fn record_committed(&self, count: usize) {
        metrics::counter!(MESSAGES_COMMITTED, &self.baseline_labels).increment(count as u64);
    }

    pub fn record_failure(&self, kind: FailureKind) {
        let mut labels = self.baseline_labels.clone();
        labels.push((LABEL_ERROR_TYPE.to_string(), kind.as_str().to_string()));
        metrics::counter!(PROCESSING_FAILURES, &labels).increment(1);
    }
}

/// Builds the consumer-kind span for one message and links it to the producer's
/// span when the record carries an inbound trace context.
pub fn process_span(group_id: &str, message: &Message) -> Span {
    let span = info_span!(
        "process",
        otel.name = %format!("process {}", message.topic),
        otel.kind = "consumer",
        otel.status_code = field::Empty,
        otel.status_message = field::Empty,
        messaging.system = "kafka",
        messaging.consumer.group.name = %group_id,
        messaging.destination.name = %message.topic,
        messaging.destination.partition.id = message.partition,
        messaging.kafka.offset = message.offset,
        "error.type" = field::Empty,
    );

    if let Some(inbound) = inbound_span_context(&message.headers) {
        span.add_link(inbound);
    }

    span
}

pub fn record_span_failure(span: &Span, err: &ProcessorError) {
    span.record("otel.status_code", "ERROR");
    span.record("otel.status_message", field::display(err));
    span.record("error.type", err.kind().as_str());
}

struct HeaderExtractor<'a>(&'a [RecordHeader]);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(key))
            .and_then(|h| std::str::from_utf8(&h.value).ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.iter().map(|h| h.name.as_str()).collect()
    }
}

/// Extracts the inbound span context using the globally registered propagator.
pub fn inbound_span_context(headers: &[RecordHeader]) -> Option<SpanContext> {
    if headers.is_empty() {
        return None;
    }

    let cx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor(headers))
    });
    let span_context = cx.span().span_context().clone();

    span_context.is_valid().then_some(span_context)
}

#[cfg(test)]
pub(crate) mod test_metrics {
    use std::sync::OnceLock;

    use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};

    /// Installs a global debugging recorder once per test process.
    pub fn snapshotter() -> &'static Snapshotter {
        static SNAPSHOTTER: OnceLock<Snapshotter> = OnceLock::new();
        SNAPSHOTTER.get_or_init(|| {
            let recorder = DebuggingRecorder::new();
            let snapshotter = recorder.snapshotter();
            drop(recorder.install());
            snapshotter
        })
    }

    /// Sums every counter series named `name` whose labels include all of `labels`.
    pub fn counter_value(name: &str, labels: &[(&str, &str)]) -> u64 {
        snapshotter()
            .snapshot()
            .into_vec()
            .into_iter()
            .filter(|(key, _, _, _)| key.key().name() == name)
            .filter(|(key, _, _, _)| {
                labels.iter().all(|(k, v)| {
                    key.key()
                        .labels()
                        .any(|label| label.key() == *k && label.value() == *v)
                })
            })
            .map(|(_, _, _, value)| match value {
                DebugValue::Counter(v) => v,
                _ => 0,
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::test_metrics::{counter_value, snapshotter};
    use super::*;
    use opentelemetry_sdk::propagation::TraceContextPropagator;

    #[test]
    fn test_consumer_metrics_labels_and_counts() {
        snapshotter();
        let tp = TopicPartition::new("telemetry-counts", 3);
        let metrics = ConsumerMetrics::for_partition(&tp, DeliveryMode::AtLeastOnce);

        metrics.record_processed(Duration::from_millis(2));
        metrics.record_processed(Duration::from_millis(3));
        metrics.record_committed(2);
        metrics.record_failure(FailureKind::Decode);

        let labels = [
            (LABEL_DESTINATION_NAME, "telemetry-counts"),
            (LABEL_PARTITION_ID, "3"),
            (LABEL_DELIVERY_SEMANTICS, "at_least_once"),
        ];
        assert_eq!(counter_value(MESSAGES_PROCESSED, &labels), 2);
        assert_eq!(counter_value(MESSAGES_COMMITTED, &labels), 2);
        assert_eq!(
            counter_value(
                PROCESSING_FAILURES,
                &[
                    (LABEL_DESTINATION_NAME, "telemetry-counts"),
                    (LABEL_ERROR_TYPE, "decode"),
                ]
            ),
            1
        );
    }

    #[test]
    fn test_inbound_span_context_from_traceparent() {
        opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

        let headers = vec![
            RecordHeader::new("token", "phc_123"),
            RecordHeader::new(
                "traceparent",
                "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
            ),
        ];
        let span_context = inbound_span_context(&headers).expect("valid inbound context");
        assert_eq!(
            span_context.trace_id().to_string(),
            "4bf92f3577b34da6a3ce929d0e0e4736"
        );
        assert!(span_context.is_remote());

        assert!(inbound_span_context(&[]).is_none());
        assert!(inbound_span_context(&[RecordHeader::new("traceparent", "garbage")]).is_none());
    }
}
