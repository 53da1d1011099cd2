#![allow(dead_code)]

use std::io;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use kafka_consumer::kafka::client::rebalance_channel;
use kafka_consumer::kafka::TopicPartition;
use kafka_consumer::test_utils::{MemoryBroker, MemoryClient};
use kafka_consumer::{ConsumerConfig, ConsumerError, Runtime, TopicProcessor};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::subscriber::DefaultGuard;

/// Installs a global debugging recorder once per test binary.
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

/// Formatted log output captured for the current thread.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    /// Routes this thread's tracing output into the capture until the guard drops.
    /// Only reliable on the current-thread runtime `#[tokio::test]` uses.
    pub fn install(&self) -> DefaultGuard {
        let writer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One consumer group member running against a [`MemoryBroker`].
pub struct Instance {
    pub client: Arc<MemoryClient>,
    pub cancel: CancellationToken,
    pub handle: JoinHandle<Result<(), ConsumerError>>,
}

impl Instance {
    pub fn start(
        broker: &Arc<MemoryBroker>,
        group_id: &str,
        topics: Vec<TopicProcessor>,
        max_poll_records: usize,
    ) -> Self {
        let (rebalance_tx, rebalance_rx) = rebalance_channel();
        let client = Arc::new(
            MemoryClient::new(broker.clone(), group_id, rebalance_tx)
                .with_max_poll_records(max_poll_records),
        );
        let cancel = CancellationToken::new();

        let mut config = ConsumerConfig::new(["localhost:9092"], group_id);
        for topic in topics {
            config = config.with_topic(topic);
        }

        let runtime = Runtime::new(client.clone(), rebalance_rx, &config, cancel.clone())
            .expect("valid runtime config");
        let handle = tokio::spawn(runtime.run());

        Self {
            client,
            cancel,
            handle,
        }
    }

    /// Waits for the runtime to stop on its own.
    pub async fn join(self) -> Result<(), ConsumerError> {
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("runtime stops in time")
            .expect("runtime task does not panic")
    }

    /// Cancels the runtime and waits for it to drain.
    pub async fn stop(self) -> Result<(), ConsumerError> {
        self.cancel.cancel();
        self.join().await
    }
}

pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

pub fn committed(broker: &MemoryBroker, group_id: &str, topic: &str, partition: i32) -> Option<i64> {
    broker.committed_offset(group_id, &TopicPartition::new(topic, partition))
}

pub fn produce_n(broker: &MemoryBroker, topic: &str, partition: i32, count: i64) {
    for i in 0..count {
        broker.produce(topic, partition, &format!("m{i}"));
    }
}
