//! In-memory stand-ins for the host Kafka client, used by unit tests and by
//! the integration tests under `tests/`.
//!
//! [`MemoryBroker`] keeps partition logs and per-group committed offsets,
//! [`MemoryClient`] implements [`KafkaClient`] over it with explicit
//! assign/revoke/lose controls, and [`RecordingProcessor`] captures what it was
//! given. Commits and processor calls draw stamps from one shared [`Sequence`]
//! so tests can assert on their relative order.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use tokio_util::sync::CancellationToken;

use crate::error::ConsumerError;
use crate::kafka::adapters::FetchConsumer;
use crate::kafka::client::{Committer, KafkaClient, RebalanceSender};
use crate::kafka::message::Message;
use crate::kafka::types::{Fetch, PartitionAssignments, Record, TopicPartition};
use crate::processor::{FailureKind, Processor, ProcessorError};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Monotonic stamp source shared between a broker and the processors under test.
#[derive(Debug, Clone, Default)]
pub struct Sequence(Arc<AtomicU64>);

impl Sequence {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

pub fn record(topic: &str, partition: i32, offset: i64) -> Record {
    Record {
        topic: topic.to_string(),
        partition,
        offset,
        timestamp: SystemTime::now(),
        key: format!("k{offset}").into_bytes(),
        value: format!("m{offset}").into_bytes(),
        headers: vec![],
    }
}

pub fn fetch_of(topic: &str, partition: i32, offsets: Range<i64>) -> Fetch {
    Fetch::new(
        topic,
        partition,
        offsets.map(|o| record(topic, partition, o)).collect(),
    )
}

#[derive(Debug, Clone)]
pub struct CommitEntry {
    pub seq: u64,
    pub group_id: String,
    pub topic: String,
    pub partition: i32,
    pub offsets: Vec<i64>,
}

#[derive(Default)]
struct BrokerState {
    logs: HashMap<TopicPartition, Vec<Record>>,
    committed: HashMap<(String, TopicPartition), i64>,
    commits: Vec<CommitEntry>,
    failing_commits: usize,
}

#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    sequence: Sequence,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sequence(&self) -> Sequence {
        self.sequence.clone()
    }

    /// Appends a record and returns its offset.
    pub fn produce(&self, topic: &str, partition: i32, value: &str) -> i64 {
        let mut state = self.state.lock().unwrap();
        let log = state
            .logs
            .entry(TopicPartition::new(topic, partition))
            .or_default();
        let offset = log.len() as i64;
        log.push(Record {
            topic: topic.to_string(),
            partition,
            offset,
            timestamp: SystemTime::now(),
            key: format!("k{offset}").into_bytes(),
            value: value.as_bytes().to_vec(),
            headers: vec![],
        });
        offset
    }

    pub fn committed_offset(&self, group_id: &str, tp: &TopicPartition) -> Option<i64> {
        self.state
            .lock()
            .unwrap()
            .committed
            .get(&(group_id.to_string(), tp.clone()))
            .copied()
    }

    pub fn commits(&self) -> Vec<CommitEntry> {
        self.state.lock().unwrap().commits.clone()
    }

    pub fn commits_for(&self, topic: &str, partition: i32) -> Vec<CommitEntry> {
        self.commits()
            .into_iter()
            .filter(|c| c.topic == topic && c.partition == partition)
            .collect()
    }

    /// Makes the next `count` commit calls fail with a transport error.
    pub fn fail_next_commits(&self, count: usize) {
        self.state.lock().unwrap().failing_commits = count;
    }

    pub fn committer(self: &Arc<Self>, group_id: &str) -> Arc<dyn Committer> {
        Arc::new(MemoryCommitter {
            broker: self.clone(),
            group_id: group_id.to_string(),
        })
    }

    fn read(&self, tp: &TopicPartition, from: i64, max: usize) -> Vec<Record> {
        let state = self.state.lock().unwrap();
        match state.logs.get(tp) {
            Some(log) => log
                .iter()
                .skip(from.max(0) as usize)
                .take(max)
                .cloned()
                .collect(),
            None => vec![],
        }
    }
}

pub struct MemoryCommitter {
    broker: Arc<MemoryBroker>,
    group_id: String,
}

#[async_trait]
impl Committer for MemoryCommitter {
    async fn commit_records(&self, records: &[Record]) -> Result<(), ConsumerError> {
        let mut by_partition: BTreeMap<TopicPartition, Vec<i64>> = BTreeMap::new();
        for record in records {
            by_partition
                .entry(record.topic_partition())
                .or_default()
                .push(record.offset);
        }

        let mut state = self.broker.state.lock().unwrap();
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            let (tp, _) = by_partition
                .into_iter()
                .next()
                .unwrap_or((TopicPartition::new("", -1), vec![]));
            return Err(ConsumerError::Commit {
                topic: tp.topic().to_string(),
                partition: tp.partition(),
                source: KafkaError::ConsumerCommit(RDKafkaErrorCode::RebalanceInProgress),
            });
        }

        for (tp, offsets) in by_partition {
            let next = offsets.iter().max().copied().unwrap_or_default() + 1;
            state
                .committed
                .insert((self.group_id.clone(), tp.clone()), next);
            state.commits.push(CommitEntry {
                seq: self.broker.sequence.next(),
                group_id: self.group_id.clone(),
                topic: tp.topic().to_string(),
                partition: tp.partition(),
                offsets,
            });
        }
        Ok(())
    }
}

/// A group member reading from a [`MemoryBroker`]. Assignment is driven by the
/// test through [`MemoryClient::assign`], [`MemoryClient::revoke`] and
/// [`MemoryClient::lose`].
pub struct MemoryClient {
    broker: Arc<MemoryBroker>,
    group_id: String,
    rebalance: RebalanceSender,
    positions: Mutex<BTreeMap<TopicPartition, i64>>,
    max_poll_records: usize,
    closed: CancellationToken,
}

impl MemoryClient {
    pub fn new(broker: Arc<MemoryBroker>, group_id: &str, rebalance: RebalanceSender) -> Self {
        Self {
            broker,
            group_id: group_id.to_string(),
            rebalance,
            positions: Mutex::new(BTreeMap::new()),
            max_poll_records: 500,
            closed: CancellationToken::new(),
        }
    }

    pub fn with_max_poll_records(mut self, max: usize) -> Self {
        self.max_poll_records = max.max(1);
        self
    }

    /// Assigns partitions, resuming each from the group's committed offset.
    pub fn assign(&self, topic: &str, partitions: &[i32]) {
        let assignments = PartitionAssignments::from([(topic.to_string(), partitions.to_vec())]);
        // the event goes out before the partition becomes pollable
        self.rebalance
            .on_assigned(&assignments, self.broker.committer(&self.group_id));

        let mut positions = self.positions.lock().unwrap();
        for p in partitions {
            let tp = TopicPartition::new(topic, *p);
            let start = self
                .broker
                .committed_offset(&self.group_id, &tp)
                .unwrap_or(0);
            positions.insert(tp, start);
        }
    }

    pub fn revoke(&self, topic: &str, partitions: &[i32]) {
        self.unassign(topic, partitions);
        self.rebalance.on_revoked(&PartitionAssignments::from([(
            topic.to_string(),
            partitions.to_vec(),
        )]));
    }

    pub fn lose(&self, topic: &str, partitions: &[i32]) {
        self.unassign(topic, partitions);
        self.rebalance.on_lost(&PartitionAssignments::from([(
            topic.to_string(),
            partitions.to_vec(),
        )]));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn unassign(&self, topic: &str, partitions: &[i32]) {
        let mut positions = self.positions.lock().unwrap();
        for p in partitions {
            positions.remove(&TopicPartition::new(topic, *p));
        }
    }

    fn take_available(&self) -> Vec<Fetch> {
        let mut positions = self.positions.lock().unwrap();
        let mut fetches = vec![];
        for (tp, position) in positions.iter_mut() {
            let records = self.broker.read(tp, *position, self.max_poll_records);
            if let Some(last) = records.last() {
                *position = last.offset + 1;
                fetches.push(Fetch::new(tp.topic(), tp.partition(), records));
            }
        }
        fetches
    }
}

#[async_trait]
impl KafkaClient for MemoryClient {
    async fn poll_fetches(&self) -> Result<Vec<Fetch>, ConsumerError> {
        loop {
            if self.closed.is_cancelled() {
                return Err(ConsumerError::ClientClosed);
            }

            let fetches = self.take_available();
            if !fetches.is_empty() {
                return Ok(fetches);
            }

            tokio::select! {
                _ = self.closed.cancelled() => return Err(ConsumerError::ClientClosed),
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// Feeds a fixed list of fetches, then reports end-of-queue.
pub struct QueueConsumer {
    fetches: VecDeque<Fetch>,
}

impl QueueConsumer {
    pub fn new(fetches: Vec<Fetch>) -> Self {
        Self {
            fetches: fetches.into(),
        }
    }
}

#[async_trait]
impl FetchConsumer for QueueConsumer {
    async fn consume(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<Fetch>, ConsumerError> {
        if cancel.is_cancelled() {
            return Err(ConsumerError::Cancelled);
        }
        Ok(self.fetches.pop_front())
    }
}

#[derive(Debug, Clone)]
pub struct ProcessedMessage {
    pub seq: u64,
    pub message: Message,
}

type MessagePredicate<T> = Box<dyn Fn(&Message) -> T + Send + Sync>;

/// Processor that records every call. Behavior is configured with the
/// `failing_when`, `panicking_when`, `on_process` and `with_delay` builders.
pub struct RecordingProcessor {
    sequence: Sequence,
    processed: Mutex<Vec<ProcessedMessage>>,
    completed: AtomicUsize,
    delay: Duration,
    fail_when: Option<MessagePredicate<Option<FailureKind>>>,
    panic_when: Option<MessagePredicate<bool>>,
    on_process: Option<MessagePredicate<()>>,
}

impl RecordingProcessor {
    pub fn new(sequence: Sequence) -> Self {
        Self {
            sequence,
            processed: Mutex::new(vec![]),
            completed: AtomicUsize::new(0),
            delay: Duration::ZERO,
            fail_when: None,
            panic_when: None,
            on_process: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_when(
        mut self,
        f: impl Fn(&Message) -> Option<FailureKind> + Send + Sync + 'static,
    ) -> Self {
        self.fail_when = Some(Box::new(f));
        self
    }

    pub fn panicking_when(mut self, f: impl Fn(&Message) -> bool + Send + Sync + 'static) -> Self {
        self.panic_when = Some(Box::new(f));
        self
    }

    pub fn on_process(mut self, f: impl Fn(&Message) + Send + Sync + 'static) -> Self {
        self.on_process = Some(Box::new(f));
        self
    }

    /// Calls that started, in call order.
    pub fn processed(&self) -> Vec<ProcessedMessage> {
        self.processed.lock().unwrap().clone()
    }

    pub fn offsets(&self) -> Vec<i64> {
        self.processed().iter().map(|p| p.message.offset).collect()
    }

    pub fn values(&self) -> Vec<String> {
        self.processed()
            .iter()
            .map(|p| String::from_utf8_lossy(&p.message.value).into_owned())
            .collect()
    }

    /// Calls that ran to the end, successful or not, without being cancelled.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Processor for RecordingProcessor {
    async fn process(
        &self,
        cancel: &CancellationToken,
        message: &Message,
    ) -> Result<(), ProcessorError> {
        if let Some(panic_when) = &self.panic_when {
            if panic_when(message) {
                panic!("processor crashed on offset {}", message.offset);
            }
        }

        let seq = self.sequence.next();
        self.processed.lock().unwrap().push(ProcessedMessage {
            seq,
            message: message.clone(),
        });

        if let Some(on_process) = &self.on_process {
            on_process(message);
        }

        if !self.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProcessorError::cancelled()),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }

        self.completed.fetch_add(1, Ordering::SeqCst);

        match self.fail_when.as_ref().and_then(|f| f(message)) {
            Some(kind) => Err(ProcessorError::new(
                kind,
                anyhow::anyhow!("simulated failure at offset {}", message.offset),
            )),
            None => Ok(()),
        }
    }
}
