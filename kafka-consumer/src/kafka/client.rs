//! The surface the runtime needs from a host Kafka client.
//!
//! A client polls fetches, commits records through a [`Committer`], and reports
//! group rebalances through a [`RebalanceSender`]. The rdkafka-backed client
//! lives in `rdkafka_client`; an in-memory one for tests lives in `test_utils`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::ConsumerError;
use crate::kafka::types::{flatten_assignments, Fetch, PartitionAssignments, Record, TopicPartition};

#[async_trait]
pub trait KafkaClient: Send + Sync + 'static {
    /// Blocks until at least one fetch is available. Each returned fetch holds
    /// records of a single partition. Returns `ClientClosed` once `close` was called.
    async fn poll_fetches(&self) -> Result<Vec<Fetch>, ConsumerError>;

    /// Stops fetching and releases group membership.
    fn close(&self);
}

/// Commit surface handed out with each assignment.
#[async_trait]
pub trait Committer: Send + Sync {
    /// Commits the given records. On success the group's committed offset for
    /// each partition involved advances to `max(offset) + 1`.
    async fn commit_records(&self, records: &[Record]) -> Result<(), ConsumerError>;
}

pub struct AssignedPartition {
    pub topic_partition: TopicPartition,
    pub committer: Arc<dyn Committer>,
}

/// A single partition-level rebalance notification.
pub enum RebalanceEvent {
    Assigned(AssignedPartition),
    /// Relinquished gracefully.
    Revoked(TopicPartition),
    /// Taken away involuntarily, e.g. after a session timeout.
    Lost(TopicPartition),
}

impl RebalanceEvent {
    pub fn topic_partition(&self) -> &TopicPartition {
        match self {
            RebalanceEvent::Assigned(assigned) => &assigned.topic_partition,
            RebalanceEvent::Revoked(tp) | RebalanceEvent::Lost(tp) => tp,
        }
    }
}

/// Receiving half consumed by the event loop.
///
/// Assigned, revoked and lost events share one channel so that a revocation
/// can never overtake the assignment it undoes.
pub type RebalanceReceiver = mpsc::UnboundedReceiver<RebalanceEvent>;

/// Sending half given to the host client's rebalance callbacks.
///
/// Sends never block, since rdkafka invokes rebalance callbacks synchronously
/// from its poll path.
#[derive(Clone)]
pub struct RebalanceSender {
    events: mpsc::UnboundedSender<RebalanceEvent>,
}

pub fn rebalance_channel() -> (RebalanceSender, RebalanceReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RebalanceSender { events: tx }, rx)
}

impl RebalanceSender {
    pub fn on_assigned(&self, assignments: &PartitionAssignments, committer: Arc<dyn Committer>) {
        for topic_partition in flatten_assignments(assignments) {
            self.send(RebalanceEvent::Assigned(AssignedPartition {
                topic_partition,
                committer: committer.clone(),
            }));
        }
    }

    pub fn on_revoked(&self, assignments: &PartitionAssignments) {
        for tp in flatten_assignments(assignments) {
            self.send(RebalanceEvent::Revoked(tp));
        }
    }

    pub fn on_lost(&self, assignments: &PartitionAssignments) {
        for tp in flatten_assignments(assignments) {
            self.send(RebalanceEvent::Lost(tp));
        }
    }

    fn send(&self, event: RebalanceEvent) {
        if let Err(e) = self.events.send(event) {
            debug!(
                "Dropping rebalance event for {}: event loop is gone",
                e.0.topic_partition()
            );
        }
    }
}
