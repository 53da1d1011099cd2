//! Event Loop - the single owner of partition lifecycle
//!
//! Rebalance events and fetches are serialized through one select loop:
//! 1. An assignment creates the partition's fetch channel and spawns its worker
//! 2. A revocation or loss closes the channel, so the worker drains and exits
//! 3. A fetch is forwarded to the channel of the partition that owns it, or
//!    dropped when no worker owns that partition anymore
//!
//! Because every mutation of the live-partition map happens inside a single
//! step of this loop, a fetch can never be routed to a channel that a preceding
//! revocation already closed.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ConsumerError;
use crate::kafka::adapters::{ChannelConsumer, CommitAcknowledger};
use crate::kafka::client::{AssignedPartition, RebalanceEvent, RebalanceReceiver};
use crate::kafka::types::{Fetch, TopicPartition};
use crate::metrics_consts::{
    FETCHES_DROPPED, LABEL_DESTINATION_NAME, LABEL_PARTITION_ID, PARTITIONS_ASSIGNED,
    PARTITIONS_LIVE, PARTITIONS_LOST, PARTITIONS_REVOKED,
};
use crate::orchestrator::PartitionOrchestrator;

/// Capacity of each per-partition fetch channel. A tokio channel cannot be
/// unbuffered; one slot keeps the event loop in lock-step with the worker.
pub const PARTITION_CHANNEL_CAPACITY: usize = 1;

type WorkerExit = (TopicPartition, Result<(), ConsumerError>);

pub struct EventLoop {
    group_id: Arc<str>,
    orchestrators: HashMap<String, Arc<dyn PartitionOrchestrator>>,
    live_partitions: HashMap<TopicPartition, mpsc::Sender<Fetch>>,
    fetches: mpsc::Receiver<Fetch>,
    rebalance: RebalanceReceiver,
    workers: JoinSet<WorkerExit>,
    cancel: CancellationToken,
    worker_cancel: CancellationToken,
}

impl EventLoop {
    pub fn new(
        group_id: &str,
        orchestrators: HashMap<String, Arc<dyn PartitionOrchestrator>>,
        fetches: mpsc::Receiver<Fetch>,
        rebalance: RebalanceReceiver,
        cancel: CancellationToken,
    ) -> Self {
        let worker_cancel = cancel.child_token();
        Self {
            group_id: Arc::from(group_id),
            orchestrators,
            live_partitions: HashMap::new(),
            fetches,
            rebalance,
            workers: JoinSet::new(),
            cancel,
            worker_cancel,
        }
    }

    /// Runs until the root token is cancelled, the fetch pump goes away, or a
    /// worker fails. Returns the first non-cancellation worker error.
    pub async fn run(mut self) -> Result<(), ConsumerError> {
        info!(
            messaging.consumer.group.name = %self.group_id,
            "Starting event loop for {} topics",
            self.orchestrators.len()
        );

        let failure = loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    debug!("Event loop cancelled");
                    break None;
                }

                Some(event) = self.rebalance.recv() => {
                    if let Err(e) = self.handle_rebalance(event) {
                        break Some(e);
                    }
                }

                fetch = self.fetches.recv() => match fetch {
                    Some(fetch) => self.handle_fetch(fetch).await,
                    None => {
                        debug!("Fetch pump closed its channel, stopping event loop");
                        break None;
                    }
                },

                Some(joined) = self.workers.join_next() => {
                    if let Some(e) = self.handle_worker_exit(joined) {
                        break Some(e);
                    }
                }
            }
        };

        self.shutdown(failure).await
    }

    fn handle_rebalance(&mut self, event: RebalanceEvent) -> Result<(), ConsumerError> {
        match event {
            RebalanceEvent::Assigned(assigned) => self.handle_assigned(assigned)?,
            RebalanceEvent::Revoked(tp) => self.handle_removed(tp, "revoked", PARTITIONS_REVOKED),
            RebalanceEvent::Lost(tp) => self.handle_removed(tp, "lost", PARTITIONS_LOST),
        }
        Ok(())
    }

    fn handle_assigned(&mut self, assigned: AssignedPartition) -> Result<(), ConsumerError> {
        let AssignedPartition {
            topic_partition: tp,
            committer,
        } = assigned;

        let Some(orchestrator) = self.orchestrators.get(tp.topic()) else {
            error!(
                messaging.consumer.group.name = %self.group_id,
                messaging.destination.name = %tp.topic(),
                messaging.destination.partition.id = tp.partition(),
                "assigned partition of a topic with no processor"
            );
            return Err(ConsumerError::UnknownTopic(tp.topic().to_string()));
        };

        if self.live_partitions.contains_key(&tp) {
            // rdkafka may report an assignment twice; the running worker keeps it
            warn!(
                messaging.destination.name = %tp.topic(),
                messaging.destination.partition.id = tp.partition(),
                "topic partition already assigned, keeping existing worker"
            );
            return Ok(());
        }

        let (sender, receiver) = mpsc::channel(PARTITION_CHANNEL_CAPACITY);
        let task = orchestrator.partition_worker(
            tp.clone(),
            Box::new(ChannelConsumer::new(receiver)),
            Arc::new(CommitAcknowledger::new(committer)),
            self.worker_cancel.clone(),
        );

        let worker_tp = tp.clone();
        self.workers.spawn(async move {
            let result = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(ConsumerError::WorkerPanicked {
                    topic: worker_tp.topic().to_string(),
                    partition: worker_tp.partition(),
                }),
            };
            (worker_tp, result)
        });

        self.live_partitions.insert(tp.clone(), sender);
        metrics::counter!(
            PARTITIONS_ASSIGNED,
            LABEL_DESTINATION_NAME => tp.topic().to_string(),
            LABEL_PARTITION_ID => tp.partition().to_string()
        )
        .increment(1);
        self.update_live_gauge();

        info!(
            messaging.consumer.group.name = %self.group_id,
            messaging.destination.name = %tp.topic(),
            messaging.destination.partition.id = tp.partition(),
            delivery.semantics = %orchestrator.delivery_mode(),
            "topic partition assigned"
        );
        Ok(())
    }

    fn handle_removed(&mut self, tp: TopicPartition, reason: &'static str, metric: &'static str) {
        // dropping the sender closes the channel; the worker sees end-of-queue
        if self.live_partitions.remove(&tp).is_none() {
            warn!(
                messaging.consumer.group.name = %self.group_id,
                messaging.destination.name = %tp.topic(),
                messaging.destination.partition.id = tp.partition(),
                "topic partition {reason} but not assigned"
            );
            return;
        }

        metrics::counter!(
            metric,
            LABEL_DESTINATION_NAME => tp.topic().to_string(),
            LABEL_PARTITION_ID => tp.partition().to_string()
        )
        .increment(1);
        self.update_live_gauge();

        info!(
            messaging.consumer.group.name = %self.group_id,
            messaging.destination.name = %tp.topic(),
            messaging.destination.partition.id = tp.partition(),
            "topic partition {reason}"
        );
    }

    async fn handle_fetch(&mut self, fetch: Fetch) {
        let tp = fetch.topic_partition();
        let Some(sender) = self.live_partitions.get(&tp).cloned() else {
            warn!(
                messaging.consumer.group.name = %self.group_id,
                messaging.destination.name = %fetch.topic,
                messaging.destination.partition.id = fetch.partition,
                messaging.kafka.offset = fetch.first_offset().unwrap_or_default(),
                "topic partition not found for fetched records"
            );
            self.record_dropped(&tp);
            return;
        };

        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => {
                debug!("Cancelled while forwarding fetch for {tp}");
            }

            sent = sender.send(fetch) => {
                if sent.is_err() {
                    // the worker exited on its own; its exit is handled once joined
                    warn!(
                        messaging.destination.name = %tp.topic(),
                        messaging.destination.partition.id = tp.partition(),
                        "partition worker is gone, dropping fetched records"
                    );
                    self.record_dropped(&tp);
                    self.live_partitions.remove(&tp);
                    self.update_live_gauge();
                }
            }
        }
    }

    fn handle_worker_exit(&mut self, joined: Result<WorkerExit, JoinError>) -> Option<ConsumerError> {
        let (tp, result) = match joined {
            Ok(exit) => exit,
            Err(e) => {
                // panics are caught inside the task, so only aborts land here
                warn!(error = %e, "partition worker task did not complete");
                return None;
            }
        };

        // a worker that stopped on its own leaves a closed channel behind
        if self
            .live_partitions
            .get(&tp)
            .is_some_and(|sender| sender.is_closed())
        {
            self.live_partitions.remove(&tp);
            self.update_live_gauge();
        }

        match result {
            Ok(()) => {
                debug!("Partition worker for {tp} finished");
                None
            }
            Err(e) if e.is_cancellation() => {
                debug!("Partition worker for {tp} cancelled");
                None
            }
            Err(e) => {
                error!(
                    messaging.consumer.group.name = %self.group_id,
                    messaging.destination.name = %tp.topic(),
                    messaging.destination.partition.id = tp.partition(),
                    error = %e,
                    "partition worker failed"
                );
                Some(e)
            }
        }
    }

    async fn shutdown(mut self, mut failure: Option<ConsumerError>) -> Result<(), ConsumerError> {
        info!(
            "Event loop closing {} partition channels and draining {} workers",
            self.live_partitions.len(),
            self.workers.len()
        );

        self.live_partitions.clear();
        self.update_live_gauge();

        if failure.is_some() {
            self.worker_cancel.cancel();
        }

        while let Some(joined) = self.workers.join_next().await {
            if let Some(e) = self.handle_worker_exit(joined) {
                failure.get_or_insert(e);
            }
        }

        info!("Event loop stopped");
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn record_dropped(&self, tp: &TopicPartition) {
        metrics::counter!(
            FETCHES_DROPPED,
            LABEL_DESTINATION_NAME => tp.topic().to_string(),
            LABEL_PARTITION_ID => tp.partition().to_string()
        )
        .increment(1);
    }

    fn update_live_gauge(&self) {
        metrics::gauge!(PARTITIONS_LIVE).set(self.live_partitions.len() as f64);
    }
}
