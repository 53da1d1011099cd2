//! Narrow adapters the partition workers consume: a source of fetches for one
//! partition, and an acknowledger that commits record batches.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ConsumerError;
use crate::kafka::client::Committer;
use crate::kafka::types::{Fetch, Record};

#[async_trait]
pub trait FetchConsumer: Send {
    /// Waits for the next fetch of this partition.
    ///
    /// `Ok(None)` is the end-of-queue signal: the partition was revoked, lost,
    /// or the runtime is shutting down, and no more fetches will arrive.
    async fn consume(&mut self, cancel: &CancellationToken)
        -> Result<Option<Fetch>, ConsumerError>;
}

#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Commits a batch of contiguous records from a single partition.
    async fn acknowledge(
        &self,
        cancel: &CancellationToken,
        records: &[Record],
    ) -> Result<(), ConsumerError>;
}

/// Consumes the per-partition channel fed by the event loop.
pub struct ChannelConsumer {
    receiver: mpsc::Receiver<Fetch>,
}

impl ChannelConsumer {
    pub fn new(receiver: mpsc::Receiver<Fetch>) -> Self {
        Self { receiver }
    }
}

#[async_trait]
impl FetchConsumer for ChannelConsumer {
    async fn consume(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<Fetch>, ConsumerError> {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(ConsumerError::Cancelled),
            fetch = self.receiver.recv() => Ok(fetch),
        }
    }
}

/// Commits through the committer handed out with the partition's assignment.
pub struct CommitAcknowledger {
    committer: Arc<dyn Committer>,
}

impl CommitAcknowledger {
    pub fn new(committer: Arc<dyn Committer>) -> Self {
        Self { committer }
    }
}

#[async_trait]
impl Acknowledger for CommitAcknowledger {
    async fn acknowledge(
        &self,
        cancel: &CancellationToken,
        records: &[Record],
    ) -> Result<(), ConsumerError> {
        if records.is_empty() {
            return Ok(());
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(ConsumerError::Cancelled),
            result = self.committer.commit_records(records) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::SystemTime;

    fn record(offset: i64) -> Record {
        Record {
            topic: "t".to_string(),
            partition: 0,
            offset,
            timestamp: SystemTime::now(),
            key: vec![],
            value: format!("m{offset}").into_bytes(),
            headers: vec![],
        }
    }

    #[derive(Default)]
    struct CapturingCommitter {
        commits: Mutex<Vec<Vec<i64>>>,
    }

    #[async_trait]
    impl Committer for CapturingCommitter {
        async fn commit_records(&self, records: &[Record]) -> Result<(), ConsumerError> {
            self.commits
                .lock()
                .unwrap()
                .push(records.iter().map(|r| r.offset).collect());
            Ok(())
        }
    }

    struct HangingCommitter;

    #[async_trait]
    impl Committer for HangingCommitter {
        async fn commit_records(&self, _records: &[Record]) -> Result<(), ConsumerError> {
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_channel_consumer_reports_end_of_queue_on_close() {
        let (tx, rx) = mpsc::channel(1);
        let mut consumer = ChannelConsumer::new(rx);
        let cancel = CancellationToken::new();

        tx.send(Fetch::new("t", 0, vec![record(0)])).await.unwrap();
        drop(tx);

        let fetch = consumer.consume(&cancel).await.unwrap().unwrap();
        assert_eq!(fetch.first_offset(), Some(0));
        assert!(consumer.consume(&cancel).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_channel_consumer_honors_cancellation() {
        let (_tx, rx) = mpsc::channel::<Fetch>(1);
        let mut consumer = ChannelConsumer::new(rx);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = consumer.consume(&cancel).await;
        assert!(matches!(result, Err(ConsumerError::Cancelled)));
    }

    #[tokio::test]
    async fn test_commit_acknowledger_forwards_records() {
        let committer = Arc::new(CapturingCommitter::default());
        let acknowledger = CommitAcknowledger::new(committer.clone());
        let cancel = CancellationToken::new();

        acknowledger
            .acknowledge(&cancel, &[record(3), record(4)])
            .await
            .unwrap();
        // empty batches never reach the committer
        acknowledger.acknowledge(&cancel, &[]).await.unwrap();

        assert_eq!(*committer.commits.lock().unwrap(), vec![vec![3, 4]]);
    }

    #[tokio::test]
    async fn test_commit_acknowledger_honors_cancellation() {
        let acknowledger = CommitAcknowledger::new(Arc::new(HangingCommitter));
        let cancel = CancellationToken::new();

        let child = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            child.cancel();
        });

        let result = acknowledger.acknowledge(&cancel, &[record(0)]).await;
        assert!(matches!(result, Err(ConsumerError::Cancelled)));
    }
}
