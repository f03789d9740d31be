use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{DispatchError, Result};
use crate::model::BatchStatus;
use crate::partition::plan::PartitionPlan;
use crate::partition::reply::PartitionReplyMessage;

/// Reply channel from partition workers to the coordinating task.
///
/// `add` and both receive operations are individually atomic; a message is
/// either fully visible or not at all. `close` may race an in-progress
/// `take`, which then returns [`DispatchError::QueueClosed`].
#[async_trait]
pub trait PartitionReplyQueue: Send + Sync {
    async fn add(&self, message: PartitionReplyMessage) -> Result<()>;

    /// Waits up to `wait` for the next message. `Ok(None)` means the wait elapsed.
    async fn take(&self, wait: Duration) -> Result<Option<PartitionReplyMessage>>;

    /// Returns a message already buffered, if any, without waiting.
    async fn take_without_waiting(&self) -> Result<Option<PartitionReplyMessage>>;

    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Gives back what the queue holds outside this process once the
    /// coordinator is done with it. Closes the queue.
    async fn release(&self) -> Result<()> {
        self.close();
        Ok(())
    }

    /// Transport destination partitions on other nodes should reply to.
    /// `None` for queues only reachable in-process.
    fn reply_to(&self) -> Option<&str>;
}

/// In-process reply queue over a single unbounded channel.
#[derive(Debug)]
pub struct LocalReplyQueue {
    tx: mpsc::UnboundedSender<PartitionReplyMessage>,
    rx: Mutex<mpsc::UnboundedReceiver<PartitionReplyMessage>>,
    closed: CancellationToken,
}

impl Default for LocalReplyQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalReplyQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            closed: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl PartitionReplyQueue for LocalReplyQueue {
    async fn add(&self, message: PartitionReplyMessage) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(DispatchError::QueueClosed);
        }
        self.tx.send(message).map_err(|_| DispatchError::QueueClosed)
    }

    async fn take(&self, wait: Duration) -> Result<Option<PartitionReplyMessage>> {
        let mut rx = tokio::select! {
            guard = self.rx.lock() => guard,
            _ = self.closed.cancelled() => return Err(DispatchError::QueueClosed),
        };
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(DispatchError::QueueClosed),
            received = tokio::time::timeout(wait, rx.recv()) => match received {
                Ok(Some(message)) => Ok(Some(message)),
                Ok(None) => Err(DispatchError::QueueClosed),
                Err(_) => Ok(None),
            },
        }
    }

    async fn take_without_waiting(&self) -> Result<Option<PartitionReplyMessage>> {
        if self.closed.is_cancelled() {
            return Err(DispatchError::QueueClosed);
        }
        let mut rx = self.rx.lock().await;
        Ok(rx.try_recv().ok())
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn reply_to(&self) -> Option<&str> {
        None
    }
}

/// Partition-side handle onto a reply queue.
///
/// Stamps every message with the next per-partition sequence number, so the
/// coordinator can observe send order and drop redelivered duplicates.
#[derive(Clone)]
pub struct ReplySender {
    queue: Arc<dyn PartitionReplyQueue>,
    plan: Arc<PartitionPlan>,
    sequence: Arc<AtomicU64>,
}

impl std::fmt::Debug for ReplySender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplySender")
            .field("partition", &self.plan.partition_number)
            .field("correlation_id", &self.plan.correlation_id)
            .field("sequence", &self.sequence.load(Ordering::SeqCst))
            .finish()
    }
}

impl ReplySender {
    pub fn new(queue: Arc<dyn PartitionReplyQueue>, plan: PartitionPlan) -> Self {
        Self {
            queue,
            plan: Arc::new(plan),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn plan(&self) -> &PartitionPlan {
        &self.plan
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    pub async fn send_collector_data(&self, data: Vec<u8>) -> Result<()> {
        let message =
            PartitionReplyMessage::collector_data((*self.plan).clone(), self.next_sequence(), data);
        self.queue.add(message).await
    }

    pub async fn send_final_status(
        &self,
        status: BatchStatus,
        exit_status: impl Into<String>,
    ) -> Result<()> {
        let message = PartitionReplyMessage::final_status(
            (*self.plan).clone(),
            self.next_sequence(),
            status,
            exit_status,
        );
        self.queue.add(message).await
    }
}
