use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::partition::queue::PartitionReplyQueue;
use crate::partition::reply::PartitionReplyMessage;
use crate::transport::{codec, Envelope, MessageTransport, HEADER_CORRELATION_ID};

pub const REPLY_KIND: &str = "partition_reply";

/// Destination a step attempt's replies are sent to.
pub fn reply_destination(correlation_id: Uuid) -> String {
    format!("batch.reply.{}", correlation_id)
}

struct Inbox {
    rx: mpsc::UnboundedReceiver<Envelope>,
    seen: HashSet<(u32, u64)>,
}

impl Inbox {
    /// Decodes an envelope, dropping it if it is undecodable, belongs to
    /// another step attempt, or repeats a (partition, sequence) already taken.
    fn accept(&mut self, correlation_id: Uuid, envelope: Envelope) -> Option<PartitionReplyMessage> {
        let message: PartitionReplyMessage = match codec::decode(&envelope) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(envelope_id = %envelope.id, error = %e, "Dropping undecodable partition reply");
                return None;
            }
        };
        if message.plan.correlation_id != correlation_id {
            tracing::warn!(
                expected = %correlation_id,
                received = %message.plan.correlation_id,
                partition = message.partition_number,
                "Dropping partition reply from another step attempt"
            );
            return None;
        }
        if !self.seen.insert((message.partition_number, message.sequence)) {
            tracing::debug!(
                partition = message.partition_number,
                sequence = message.sequence,
                "Dropping redelivered partition reply"
            );
            return None;
        }
        Some(message)
    }
}

/// Reply queue carried over the message transport, for partitions that run
/// on other nodes.
///
/// The coordinator side is created with [`TransportReplyQueue::open`] and
/// owns the subscription. A partition worker uses
/// [`TransportReplyQueue::attach`], which can only `add`.
pub struct TransportReplyQueue {
    transport: Arc<dyn MessageTransport>,
    destination: String,
    correlation_id: Uuid,
    inbox: Option<Mutex<Inbox>>,
    closed: CancellationToken,
}

impl std::fmt::Debug for TransportReplyQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportReplyQueue")
            .field("destination", &self.destination)
            .field("correlation_id", &self.correlation_id)
            .field("receiving", &self.inbox.is_some())
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl TransportReplyQueue {
    pub async fn open(transport: Arc<dyn MessageTransport>, correlation_id: Uuid) -> Result<Self> {
        let destination = reply_destination(correlation_id);
        let rx = transport.subscribe(&destination).await?;
        tracing::debug!(%destination, "Opened partition reply queue");
        Ok(Self {
            transport,
            destination,
            correlation_id,
            inbox: Some(Mutex::new(Inbox {
                rx,
                seen: HashSet::new(),
            })),
            closed: CancellationToken::new(),
        })
    }

    pub fn attach(
        transport: Arc<dyn MessageTransport>,
        destination: impl Into<String>,
        correlation_id: Uuid,
    ) -> Self {
        Self {
            transport,
            destination: destination.into(),
            correlation_id,
            inbox: None,
            closed: CancellationToken::new(),
        }
    }

    fn inbox(&self) -> Result<&Mutex<Inbox>> {
        self.inbox.as_ref().ok_or(DispatchError::Unsupported {
            dispatcher: "queued",
            operation: "receiving on an attached reply queue",
        })
    }
}

#[async_trait]
impl PartitionReplyQueue for TransportReplyQueue {
    async fn add(&self, message: PartitionReplyMessage) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(DispatchError::QueueClosed);
        }
        let envelope = codec::encode(REPLY_KIND, &message)?
            .with_header(HEADER_CORRELATION_ID, self.correlation_id.to_string());
        self.transport.send(&self.destination, envelope).await?;
        Ok(())
    }

    async fn take(&self, wait: Duration) -> Result<Option<PartitionReplyMessage>> {
        let inbox = self.inbox()?;
        let deadline = tokio::time::Instant::now() + wait;
        let mut inbox = tokio::select! {
            guard = inbox.lock() => guard,
            _ = self.closed.cancelled() => return Err(DispatchError::QueueClosed),
        };
        loop {
            let received = tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Err(DispatchError::QueueClosed),
                received = tokio::time::timeout_at(deadline, inbox.rx.recv()) => received,
            };
            match received {
                Ok(Some(envelope)) => {
                    if let Some(message) = inbox.accept(self.correlation_id, envelope) {
                        return Ok(Some(message));
                    }
                }
                Ok(None) => return Err(DispatchError::QueueClosed),
                Err(_) => return Ok(None),
            }
        }
    }

    async fn take_without_waiting(&self) -> Result<Option<PartitionReplyMessage>> {
        if self.closed.is_cancelled() {
            return Err(DispatchError::QueueClosed);
        }
        let mut inbox = self.inbox()?.lock().await;
        while let Ok(envelope) = inbox.rx.try_recv() {
            if let Some(message) = inbox.accept(self.correlation_id, envelope) {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    fn close(&self) {
        self.closed.cancel();
    }

    /// The coordinator side tears down its destination, so replies that
    /// arrive after collection ended are dropped instead of piling up.
    async fn release(&self) -> Result<()> {
        self.close();
        if self.inbox.is_some() {
            self.transport.close_destination(&self.destination).await?;
            tracing::debug!(destination = %self.destination, "Released partition reply queue");
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn reply_to(&self) -> Option<&str> {
        Some(&self.destination)
    }
}
