//! Message transport seam used by queued dispatch and cross-node reply queues.
//!
//! Only at-least-once delivery is assumed. Receivers de-duplicate through
//! the store's idempotent transitions (job requests, partition records) or
//! through per-partition sequence numbers (replies).

pub mod codec;
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::TransportError;

pub use memory::InMemoryTransport;

pub const HEADER_KIND: &str = "kind";
pub const HEADER_CORRELATION_ID: &str = "correlation_id";

/// Opaque message as carried by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub sent_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            headers: BTreeMap::new(),
            body,
            sent_at: Utc::now(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Point-to-point: exactly one current subscriber of `destination`
    /// receives the envelope. Held until a subscriber exists.
    async fn send(&self, destination: &str, envelope: Envelope) -> Result<(), TransportError>;

    /// Fan-out to every current subscriber of `topic`; not retained.
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), TransportError>;

    /// Registers a new consumer. Dropping the receiver unsubscribes.
    async fn subscribe(
        &self,
        destination: &str,
    ) -> Result<mpsc::UnboundedReceiver<Envelope>, TransportError>;

    /// Tears down a destination nobody will consume again. Its consumers and
    /// backlog are discarded and later sends to it are dropped.
    async fn close_destination(&self, destination: &str) -> Result<(), TransportError>;
}
