use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::TransportError;
use crate::transport::{Envelope, MessageTransport};

#[derive(Debug, Default)]
struct Destination {
    consumers: Vec<mpsc::UnboundedSender<Envelope>>,
    backlog: VecDeque<Envelope>,
    next: usize,
}

impl Destination {
    fn prune(&mut self) {
        self.consumers.retain(|c| !c.is_closed());
    }

    /// Round-robin delivery to one live consumer. Hands the envelope back
    /// when nobody is listening.
    fn deliver_one(&mut self, mut envelope: Envelope) -> Option<Envelope> {
        self.prune();
        while !self.consumers.is_empty() {
            let index = self.next % self.consumers.len();
            self.next = self.next.wrapping_add(1);
            match self.consumers[index].send(envelope) {
                Ok(()) => return None,
                Err(mpsc::error::SendError(returned)) => {
                    envelope = returned;
                    self.consumers.remove(index);
                }
            }
        }
        Some(envelope)
    }
}

/// How many closed destinations are remembered so late sends to them are dropped.
const CLOSED_RETAINED: usize = 1024;

#[derive(Debug, Default)]
struct Routes {
    destinations: HashMap<String, Destination>,
    closed: HashSet<String>,
    // Oldest first; bounds `closed`.
    closed_order: VecDeque<String>,
}

impl Routes {
    fn mark_closed(&mut self, destination: &str) {
        if self.closed.insert(destination.to_string()) {
            self.closed_order.push_back(destination.to_string());
        }
        while self.closed_order.len() > CLOSED_RETAINED {
            if let Some(oldest) = self.closed_order.pop_front() {
                self.closed.remove(&oldest);
            }
        }
    }

    fn reopen(&mut self, destination: &str) {
        if self.closed.remove(destination) {
            self.closed_order.retain(|d| d != destination);
        }
    }
}

/// Single-process transport shared by every node of an in-process cluster.
///
/// Point-to-point destinations keep a backlog until a consumer subscribes;
/// topics only reach subscribers present at publish time. Closed
/// destinations are forgotten, and sends to them are dropped.
#[derive(Debug)]
pub struct InMemoryTransport {
    routes: Mutex<Routes>,
    available: AtomicBool,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(Routes::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates a transport outage; sends and publishes fail while unavailable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Messages waiting on `destination` for a consumer.
    pub async fn backlog_len(&self, destination: &str) -> usize {
        self.routes
            .lock()
            .await
            .destinations
            .get(destination)
            .map(|d| d.backlog.len())
            .unwrap_or(0)
    }

    /// Destinations currently known, open or with a backlog.
    pub async fn destination_count(&self) -> usize {
        self.routes.lock().await.destinations.len()
    }

    fn check_available(&self, destination: &str) -> Result<(), TransportError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Unavailable(format!(
                "cannot reach destination {}",
                destination
            )))
        }
    }
}

#[async_trait]
impl MessageTransport for InMemoryTransport {
    async fn send(&self, destination: &str, envelope: Envelope) -> Result<(), TransportError> {
        self.check_available(destination)?;
        let mut routes = self.routes.lock().await;
        if routes.closed.contains(destination) {
            tracing::debug!(destination, envelope_id = %envelope.id, "Destination closed, message dropped");
            return Ok(());
        }
        let entry = routes.destinations.entry(destination.to_string()).or_default();
        if let Some(undelivered) = entry.deliver_one(envelope) {
            tracing::debug!(destination, "No consumer, message held in backlog");
            entry.backlog.push_back(undelivered);
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), TransportError> {
        self.check_available(topic)?;
        let mut routes = self.routes.lock().await;
        if let Some(entry) = routes.destinations.get_mut(topic) {
            entry.prune();
            for consumer in &entry.consumers {
                let _ = consumer.send(envelope.clone());
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        destination: &str,
    ) -> Result<mpsc::UnboundedReceiver<Envelope>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut routes = self.routes.lock().await;
        routes.reopen(destination);
        let entry = routes.destinations.entry(destination.to_string()).or_default();
        while let Some(envelope) = entry.backlog.pop_front() {
            // The receiver is alive in this scope, so this cannot fail.
            let _ = tx.send(envelope);
        }
        entry.consumers.push(tx);
        Ok(rx)
    }

    async fn close_destination(&self, destination: &str) -> Result<(), TransportError> {
        let mut routes = self.routes.lock().await;
        if let Some(entry) = routes.destinations.remove(destination) {
            if !entry.backlog.is_empty() {
                tracing::debug!(destination, dropped = entry.backlog.len(), "Discarding backlog of closed destination");
            }
        }
        routes.mark_closed(destination);
        Ok(())
    }
}
