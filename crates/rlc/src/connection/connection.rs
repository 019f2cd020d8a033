use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::ServerMessage;
use crate::{RlcError, RlcResult};

/// A raw transport session the connection manager can write to
pub trait ConnectionHandle: Send + Sync {
    /// Hand a message to the transport
    fn send(&self, message: &ServerMessage) -> RlcResult<()>;

    /// Whether the transport can currently accept messages
    fn is_ready(&self) -> bool {
        true
    }

    /// Close the transport; called once during cleanup
    fn close(&self) {}
}

/// The WebSocket writer task consumes this channel
impl ConnectionHandle for mpsc::UnboundedSender<ServerMessage> {
    fn send(&self, message: &ServerMessage) -> RlcResult<()> {
        mpsc::UnboundedSender::send(self, message.clone())
            .map_err(|_| RlcError::WebSocket("outbound channel closed".to_string()))
    }

    fn is_ready(&self) -> bool {
        !self.is_closed()
    }
}

/// Lifecycle status of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Degraded,
    Closing,
    Closed,
}

/// Whether a message may wait in the outbound queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Attempt now; fail if the connection is not ready
    Immediate,
    /// Queue when the connection is not ready
    Queued,
}

/// What happened to a message handed to a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    Queued,
    /// A delta dropped because a resync for its component is pending
    Superseded,
    NotReady,
    Failed(String),
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Sent | DeliveryOutcome::Queued)
    }
}

/// Per-connection counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMetrics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub errors: u64,
    pub messages_queued: u64,
    pub messages_dropped: u64,
    pub queue_depth: usize,
    pub missed_heartbeats: u32,
    pub connected_at_ms: i64,
    pub last_activity_ms: i64,
}

/// One persistent transport session, owned by the connection manager
pub struct Connection {
    id: String,
    handle: Arc<dyn ConnectionHandle>,
    pub(crate) status: ConnectionStatus,
    pub(crate) pool_id: Option<String>,
    pub(crate) last_activity_ms: i64,
    pub(crate) missed_heartbeats: u32,
    queue: VecDeque<ServerMessage>,
    queue_capacity: usize,
    /// Components whose deltas were lost; the flag records whether the
    /// resync request has been announced yet
    resync_pending: HashMap<String, bool>,
    metrics: ConnectionMetrics,
}

impl Connection {
    pub(crate) fn new(
        id: String,
        handle: Arc<dyn ConnectionHandle>,
        queue_capacity: usize,
        now_ms: i64,
    ) -> Self {
        Self {
            id,
            handle,
            status: ConnectionStatus::Connecting,
            pool_id: None,
            last_activity_ms: now_ms,
            missed_heartbeats: 0,
            queue: VecDeque::new(),
            queue_capacity,
            resync_pending: HashMap::new(),
            metrics: ConnectionMetrics {
                connected_at_ms: now_ms,
                last_activity_ms: now_ms,
                ..ConnectionMetrics::default()
            },
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn pool_id(&self) -> Option<&str> {
        self.pool_id.as_deref()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Ready to send: connected and the transport accepts messages
    pub fn is_ready(&self) -> bool {
        self.status == ConnectionStatus::Connected && self.handle.is_ready()
    }

    pub(crate) fn metrics(&self) -> ConnectionMetrics {
        ConnectionMetrics {
            queue_depth: self.queue.len(),
            missed_heartbeats: self.missed_heartbeats,
            last_activity_ms: self.last_activity_ms,
            ..self.metrics.clone()
        }
    }

    pub(crate) fn record_received(&mut self, now_ms: i64) {
        self.metrics.messages_received += 1;
        self.last_activity_ms = now_ms;
        self.missed_heartbeats = 0;
    }

    /// Hand a message to this connection, flushing any queued messages first
    pub(crate) fn deliver(&mut self, message: ServerMessage, delivery: Delivery) -> DeliveryOutcome {
        match &message {
            ServerMessage::Delta { component_id, .. }
                if self.resync_pending.contains_key(component_id) =>
            {
                self.metrics.messages_dropped += 1;
                debug!(
                    "Dropping delta for '{}' on connection {}: resync pending",
                    component_id, self.id
                );
                return DeliveryOutcome::Superseded;
            }
            ServerMessage::Resync { component_id, .. } => {
                // Everything queued for this component is older than the resync
                let component_id = component_id.clone();
                self.resync_pending.remove(&component_id);
                self.purge_deltas(&component_id);
            }
            _ => {}
        }

        if self.is_ready() {
            self.flush();
            if self.queue.is_empty() {
                return match self.transmit(&message) {
                    Ok(()) => DeliveryOutcome::Sent,
                    Err(reason) => DeliveryOutcome::Failed(reason),
                };
            }
        }

        match delivery {
            Delivery::Queued => self.enqueue(message),
            Delivery::Immediate => DeliveryOutcome::NotReady,
        }
    }

    /// Send a heartbeat probe, bypassing the queue
    pub(crate) fn probe(&mut self, timestamp: i64) -> Result<(), String> {
        if !self.handle.is_ready() {
            return Err("transport not ready".to_string());
        }
        self.transmit(&ServerMessage::Ping { timestamp })
    }

    /// Flush queued messages in FIFO order while the connection stays ready
    ///
    /// Returns the number of messages sent.
    pub(crate) fn flush(&mut self) -> usize {
        let mut flushed = 0;
        while self.is_ready() {
            let Some(message) = self.queue.pop_front() else {
                break;
            };
            if self.transmit(&message).is_err() {
                self.queue.push_front(message);
                break;
            }
            flushed += 1;
        }

        if flushed > 0 {
            debug!(
                "Flushed {} queued message(s) on connection {}",
                flushed, self.id
            );
        }
        flushed
    }

    /// Components whose resync has not been requested yet
    ///
    /// Only reported once the queue has drained, so the resync lands after
    /// everything that was already queued.
    pub(crate) fn take_unannounced_resyncs(&mut self) -> Vec<String> {
        if !self.is_ready() || !self.queue.is_empty() {
            return Vec::new();
        }

        let mut component_ids: Vec<String> = self
            .resync_pending
            .iter_mut()
            .filter(|(_, announced)| !**announced)
            .map(|(component_id, announced)| {
                *announced = true;
                component_id.clone()
            })
            .collect();
        component_ids.sort();
        component_ids
    }

    pub(crate) fn close(&mut self) {
        self.status = ConnectionStatus::Closed;
        self.queue.clear();
        self.resync_pending.clear();
        self.handle.close();
    }

    fn transmit(&mut self, message: &ServerMessage) -> Result<(), String> {
        match self.handle.send(message) {
            Ok(()) => {
                self.metrics.messages_sent += 1;
                Ok(())
            }
            Err(e) => {
                self.metrics.errors += 1;
                let err = RlcError::TransportSendFailure {
                    connection_id: self.id.clone(),
                    reason: e.to_string(),
                };
                warn!("{}", err);
                Err(e.to_string())
            }
        }
    }

    fn enqueue(&mut self, message: ServerMessage) -> DeliveryOutcome {
        while self.queue.len() >= self.queue_capacity {
            let Some(dropped) = self.queue.pop_front() else {
                break;
            };
            self.metrics.messages_dropped += 1;

            if let ServerMessage::Delta { component_id, .. }
            | ServerMessage::Resync { component_id, .. } = &dropped
            {
                warn!(
                    "Outbound queue overflow on connection {}: resync required for '{}'",
                    self.id, component_id
                );
                let component_id = component_id.clone();
                self.purge_deltas(&component_id);
                self.resync_pending.insert(component_id, false);
            }
        }

        if let ServerMessage::Delta { component_id, .. } = &message {
            if self.resync_pending.contains_key(component_id) {
                self.metrics.messages_dropped += 1;
                return DeliveryOutcome::Superseded;
            }
        }

        self.queue.push_back(message);
        self.metrics.messages_queued += 1;
        DeliveryOutcome::Queued
    }

    fn purge_deltas(&mut self, component_id: &str) {
        let before = self.queue.len();
        self.queue.retain(|queued| {
            !matches!(queued, ServerMessage::Delta { component_id: id, .. } if id == component_id)
        });
        self.metrics.messages_dropped += (before - self.queue.len()) as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::RecordingHandle;
    use crate::protocol::DeltaPayload;
    use serde_json::json;

    fn delta(component_id: &str, revision: u64) -> ServerMessage {
        ServerMessage::Delta {
            component_id: component_id.to_string(),
            revision,
            payload: DeltaPayload { changes: vec![] },
        }
    }

    fn connected(handle: Arc<RecordingHandle>, capacity: usize) -> Connection {
        let mut connection = Connection::new("c1".to_string(), handle, capacity, 0);
        connection.status = ConnectionStatus::Connected;
        connection
    }

    #[test]
    fn test_queue_flushes_in_fifo_order() {
        let handle = RecordingHandle::new();
        let mut connection = connected(handle.clone(), 10);

        handle.set_ready(false);
        for revision in 1..=3 {
            assert_eq!(
                connection.deliver(delta("x", revision), Delivery::Queued),
                DeliveryOutcome::Queued
            );
        }
        assert_eq!(
            connection.deliver(delta("x", 4), Delivery::Immediate),
            DeliveryOutcome::NotReady
        );
        assert_eq!(connection.queue_depth(), 3);

        handle.set_ready(true);
        assert_eq!(
            connection.deliver(delta("x", 4), Delivery::Queued),
            DeliveryOutcome::Sent
        );
        assert_eq!(handle.revisions("x"), vec![1, 2, 3, 4]);
        assert_eq!(connection.metrics().messages_sent, 4);
    }

    #[test]
    fn test_overflow_drops_oldest_and_requires_resync() {
        let handle = RecordingHandle::new();
        let mut connection = connected(handle.clone(), 2);
        handle.set_ready(false);

        let event = ServerMessage::Event {
            component_id: "y".to_string(),
            name: "ping".to_string(),
            payload: json!(null),
        };
        connection.deliver(delta("x", 1), Delivery::Queued);
        connection.deliver(event.clone(), Delivery::Queued);
        // Overflow evicts delta 1 for "x"
        connection.deliver(delta("y", 1), Delivery::Queued);
        // Further deltas for "x" are superseded by the pending resync
        assert_eq!(
            connection.deliver(delta("x", 2), Delivery::Queued),
            DeliveryOutcome::Superseded
        );

        // Not announced until the connection is ready and drained
        assert!(connection.take_unannounced_resyncs().is_empty());

        handle.set_ready(true);
        connection.flush();
        assert_eq!(connection.take_unannounced_resyncs(), vec!["x".to_string()]);
        assert!(connection.take_unannounced_resyncs().is_empty());

        let resync = ServerMessage::Resync {
            component_id: "x".to_string(),
            revision: 2,
            payload: serde_json::Map::new(),
        };
        assert_eq!(connection.deliver(resync, Delivery::Queued), DeliveryOutcome::Sent);
        assert_eq!(
            connection.deliver(delta("x", 3), Delivery::Queued),
            DeliveryOutcome::Sent
        );

        let kinds: Vec<&str> = handle.sent().iter().map(|m| m.kind()).collect();
        assert_eq!(kinds, vec!["event", "delta", "resync", "delta"]);
        assert_eq!(connection.metrics().messages_dropped, 2);
    }

    #[test]
    fn test_send_failure_is_counted_not_raised() {
        let handle = RecordingHandle::new();
        let mut connection = connected(handle.clone(), 2);
        handle.set_failing(true);

        let outcome = connection.deliver(delta("x", 1), Delivery::Queued);
        assert!(matches!(outcome, DeliveryOutcome::Failed(_)));
        assert_eq!(connection.metrics().errors, 1);
    }

    #[tokio::test]
    async fn test_unbounded_sender_handle() {
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
        let handle: Arc<dyn ConnectionHandle> = Arc::new(tx);
        let mut connection = Connection::new("ws".to_string(), handle.clone(), 4, 0);
        connection.status = ConnectionStatus::Connected;

        assert!(connection.is_ready());
        connection.deliver(delta("x", 1), Delivery::Immediate);
        assert_eq!(rx.recv().await, Some(delta("x", 1)));

        drop(rx);
        assert!(!handle.is_ready());
        assert!(handle.send(&delta("x", 2)).is_err());
    }
}
