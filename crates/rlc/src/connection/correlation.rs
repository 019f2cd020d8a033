use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

use crate::protocol::ServerMessage;
use crate::{RlcError, RlcResult};

type Waiters = Arc<DashMap<String, oneshot::Sender<ServerMessage>>>;

/// Waiters for responses, keyed by correlation id
#[derive(Default)]
pub(crate) struct CorrelationMap {
    waiters: Waiters,
}

impl CorrelationMap {
    pub(crate) fn new() -> Self {
        Self {
            waiters: Arc::new(DashMap::new()),
        }
    }

    /// Register a waiter; a previous waiter for the same id is replaced
    pub(crate) fn register(&self, correlation_id: String) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(correlation_id.clone(), tx);
        PendingResponse {
            correlation_id,
            receiver: rx,
            waiters: self.waiters.clone(),
        }
    }

    /// Complete the waiter for `correlation_id`
    ///
    /// Returns false when nobody is waiting, e.g. for a response that
    /// arrives after its request timed out.
    pub(crate) fn complete(&self, correlation_id: &str, message: &ServerMessage) -> bool {
        match self.waiters.remove(correlation_id) {
            Some((_, tx)) => tx.send(message.clone()).is_ok(),
            None => {
                debug!(
                    "No waiter for correlation id '{}', dropping {}",
                    correlation_id,
                    message.kind()
                );
                false
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    pub(crate) fn clear(&self) {
        self.waiters.clear();
    }
}

/// A registered waiter for one response
pub struct PendingResponse {
    correlation_id: String,
    receiver: oneshot::Receiver<ServerMessage>,
    waiters: Waiters,
}

impl PendingResponse {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Wait for the response; on timeout the correlation entry is discarded
    pub async fn wait(self, timeout: Duration) -> RlcResult<ServerMessage> {
        let outcome = tokio::time::timeout(timeout, self.receiver).await;
        match outcome {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(RlcError::Internal(format!(
                "correlation '{}' was cancelled",
                self.correlation_id
            ))),
            Err(_) => {
                // The receiver is gone, so only this waiter's sender reports closed
                self.waiters
                    .remove_if(&self.correlation_id, |_, sender| sender.is_closed());
                debug!("Request '{}' timed out", self.correlation_id);
                Err(RlcError::RequestTimeout {
                    correlation_id: self.correlation_id,
                })
            }
        }
    }
}
