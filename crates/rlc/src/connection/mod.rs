//! Connection registration, pooling, health monitoring and queued delivery.

#[allow(clippy::module_inception)]
mod connection;
mod correlation;
mod pool;

pub use connection::{
    Connection, ConnectionHandle, ConnectionMetrics, ConnectionStatus, Delivery, DeliveryOutcome,
};
pub use correlation::PendingResponse;
pub use pool::{LoadBalancePolicy, Pool, PoolMetrics};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::RlcConfig;
use crate::protocol::ServerMessage;
use crate::{RlcError, RlcResult};
use correlation::CorrelationMap;
use pool::PoolPick;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Where a message goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendTarget {
    /// A single connection
    Connection(String),
    /// Exactly one member of a pool, chosen by the pool's policy
    Pool(String),
    /// Every registered connection
    Broadcast,
}

/// Why a connection was removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Requested,
    HeartbeatTimeout,
    Shutdown,
}

/// Lifecycle notifications published by the connection manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Registered {
        connection_id: String,
        pool_id: Option<String>,
    },
    /// The connection is ready to send again after being degraded
    Ready { connection_id: String },
    Degraded { connection_id: String },
    Closed {
        connection_id: String,
        reason: CloseReason,
    },
    /// Deltas for these components were lost; a full resync must be sent
    ResyncRequired {
        connection_id: String,
        component_ids: Vec<String>,
    },
}

/// System-wide connection figures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    pub total_connections: usize,
    pub active_connections: usize,
    pub max_connections: usize,
    /// `active / max * 100`
    pub connection_utilization: f64,
    pub total_queued_messages: usize,
    pub pending_requests: usize,
    pub pools: BTreeMap<String, PoolMetrics>,
}

/// Result of one heartbeat pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub probed: usize,
    pub degraded: Vec<String>,
    pub closed: Vec<String>,
}

/// Owns every transport connection and the pools they belong to
///
/// All methods take `&self`; registries are concurrent maps and each
/// mutation is a short critical section.
pub struct ConnectionManager {
    config: RlcConfig,
    clock: Arc<dyn Clock>,
    connections: DashMap<String, Connection>,
    pools: DashMap<String, Pool>,
    // Serializes the capacity check with the insert
    admission: Mutex<()>,
    correlations: CorrelationMap,
    event_tx: broadcast::Sender<ConnectionEvent>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Create a new connection manager
    ///
    /// Fails with `Config` when the configuration does not validate.
    pub fn new(config: RlcConfig, clock: Arc<dyn Clock>) -> RlcResult<Self> {
        config.validate()?;
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            clock,
            connections: DashMap::new(),
            pools: DashMap::new(),
            admission: Mutex::new(()),
            correlations: CorrelationMap::new(),
            event_tx,
            health_task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &RlcConfig {
        &self.config
    }

    /// Subscribe to connection lifecycle events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// Admit a new connection, optionally into a pool
    ///
    /// Fails with `CapacityExceeded` when `max_connections` are already
    /// registered; the attempt is rejected, not queued.
    pub fn register_connection(
        &self,
        handle: Arc<dyn ConnectionHandle>,
        connection_id: impl Into<String>,
        pool_id: Option<&str>,
    ) -> RlcResult<()> {
        let connection_id = connection_id.into();
        let now = self.clock.now_ms();

        {
            let _admission = lock(&self.admission);

            if self.connections.contains_key(&connection_id) {
                return Err(RlcError::ConnectionExists { id: connection_id });
            }
            if self.connections.len() >= self.config.max_connections {
                warn!(
                    "Rejecting connection {}: capacity of {} reached",
                    connection_id, self.config.max_connections
                );
                return Err(RlcError::CapacityExceeded {
                    max: self.config.max_connections,
                });
            }

            let mut connection = Connection::new(
                connection_id.clone(),
                handle,
                self.config.message_queue_size,
                now,
            );
            connection.status = ConnectionStatus::Connected;
            self.connections.insert(connection_id.clone(), connection);
        }

        if let Some(pool_id) = pool_id {
            self.join_pool(&connection_id, pool_id)?;
        }

        info!(
            "Registered connection {} (pool: {:?})",
            connection_id, pool_id
        );
        self.publish(ConnectionEvent::Registered {
            connection_id,
            pool_id: pool_id.map(str::to_string),
        });
        Ok(())
    }

    /// Close a connection and release everything it holds
    pub fn unregister_connection(&self, connection_id: &str) -> RlcResult<()> {
        match self.connections.get_mut(connection_id) {
            Some(mut connection) => connection.status = ConnectionStatus::Closing,
            None => {
                return Err(RlcError::ConnectionNotFound {
                    id: connection_id.to_string(),
                })
            }
        }

        self.cleanup(connection_id, CloseReason::Requested);
        Ok(())
    }

    /// Create a pool, or change the policy of an existing one
    pub fn create_pool(&self, pool_id: &str, policy: LoadBalancePolicy) {
        self.pools
            .entry(pool_id.to_string())
            .and_modify(|pool| pool.set_policy(policy))
            .or_insert_with(|| {
                info!("Creating pool '{}' ({:?})", pool_id, policy);
                Pool::new(pool_id.to_string(), policy)
            });
    }

    /// Move a connection into a pool, leaving its previous pool
    ///
    /// The pool is created with the default policy if absent.
    pub fn join_pool(&self, connection_id: &str, pool_id: &str) -> RlcResult<()> {
        let previous = self
            .connections
            .get(connection_id)
            .map(|connection| connection.pool_id.clone())
            .ok_or_else(|| RlcError::ConnectionNotFound {
                id: connection_id.to_string(),
            })?;

        if previous.as_deref() == Some(pool_id) {
            return Ok(());
        }
        if previous.is_some() {
            self.leave_pool(connection_id)?;
        }

        self.pools
            .entry(pool_id.to_string())
            .or_insert_with(|| {
                info!("Creating pool '{}'", pool_id);
                Pool::new(pool_id.to_string(), LoadBalancePolicy::default())
            })
            .add(connection_id);

        if let Some(mut connection) = self.connections.get_mut(connection_id) {
            connection.pool_id = Some(pool_id.to_string());
        }

        debug!("Connection {} joined pool '{}'", connection_id, pool_id);
        Ok(())
    }

    /// Remove a connection from its pool; empty pools are removed
    pub fn leave_pool(&self, connection_id: &str) -> RlcResult<()> {
        let pool_id = match self.connections.get_mut(connection_id) {
            Some(mut connection) => connection.pool_id.take(),
            None => {
                return Err(RlcError::ConnectionNotFound {
                    id: connection_id.to_string(),
                })
            }
        };

        if let Some(pool_id) = pool_id {
            self.release_from_pool(connection_id, &pool_id);
        }
        Ok(())
    }

    fn release_from_pool(&self, connection_id: &str, pool_id: &str) {
        let now_empty = match self.pools.get_mut(pool_id) {
            Some(mut pool) => {
                pool.remove(connection_id);
                pool.is_empty()
            }
            None => false,
        };

        if now_empty {
            self.pools.remove_if(pool_id, |_, pool| pool.is_empty());
            debug!("Removed empty pool '{}'", pool_id);
        }
    }

    /// Send a message to a connection, a pool member, or everyone
    ///
    /// Returns whether at least one delivery succeeded (sent or queued).
    /// Failures on individual connections are logged and never abort a
    /// broadcast.
    pub fn send_message(&self, message: ServerMessage, target: SendTarget, delivery: Delivery) -> bool {
        if let Some(correlation_id) = message.correlation_id() {
            self.correlations.complete(correlation_id, &message);
        }

        match target {
            SendTarget::Connection(connection_id) => {
                self.deliver_logged(&connection_id, message, delivery)
            }
            SendTarget::Pool(pool_id) => match self.pick_pool_member(&pool_id) {
                Ok(PoolPick::Ready(connection_id)) => {
                    self.deliver_logged(&connection_id, message, delivery)
                }
                Ok(PoolPick::Unready(connection_id)) if delivery == Delivery::Queued => {
                    self.deliver_logged(&connection_id, message, delivery)
                }
                Ok(PoolPick::Unready(_)) => {
                    debug!("No ready member in pool '{}'", pool_id);
                    false
                }
                Err(e) => {
                    warn!("Send failed: {}", e);
                    false
                }
            },
            SendTarget::Broadcast => {
                let connection_ids: Vec<String> = self
                    .connections
                    .iter()
                    .map(|entry| entry.key().clone())
                    .collect();

                let mut delivered = false;
                for connection_id in connection_ids {
                    delivered |= self.deliver_logged(&connection_id, message.clone(), delivery);
                }
                delivered
            }
        }
    }

    /// Deliver to one connection, reporting the detailed outcome
    pub fn send_to(
        &self,
        connection_id: &str,
        message: ServerMessage,
        delivery: Delivery,
    ) -> RlcResult<DeliveryOutcome> {
        let (outcome, resyncs) = {
            let mut connection =
                self.connections
                    .get_mut(connection_id)
                    .ok_or_else(|| RlcError::ConnectionNotFound {
                        id: connection_id.to_string(),
                    })?;
            let outcome = connection.deliver(message, delivery);
            (outcome, connection.take_unannounced_resyncs())
        };

        self.announce_resyncs(connection_id, resyncs);
        Ok(outcome)
    }

    fn deliver_logged(&self, connection_id: &str, message: ServerMessage, delivery: Delivery) -> bool {
        match self.send_to(connection_id, message, delivery) {
            Ok(outcome) => outcome.is_success(),
            Err(e) => {
                warn!("Send failed: {}", e);
                false
            }
        }
    }

    fn pick_pool_member(&self, pool_id: &str) -> RlcResult<PoolPick> {
        let mut pool = self
            .pools
            .get_mut(pool_id)
            .ok_or_else(|| RlcError::PoolNotFound {
                id: pool_id.to_string(),
            })?;

        pool.pick(
            |id| {
                self.connections
                    .get(id)
                    .map(|connection| connection.is_ready())
                    .unwrap_or(false)
            },
            |id| {
                self.connections
                    .get(id)
                    .map(|connection| connection.queue_depth())
                    .unwrap_or(usize::MAX)
            },
        )
        .ok_or_else(|| RlcError::PoolNotFound {
            id: pool_id.to_string(),
        })
    }

    fn announce_resyncs(&self, connection_id: &str, component_ids: Vec<String>) {
        if component_ids.is_empty() {
            return;
        }
        info!(
            "Requesting resync of {} component(s) for connection {}",
            component_ids.len(),
            connection_id
        );
        self.publish(ConnectionEvent::ResyncRequired {
            connection_id: connection_id.to_string(),
            component_ids,
        });
    }

    /// Record inbound traffic on a connection
    ///
    /// Resets missed heartbeats and brings a degraded connection back.
    pub fn record_activity(&self, connection_id: &str) -> RlcResult<()> {
        let now = self.clock.now_ms();
        let recovered = {
            let mut connection =
                self.connections
                    .get_mut(connection_id)
                    .ok_or_else(|| RlcError::ConnectionNotFound {
                        id: connection_id.to_string(),
                    })?;
            connection.record_received(now);
            connection.status == ConnectionStatus::Degraded
        };

        if recovered {
            self.mark_ready(connection_id)?;
        }
        Ok(())
    }

    /// Mark a connection ready and flush its queue
    pub fn mark_ready(&self, connection_id: &str) -> RlcResult<usize> {
        let (flushed, resyncs) = {
            let mut connection =
                self.connections
                    .get_mut(connection_id)
                    .ok_or_else(|| RlcError::ConnectionNotFound {
                        id: connection_id.to_string(),
                    })?;
            connection.status = ConnectionStatus::Connected;
            connection.missed_heartbeats = 0;
            let flushed = connection.flush();
            (flushed, connection.take_unannounced_resyncs())
        };

        info!(
            "Connection {} ready, flushed {} queued message(s)",
            connection_id, flushed
        );
        self.publish(ConnectionEvent::Ready {
            connection_id: connection_id.to_string(),
        });
        self.announce_resyncs(connection_id, resyncs);
        Ok(flushed)
    }

    /// Run one heartbeat pass over every connection
    ///
    /// A connection silent for a full heartbeat interval misses a heartbeat
    /// and becomes degraded. Beyond `max_missed_heartbeats`, or once silent
    /// for `connection_timeout_ms`, it is force-closed.
    pub fn check_health(&self) -> HealthReport {
        let now = self.clock.now_ms();
        let interval_ms = self.config.heartbeat_interval_ms as i64;
        let timeout_ms = self.config.connection_timeout_ms as i64;
        let mut report = HealthReport::default();
        let mut resyncs = Vec::new();

        let connection_ids: Vec<String> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        for connection_id in connection_ids {
            let Some(mut connection) = self.connections.get_mut(&connection_id) else {
                continue;
            };

            let silent_ms = now - connection.last_activity_ms;
            if silent_ms >= interval_ms {
                connection.missed_heartbeats += 1;
            }

            if connection.missed_heartbeats > self.config.max_missed_heartbeats
                || silent_ms >= timeout_ms
            {
                warn!(
                    "Connection {} missed {} heartbeat(s), silent for {}ms: closing",
                    connection_id, connection.missed_heartbeats, silent_ms
                );
                report.closed.push(connection_id.clone());
                continue;
            }

            if connection.missed_heartbeats > 0 && connection.status == ConnectionStatus::Connected
            {
                warn!(
                    "Connection {} degraded after {} missed heartbeat(s)",
                    connection_id, connection.missed_heartbeats
                );
                connection.status = ConnectionStatus::Degraded;
                report.degraded.push(connection_id.clone());
            }

            if let Err(reason) = connection.probe(now) {
                debug!("Heartbeat probe to {} failed: {}", connection_id, reason);
            }
            report.probed += 1;

            // Transports may become writable again without inbound traffic
            if connection.flush() > 0 {
                resyncs.push((connection_id.clone(), connection.take_unannounced_resyncs()));
            }
        }

        for connection_id in &report.degraded {
            self.publish(ConnectionEvent::Degraded {
                connection_id: connection_id.clone(),
            });
        }
        for (connection_id, component_ids) in resyncs {
            self.announce_resyncs(&connection_id, component_ids);
        }
        for connection_id in &report.closed {
            self.cleanup(connection_id, CloseReason::HeartbeatTimeout);
        }

        report
    }

    /// Run [`check_health`](Self::check_health) every heartbeat interval
    ///
    /// Replaces a previously started monitor.
    pub fn start_health_monitor(self: &Arc<Self>) {
        let manager: Weak<Self> = Arc::downgrade(self);
        let period = self.config.heartbeat_interval();

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            info!("Started connection health monitor ({:?})", period);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let report = manager.check_health();
                if !report.closed.is_empty() {
                    info!(
                        "Health check closed {} connection(s)",
                        report.closed.len()
                    );
                }
            }
            debug!("Connection health monitor ended");
        });

        if let Some(previous) = lock(&self.health_task).replace(task) {
            previous.abort();
        }
    }

    /// Remove a connection: release it from its pool, drop its queue and metrics
    fn cleanup(&self, connection_id: &str, reason: CloseReason) {
        let Some((_, mut connection)) = self.connections.remove(connection_id) else {
            return;
        };

        let pool_id = connection.pool_id.take();
        connection.close();
        if let Some(pool_id) = pool_id {
            self.release_from_pool(connection_id, &pool_id);
        }

        info!("Connection {} closed ({:?})", connection_id, reason);
        self.publish(ConnectionEvent::Closed {
            connection_id: connection_id.to_string(),
            reason,
        });
    }

    /// Close and remove every connection and pool
    ///
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        if let Some(task) = lock(&self.health_task).take() {
            task.abort();
        }

        let connection_ids: Vec<String> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let count = connection_ids.len();

        for connection_id in connection_ids {
            self.cleanup(&connection_id, CloseReason::Shutdown);
        }
        self.pools.clear();
        self.correlations.clear();

        if count > 0 {
            info!("Connection manager shut down, closed {} connection(s)", count);
        }
    }

    /// Register a waiter for the response carrying `correlation_id`
    ///
    /// Register before sending the request so a fast response is not missed.
    pub fn expect_response(&self, correlation_id: impl Into<String>) -> PendingResponse {
        self.correlations.register(correlation_id.into())
    }

    /// Wait for a registered response, up to `request_timeout_ms`
    ///
    /// On timeout the correlation entry is discarded and a late response is
    /// dropped.
    pub async fn await_response(&self, pending: PendingResponse) -> RlcResult<ServerMessage> {
        pending.wait(self.config.request_timeout()).await
    }

    /// Per-connection counters
    pub fn connection_metrics(&self, connection_id: &str) -> Option<ConnectionMetrics> {
        self.connections
            .get(connection_id)
            .map(|connection| connection.metrics())
    }

    /// System-wide snapshot of connections and pools
    pub fn system_metrics(&self) -> SystemMetrics {
        let mut total_connections = 0;
        let mut active_connections = 0;
        let mut total_queued_messages = 0;

        for entry in self.connections.iter() {
            total_connections += 1;
            total_queued_messages += entry.queue_depth();
            if entry.status() == ConnectionStatus::Connected {
                active_connections += 1;
            }
        }

        let pools = self
            .pools
            .iter()
            .map(|entry| (entry.key().clone(), entry.metrics()))
            .collect();

        let max_connections = self.config.max_connections;
        SystemMetrics {
            total_connections,
            active_connections,
            max_connections,
            connection_utilization: active_connections as f64 / max_connections as f64 * 100.0,
            total_queued_messages,
            pending_requests: self.correlations.len(),
            pools,
        }
    }

    pub fn status(&self, connection_id: &str) -> Option<ConnectionStatus> {
        self.connections
            .get(connection_id)
            .map(|connection| connection.status())
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.connections.contains_key(connection_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn pool_of(&self, connection_id: &str) -> Option<String> {
        self.connections
            .get(connection_id)
            .and_then(|connection| connection.pool_id.clone())
    }

    /// Members of a pool in rotation order
    pub fn pool_members(&self, pool_id: &str) -> Option<Vec<String>> {
        self.pools.get(pool_id).map(|pool| pool.members().to_vec())
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    fn publish(&self, event: ConnectionEvent) {
        if self.event_tx.send(event).is_err() {
            debug!("No listeners for connection events");
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.health_task).take() {
            task.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
