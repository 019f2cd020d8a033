//! Hosts component instances and dispatches remote method calls.
//!
//! Calls on one instance are applied one at a time in arrival order; calls
//! on different instances run concurrently. Every state-changing call bumps
//! the revision and pushes a delta to the instance's subscribers through the
//! connection manager.

mod component;
mod instance;

pub use component::{ComponentType, MethodContext, MethodResult};
pub use instance::{Lifecycle, Subscription};

use dashmap::DashMap;
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::RlcConfig;
use crate::connection::{ConnectionEvent, ConnectionManager, Delivery, SendTarget};
use crate::identity::{ComponentIdentity, IdentityKey, IdentityManager};
use crate::integrity::{self, StateSnapshot};
use crate::protocol::{diff_states, Change, ClientMessage, DeltaPayload, ServerMessage, StateMap};
use crate::{RlcError, RlcResult};
use component::MethodHandler;
use instance::{DeltaListener, EventListener, Instance, InstanceState, Listener};

/// Result of [`ComponentRuntime::instantiate_for`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstantiateOutcome {
    pub component_id: String,
    pub revision: u64,
    pub state: StateMap,
    /// A new instance was created rather than an existing one reused
    pub created: bool,
    /// A suspended instance was brought back
    pub resumed: bool,
    /// The initial state came from a verified snapshot
    pub hydrated: bool,
    /// Error code of a snapshot that was offered but refused
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hydration_error: Option<String>,
}

/// What a committed call hands to subscribers
struct Commit {
    revision: Option<u64>,
    changes: Vec<Change>,
    subscribers: Vec<String>,
    delta_listeners: Vec<DeltaListener>,
    event_listeners: Vec<EventListener>,
}

/// The component runtime
pub struct ComponentRuntime {
    config: RlcConfig,
    clock: Arc<dyn Clock>,
    connections: Arc<ConnectionManager>,
    types: DashMap<String, Arc<ComponentType>>,
    // Lock order: identities, then instances, then an instance's own lock
    identities: Mutex<IdentityManager>,
    instances: DashMap<String, Arc<Instance>>,
    /// Snapshots loaded from storage, consumed on first instantiation
    staged: DashMap<String, StateSnapshot>,
    tasks: Mutex<JoinSet<()>>,
}

impl ComponentRuntime {
    /// Create a runtime delivering through `connections`
    ///
    /// Fails with `Config` when the configuration does not validate.
    pub fn new(
        config: RlcConfig,
        clock: Arc<dyn Clock>,
        connections: Arc<ConnectionManager>,
    ) -> RlcResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            clock,
            connections,
            types: DashMap::new(),
            identities: Mutex::new(IdentityManager::new()),
            instances: DashMap::new(),
            staged: DashMap::new(),
            tasks: Mutex::new(JoinSet::new()),
        })
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn config(&self) -> &RlcConfig {
        &self.config
    }

    /// Register a component type; replaces a type of the same name
    pub fn register_type(&self, component_type: ComponentType) {
        info!(
            "Registered component type '{}' with methods {:?}",
            component_type.name(),
            component_type.method_names()
        );
        self.types
            .insert(component_type.name().to_string(), Arc::new(component_type));
    }

    pub fn component_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    /// Create a component, or return the id of the live one its identity
    /// resolves to
    pub async fn instantiate(
        &self,
        component_type: &str,
        props: JsonValue,
        supplied_id: Option<&str>,
        parent_id: Option<&str>,
    ) -> RlcResult<String> {
        self.instantiate_for(None, component_type, props, supplied_id, parent_id, None)
            .await
            .map(|outcome| outcome.component_id)
    }

    /// Instantiate on behalf of a connection, which becomes an owner and a
    /// subscriber
    ///
    /// A new instance is hydrated from `snapshot` (or a stored snapshot)
    /// when it verifies; otherwise the type's initializer is used alone. A
    /// connection reattaching to an existing instance receives a `resync`.
    pub async fn instantiate_for(
        &self,
        connection_id: Option<&str>,
        component_type: &str,
        props: JsonValue,
        supplied_id: Option<&str>,
        parent_id: Option<&str>,
        snapshot: Option<StateSnapshot>,
    ) -> RlcResult<InstantiateOutcome> {
        let component_type = self
            .types
            .get(component_type)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RlcError::ComponentTypeNotFound {
                component_type: component_type.to_string(),
            })?;

        if let Some(connection_id) = connection_id {
            if !self.connections.contains(connection_id) {
                return Err(RlcError::ConnectionNotFound {
                    id: connection_id.to_string(),
                });
            }
        }

        let key = match supplied_id {
            Some(id) => IdentityKey::Supplied(id),
            None => IdentityKey::Props(&props),
        };

        let mut hydrated = false;
        let mut hydration_error = None;

        let (instance, created) = {
            let mut identities = lock(&self.identities);
            let identity = identities.resolve_or_create(component_type.name(), key, parent_id)?;
            let component_id = identity.component_id;

            let existing = self
                .instances
                .get(&component_id)
                .map(|entry| entry.value().clone());

            match existing {
                Some(existing) => (existing, false),
                None => {
                    let mut state = component_type.initial_state(&props);
                    let offered = snapshot.or_else(|| {
                        self.staged
                            .remove(&component_id)
                            .map(|(_, snapshot)| snapshot)
                    });

                    if let Some(snapshot) = offered {
                        match integrity::verify_snapshot(
                            &snapshot,
                            self.config.snapshot_max_age_ms,
                            self.secret(),
                            self.clock.now_ms(),
                        ) {
                            Ok(()) => {
                                // Transient keys are not covered by the checksum
                                state.extend(
                                    snapshot
                                        .data
                                        .into_iter()
                                        .filter(|(key, _)| !integrity::is_transient_key(key)),
                                );
                                hydrated = true;
                            }
                            Err(e) => {
                                warn!("Refusing snapshot for '{}': {}", component_id, e);
                                hydration_error = Some(e.code().to_string());
                            }
                        }
                    }

                    let instance = Arc::new(Instance::new(
                        component_id.clone(),
                        component_type.clone(),
                        props,
                    ));
                    instance.activate(state);
                    self.instances.insert(component_id.clone(), instance.clone());

                    info!(
                        "Instantiated component '{}'{}",
                        component_id,
                        if hydrated { " from snapshot" } else { "" }
                    );
                    (instance, true)
                }
            }
        };

        let mut resumed = false;
        let (revision, state) = match connection_id {
            Some(connection_id) => {
                let _gate = instance.call_gate.lock().await;
                let (resync, revision, state) = {
                    let mut inner = instance.lock();
                    ensure_alive(&instance, &inner)?;

                    resumed = inner.lifecycle == Lifecycle::Suspended;
                    inner.resume();
                    inner.owners.insert(connection_id.to_string());
                    inner.subscribers.insert(connection_id.to_string());
                    (
                        resync_message(&instance.component_id, &inner),
                        inner.revision,
                        inner.state.clone(),
                    )
                };

                if resumed {
                    info!(
                        "Resumed component '{}' for connection {}",
                        instance.component_id, connection_id
                    );
                }
                if !created {
                    self.deliver(connection_id, resync);
                }
                (revision, state)
            }
            None => {
                let inner = instance.lock();
                ensure_alive(&instance, &inner)?;
                (inner.revision, inner.state.clone())
            }
        };

        Ok(InstantiateOutcome {
            component_id: instance.component_id.clone(),
            revision,
            state,
            created,
            resumed,
            hydrated,
            hydration_error,
        })
    }

    /// Invoke a method on a component
    pub async fn call(
        &self,
        component_id: &str,
        method: &str,
        args: Vec<JsonValue>,
    ) -> RlcResult<JsonValue> {
        self.call_from(None, component_id, method, args).await
    }

    /// Invoke a method on behalf of a connection
    ///
    /// The calling connection becomes an owner of the instance. Handler
    /// errors and panics are reported as `MethodFailed` and leave the state
    /// untouched.
    pub async fn call_from(
        &self,
        connection_id: Option<&str>,
        component_id: &str,
        method: &str,
        args: Vec<JsonValue>,
    ) -> RlcResult<JsonValue> {
        let instance = self.instance(component_id)?;
        let handler = instance.component_type.handler(method).ok_or_else(|| {
            RlcError::MethodNotFound {
                component_type: instance.component_type.name().to_string(),
                method: method.to_string(),
            }
        })?;

        let _gate = instance.call_gate.lock().await;

        let ctx = {
            let mut inner = instance.lock();
            ensure_alive(&instance, &inner)?;
            if let Some(connection_id) = connection_id {
                inner.owners.insert(connection_id.to_string());
                inner.resume();
            }
            MethodContext::new(component_id.to_string(), inner.state.clone(), args)
        };

        let (ctx, value) = match run_handler(handler, ctx).await {
            Ok((ctx, Ok(value))) => (ctx, value),
            Ok((_, Err(message))) => {
                warn!("Method '{}' on '{}' failed: {}", method, component_id, message);
                return Err(RlcError::MethodFailed {
                    method: method.to_string(),
                    message,
                });
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("Method '{}' on '{}' panicked: {}", method, component_id, message);
                return Err(RlcError::MethodFailed {
                    method: method.to_string(),
                    message: format!("handler panicked: {}", message),
                });
            }
        };

        let (state, events) = ctx.into_parts();
        let commit = {
            let mut inner = instance.lock();
            if inner.lifecycle == Lifecycle::Destroyed {
                debug!(
                    "Component '{}' was released during '{}'; discarding its changes",
                    component_id, method
                );
                return Ok(value);
            }

            let changes = diff_states(&inner.state, &state);
            let revision = if changes.is_empty() {
                None
            } else {
                inner.state = state;
                inner.revision += 1;
                inner.checksum = None;
                Some(inner.revision)
            };

            Commit {
                revision,
                changes,
                subscribers: inner.subscribers.iter().cloned().collect(),
                delta_listeners: inner.delta_listeners(),
                event_listeners: inner.event_listeners(),
            }
        };

        debug!(
            "Called '{}' on '{}' (revision: {:?}, events: {})",
            method,
            component_id,
            commit.revision,
            events.len()
        );
        self.publish(component_id, commit, events);
        Ok(value)
    }

    /// Push a committed call's delta and events, in that order
    fn publish(&self, component_id: &str, commit: Commit, events: Vec<(String, JsonValue)>) {
        if let Some(revision) = commit.revision {
            let delta = ServerMessage::Delta {
                component_id: component_id.to_string(),
                revision,
                payload: DeltaPayload {
                    changes: commit.changes.clone(),
                },
            };
            for connection_id in &commit.subscribers {
                self.deliver(connection_id, delta.clone());
            }
            for listener in &commit.delta_listeners {
                listener(revision, &commit.changes);
            }
        }

        for (name, payload) in events {
            let event = ServerMessage::Event {
                component_id: component_id.to_string(),
                name: name.clone(),
                payload: payload.clone(),
            };
            for connection_id in &commit.subscribers {
                self.deliver(connection_id, event.clone());
            }
            for listener in &commit.event_listeners {
                listener(&name, &payload);
            }
        }
    }

    /// Listen to a component's deltas and events in-process
    pub fn subscribe<D, E>(&self, component_id: &str, on_delta: D, on_event: E) -> RlcResult<Subscription>
    where
        D: Fn(u64, &[Change]) + Send + Sync + 'static,
        E: Fn(&str, &JsonValue) + Send + Sync + 'static,
    {
        let instance = self.instance(component_id)?;
        let listener_id = instance.add_listener(Listener {
            on_delta: Arc::new(on_delta),
            on_event: Arc::new(on_event),
        });
        Ok(Subscription::new(&instance, listener_id, self.clock.clone()))
    }

    /// Subscribe a connection to a component and send it a full `resync`
    ///
    /// Returns the revision the connection was synced to.
    pub async fn attach(&self, connection_id: &str, component_id: &str) -> RlcResult<u64> {
        if !self.connections.contains(connection_id) {
            return Err(RlcError::ConnectionNotFound {
                id: connection_id.to_string(),
            });
        }

        let instance = self.instance(component_id)?;
        let _gate = instance.call_gate.lock().await;
        let (resync, revision) = {
            let mut inner = instance.lock();
            ensure_alive(&instance, &inner)?;
            inner.subscribers.insert(connection_id.to_string());
            (resync_message(component_id, &inner), inner.revision)
        };

        debug!("Connection {} attached to '{}'", connection_id, component_id);
        self.deliver(connection_id, resync);
        Ok(revision)
    }

    /// Stop sending a component's deltas and events to a connection
    pub fn detach(&self, connection_id: &str, component_id: &str) -> RlcResult<()> {
        let instance = self.instance(component_id)?;
        let mut inner = instance.lock();
        if inner.subscribers.remove(connection_id) {
            inner.start_orphan_clock(self.clock.now_ms());
            debug!("Connection {} detached from '{}'", connection_id, component_id);
        }
        Ok(())
    }

    /// Send the current full state of a component to one subscriber
    ///
    /// Runs between calls on the instance, so the resync never overtakes a
    /// delta for an older revision.
    pub async fn send_resync(&self, connection_id: &str, component_id: &str) -> RlcResult<()> {
        let instance = self.instance(component_id)?;
        let _gate = instance.call_gate.lock().await;
        let resync = {
            let inner = instance.lock();
            ensure_alive(&instance, &inner)?;
            if !inner.subscribers.contains(connection_id) {
                debug!(
                    "Skipping resync of '{}': {} is no longer subscribed",
                    component_id, connection_id
                );
                return Ok(());
            }
            resync_message(component_id, &inner)
        };

        info!("Resyncing '{}' on connection {}", component_id, connection_id);
        self.deliver(connection_id, resync);
        Ok(())
    }

    /// Destroy a component and all of its descendants, innermost first
    ///
    /// Returns the destroyed ids in teardown order.
    pub fn release(&self, component_id: &str) -> RlcResult<Vec<String>> {
        let mut identities = lock(&self.identities);
        if !identities.contains(component_id) {
            return Err(RlcError::ComponentNotFound {
                id: component_id.to_string(),
            });
        }

        let removed = identities.cleanup(component_id);
        for id in &removed {
            if let Some((_, instance)) = self.instances.remove(id) {
                instance.destroy();
            }
            self.staged.remove(id);
        }

        info!(
            "Released component '{}' ({} instance(s) destroyed)",
            component_id,
            removed.len()
        );
        Ok(removed)
    }

    /// React to a connection going away
    ///
    /// Instances that lose their last owner are suspended while subscribers
    /// remain and destroyed otherwise. Returns the destroyed ids.
    pub fn handle_connection_closed(&self, connection_id: &str) -> Vec<String> {
        let now = self.clock.now_ms();
        let instances: Vec<Arc<Instance>> = self
            .instances
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut orphaned = Vec::new();
        for instance in instances {
            let mut inner = instance.lock();
            let was_subscriber = inner.subscribers.remove(connection_id);
            let was_owner = inner.owners.remove(connection_id);

            if was_subscriber {
                inner.start_orphan_clock(now);
            }
            if !was_owner || !inner.owners.is_empty() || inner.lifecycle != Lifecycle::Active {
                continue;
            }

            if inner.has_subscribers() {
                inner.lifecycle = Lifecycle::Suspended;
                inner.suspended_since_ms = Some(now);
                info!(
                    "Suspended component '{}': owner {} disconnected, {} subscriber(s) remain",
                    instance.component_id,
                    connection_id,
                    inner.subscribers.len() + inner.listeners.len()
                );
            } else {
                orphaned.push(instance.component_id.clone());
            }
        }

        self.release_all(orphaned)
    }

    /// Destroy suspended instances that have had no subscribers for the
    /// configured time-to-live
    pub fn sweep_suspended(&self) -> Vec<String> {
        let now = self.clock.now_ms();
        let ttl_ms = self.config.suspended_ttl_ms;

        let expired: Vec<String> = self
            .instances
            .iter()
            .filter(|entry| {
                let inner = entry.value().lock();
                inner.lifecycle == Lifecycle::Suspended
                    && !inner.has_subscribers()
                    && inner
                        .suspended_since_ms
                        .is_some_and(|since| now - since >= ttl_ms)
            })
            .map(|entry| entry.key().clone())
            .collect();

        if !expired.is_empty() {
            info!("Reclaiming {} expired suspended component(s)", expired.len());
        }
        self.release_all(expired)
    }

    fn release_all(&self, component_ids: Vec<String>) -> Vec<String> {
        let mut destroyed = Vec::new();
        for component_id in component_ids {
            match self.release(&component_id) {
                Ok(removed) => destroyed.extend(removed),
                // Already gone with an ancestor
                Err(e) => debug!("Skipping release of '{}': {}", component_id, e),
            }
        }
        destroyed
    }

    /// Route one connection lifecycle event
    pub async fn handle_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Closed {
                connection_id,
                reason,
            } => {
                let destroyed = self.handle_connection_closed(&connection_id);
                debug!(
                    "Connection {} closed ({:?}); destroyed {} component(s)",
                    connection_id,
                    reason,
                    destroyed.len()
                );
            }
            ConnectionEvent::ResyncRequired {
                connection_id,
                component_ids,
            } => {
                for component_id in component_ids {
                    if let Err(e) = self.send_resync(&connection_id, &component_id).await {
                        debug!("Resync of '{}' skipped: {}", component_id, e);
                    }
                }
            }
            other => debug!("Connection event: {:?}", other),
        }
    }

    /// Apply a message received from a connection and reply to it
    pub async fn handle_client_message(&self, connection_id: &str, message: ClientMessage) {
        if let Err(e) = self.connections.record_activity(connection_id) {
            debug!("Activity on unknown connection: {}", e);
        }

        let reply = match message {
            ClientMessage::Instantiate {
                correlation_id,
                component_type,
                props,
                supplied_id,
                parent_id,
                snapshot,
            } => {
                debug!(
                    "Connection {} instantiating '{}'",
                    connection_id, component_type
                );
                let outcome = self
                    .instantiate_for(
                        Some(connection_id),
                        &component_type,
                        props,
                        supplied_id.as_deref(),
                        parent_id.as_deref(),
                        snapshot,
                    )
                    .await;
                Some(match outcome {
                    Ok(outcome) => respond(
                        Some(outcome.component_id.clone()),
                        correlation_id,
                        serde_json::to_value(&outcome),
                    ),
                    Err(e) => ServerMessage::error(&e, None, correlation_id),
                })
            }

            ClientMessage::Call {
                component_id,
                correlation_id,
                method,
                args,
            } => Some(
                match self
                    .call_from(Some(connection_id), &component_id, &method, args)
                    .await
                {
                    Ok(value) => ServerMessage::Response {
                        component_id: Some(component_id),
                        correlation_id: Some(correlation_id),
                        payload: value,
                    },
                    Err(e) => ServerMessage::error(&e, Some(component_id), Some(correlation_id)),
                },
            ),

            ClientMessage::Subscribe { component_id } => self
                .attach(connection_id, &component_id)
                .await
                .err()
                .map(|e| ServerMessage::error(&e, Some(component_id), None)),

            ClientMessage::Unsubscribe { component_id } => self
                .detach(connection_id, &component_id)
                .err()
                .map(|e| ServerMessage::error(&e, Some(component_id), None)),

            ClientMessage::Release {
                component_id,
                correlation_id,
            } => Some(match self.release(&component_id) {
                Ok(released) => respond(
                    Some(component_id),
                    correlation_id,
                    Ok(json!({ "released": released })),
                ),
                Err(e) => ServerMessage::error(&e, Some(component_id), correlation_id),
            }),

            ClientMessage::Snapshot {
                component_id,
                correlation_id,
            } => Some(match self.snapshot(&component_id) {
                Ok(snapshot) => respond(
                    Some(component_id),
                    correlation_id,
                    serde_json::to_value(&snapshot),
                ),
                Err(e) => ServerMessage::error(&e, Some(component_id), correlation_id),
            }),

            ClientMessage::Pong { .. } => None,
        };

        if let Some(reply) = reply {
            if let ServerMessage::Error { code, message, .. } = &reply {
                warn!("Request from {} failed ({}): {}", connection_id, code, message);
            }
            self.deliver(connection_id, reply);
        }
    }

    /// Capture a checksummed snapshot of a component's current state
    pub fn snapshot(&self, component_id: &str) -> RlcResult<StateSnapshot> {
        let instance = self.instance(component_id)?;
        let mut inner = instance.lock();
        ensure_alive(&instance, &inner)?;

        let snapshot = integrity::create_snapshot(&inner.state, self.secret(), self.clock.now_ms());
        inner.checksum = Some(snapshot.checksum.clone());
        Ok(snapshot)
    }

    /// Checksum of the current state, computed on first use after a change
    pub fn checksum(&self, component_id: &str) -> RlcResult<String> {
        let instance = self.instance(component_id)?;
        let mut inner = instance.lock();
        ensure_alive(&instance, &inner)?;

        if let Some(checksum) = &inner.checksum {
            return Ok(checksum.clone());
        }
        let checksum = integrity::compute_checksum(&inner.state, self.secret());
        inner.checksum = Some(checksum.clone());
        Ok(checksum)
    }

    /// Short debug key for a component, see [`integrity::fingerprint`]
    pub fn fingerprint(&self, component_id: &str) -> RlcResult<String> {
        let instance = self.instance(component_id)?;
        Ok(integrity::fingerprint(
            instance.component_type.name(),
            component_id,
            &instance.props,
        ))
    }

    /// Offer a stored snapshot for the next instantiation of `component_id`
    pub fn stage_snapshot(&self, component_id: impl Into<String>, snapshot: StateSnapshot) {
        self.staged.insert(component_id.into(), snapshot);
    }

    pub fn state(&self, component_id: &str) -> Option<StateMap> {
        self.instances
            .get(component_id)
            .map(|instance| instance.lock().state.clone())
    }

    pub fn revision(&self, component_id: &str) -> Option<u64> {
        self.instances
            .get(component_id)
            .map(|instance| instance.lock().revision)
    }

    pub fn lifecycle(&self, component_id: &str) -> Option<Lifecycle> {
        self.instances
            .get(component_id)
            .map(|instance| instance.lock().lifecycle)
    }

    /// Connections subscribed to a component, sorted
    pub fn subscribers(&self, component_id: &str) -> Vec<String> {
        self.instances
            .get(component_id)
            .map(|instance| instance.lock().subscribers.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn identity(&self, component_id: &str) -> Option<ComponentIdentity> {
        lock(&self.identities).get(component_id).cloned()
    }

    /// Type name of a live component
    pub fn component_type_of(&self, component_id: &str) -> Option<String> {
        self.instances
            .get(component_id)
            .map(|instance| instance.component_type.name().to_string())
    }

    /// Order `ids` so parents come before their children
    pub fn initialization_order(&self, ids: &[String]) -> RlcResult<Vec<String>> {
        lock(&self.identities).initialization_order(ids)
    }

    /// Order `ids` so children come before their parents
    pub fn cleanup_order(&self, ids: &[String]) -> RlcResult<Vec<String>> {
        lock(&self.identities).cleanup_order(ids)
    }

    pub fn component_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.instances.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Forward connection lifecycle events to this runtime
    ///
    /// Closed connections suspend or destroy what they owned; components
    /// whose deltas were lost are resynced.
    pub fn start_lifecycle_forwarder(self: &Arc<Self>) {
        let runtime: Weak<Self> = Arc::downgrade(self);
        let mut events = self.connections.subscribe_events();

        lock(&self.tasks).spawn(async move {
            info!("Started connection lifecycle forwarder");

            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(runtime) = runtime.upgrade() else {
                            break;
                        };
                        runtime.handle_connection_event(event).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            "Lifecycle forwarder lagged behind, skipped {} event(s)",
                            skipped
                        );
                    }
                    Err(RecvError::Closed) => {
                        error!("Lifecycle forwarder channel closed");
                        break;
                    }
                }
            }

            warn!("Lifecycle forwarder ended");
        });
    }

    /// Periodically reclaim expired suspended instances
    pub fn start_maintenance(self: &Arc<Self>) {
        let runtime: Weak<Self> = Arc::downgrade(self);
        let period = self.config.heartbeat_interval();

        lock(&self.tasks).spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(runtime) = runtime.upgrade() else {
                    break;
                };
                runtime.sweep_suspended();
            }
        });
    }

    /// Start the lifecycle forwarder, the suspended-instance sweep and the
    /// connection health monitor
    pub fn start(self: &Arc<Self>) {
        self.start_lifecycle_forwarder();
        self.start_maintenance();
        self.connections.start_health_monitor();
    }

    /// Stop background tasks and close every connection
    pub fn shutdown(&self) {
        lock(&self.tasks).abort_all();
        self.connections.shutdown();
        info!(
            "Component runtime shut down with {} live instance(s)",
            self.instances.len()
        );
    }

    fn instance(&self, component_id: &str) -> RlcResult<Arc<Instance>> {
        self.instances
            .get(component_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RlcError::ComponentNotFound {
                id: component_id.to_string(),
            })
    }

    fn deliver(&self, connection_id: &str, message: ServerMessage) {
        let kind = message.kind();
        if !self.connections.send_message(
            message,
            SendTarget::Connection(connection_id.to_string()),
            Delivery::Queued,
        ) {
            debug!("Could not deliver {} to connection {}", kind, connection_id);
        }
    }

    fn secret(&self) -> Option<&str> {
        self.config.checksum_secret.as_deref()
    }
}

async fn run_handler(
    handler: MethodHandler,
    ctx: MethodContext,
) -> Result<(MethodContext, MethodResult), Box<dyn Any + Send>> {
    match handler {
        MethodHandler::Sync(handler) => {
            let mut ctx = ctx;
            let result = panic::catch_unwind(AssertUnwindSafe(|| handler(&mut ctx)));
            result.map(|result| (ctx, result))
        }
        MethodHandler::Async(handler) => AssertUnwindSafe(handler(ctx)).catch_unwind().await,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn ensure_alive(instance: &Instance, inner: &InstanceState) -> RlcResult<()> {
    if inner.lifecycle == Lifecycle::Destroyed {
        return Err(RlcError::ComponentNotFound {
            id: instance.component_id.clone(),
        });
    }
    Ok(())
}

fn resync_message(component_id: &str, inner: &InstanceState) -> ServerMessage {
    ServerMessage::Resync {
        component_id: component_id.to_string(),
        revision: inner.revision,
        payload: inner.state.clone(),
    }
}

fn respond(
    component_id: Option<String>,
    correlation_id: Option<String>,
    payload: serde_json::Result<JsonValue>,
) -> ServerMessage {
    match payload {
        Ok(payload) => ServerMessage::Response {
            component_id,
            correlation_id,
            payload,
        },
        Err(e) => ServerMessage::error(&RlcError::from(e), component_id, correlation_id),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::connection::testing::RecordingHandle;
    use crate::connection::CloseReason;
    use futures_util::future::join_all;
    use rstest::rstest;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio_test::assert_ok;

    const TTL_MS: i64 = 1_000;
    const MAX_AGE_MS: i64 = 10_000;

    struct Harness {
        runtime: Arc<ComponentRuntime>,
        connections: Arc<ConnectionManager>,
        clock: Arc<ManualClock>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(RlcConfig::default())
        }

        fn with_config(config: RlcConfig) -> Self {
            let config = config
                .with_suspended_ttl_ms(TTL_MS)
                .with_snapshot_max_age_ms(MAX_AGE_MS);
            let clock = Arc::new(ManualClock::new(1_000_000));
            let connections = Arc::new(ConnectionManager::new(config.clone(), clock.clone()).unwrap());
            let runtime = Arc::new(
                ComponentRuntime::new(config, clock.clone(), connections.clone()).unwrap(),
            );
            runtime.register_type(counter_type());

            Self {
                runtime,
                connections,
                clock,
            }
        }

        fn connect(&self, id: &str) -> Arc<RecordingHandle> {
            let handle = RecordingHandle::new();
            self.connections
                .register_connection(handle.clone(), id, None)
                .unwrap();
            handle
        }

        async fn counter_for(&self, connection_id: &str, key: &str) -> InstantiateOutcome {
            self.runtime
                .instantiate_for(Some(connection_id), "Counter", json!({}), Some(key), None, None)
                .await
                .unwrap()
        }

        fn count(&self, component_id: &str) -> JsonValue {
            self.runtime.state(component_id).unwrap()["count"].clone()
        }

        fn disconnect(&self, connection_id: &str) -> Vec<String> {
            self.connections.unregister_connection(connection_id).unwrap();
            self.runtime.handle_connection_closed(connection_id)
        }
    }

    fn counter_type() -> ComponentType {
        ComponentType::new("Counter", |props| {
            let mut state = StateMap::new();
            state.insert("count".into(), props.get("start").cloned().unwrap_or(json!(0)));
            state.insert("_renders".into(), json!(0));
            state
        })
        .method("increment", |ctx| {
            let count = ctx.get("count").and_then(JsonValue::as_i64).unwrap_or(0) + 1;
            ctx.set("count", json!(count));
            Ok(json!(count))
        })
        .method("add", |ctx| {
            let amount = ctx
                .arg(0)
                .and_then(JsonValue::as_i64)
                .ok_or_else(|| "expected a number".to_string())?;
            let count = ctx.get("count").and_then(JsonValue::as_i64).unwrap_or(0) + amount;
            ctx.set("count", json!(count));
            Ok(json!(count))
        })
        .method("announce", |ctx| {
            let count = ctx.get("count").cloned().unwrap_or(JsonValue::Null);
            ctx.emit("announced", json!({ "count": count }));
            Ok(JsonValue::Null)
        })
        .method("peek", |ctx| Ok(ctx.get("count").cloned().unwrap_or(JsonValue::Null)))
        .method("explode", |ctx| -> MethodResult {
            ctx.set("count", json!(-1));
            panic!("boom")
        })
        .async_method("slow_increment", |mut ctx| async move {
            tokio::time::sleep(Duration::from_millis(2)).await;
            let count = ctx.get("count").and_then(JsonValue::as_i64).unwrap_or(0) + 1;
            ctx.set("count", json!(count));
            (ctx, Ok(json!(count)))
        })
    }

    #[test]
    fn test_runtime_rejects_zero_heartbeat() {
        let clock = Arc::new(ManualClock::new(0));
        let connections = Arc::new(ConnectionManager::new(RlcConfig::default(), clock.clone()).unwrap());
        let result = ComponentRuntime::new(
            RlcConfig::default().with_heartbeat_interval_ms(0),
            clock,
            connections,
        );
        assert!(matches!(result, Err(RlcError::Config { .. })));
    }

    #[tokio::test]
    async fn test_counter_scenario() {
        let h = Harness::new();
        let handle = h.connect("c1");
        let id = h.counter_for("c1", "a").await.component_id;

        for _ in 0..3 {
            assert_ok!(h.runtime.call_from(Some("c1"), &id, "increment", vec![]).await);
        }

        assert_eq!(h.count(&id), json!(3));
        assert_eq!(h.runtime.revision(&id), Some(3));
        assert_eq!(handle.revisions(&id), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_two_connections_share_identity() {
        let h = Harness::new();
        h.connect("c1");
        let second = h.connect("c2");

        let first = h.counter_for("c1", "a").await;
        let again = h.counter_for("c2", "a").await;
        assert_eq!(first.component_id, again.component_id);
        assert!(first.created);
        assert!(!again.created);
        // Reattaching to an existing instance starts with a full resync
        assert_eq!(second.sent_of_kind("resync").len(), 1);

        let id = first.component_id;
        assert_ok!(h.runtime.call_from(Some("c1"), &id, "increment", vec![]).await);
        assert_eq!(second.revisions(&id), vec![1]);
        assert_eq!(h.runtime.subscribers(&id), vec!["c1", "c2"]);
    }

    #[tokio::test]
    async fn test_instances_are_isolated() {
        let h = Harness::new();
        let a = assert_ok!(h.runtime.instantiate("Counter", json!({}), Some("a"), None).await);
        let b = assert_ok!(h.runtime.instantiate("Counter", json!({}), Some("b"), None).await);
        assert_ne!(a, b);

        assert_ok!(h.runtime.call(&a, "add", vec![json!(5)]).await);
        assert_ok!(h.runtime.call(&a, "increment", vec![]).await);

        assert_eq!(h.count(&a), json!(6));
        assert_eq!(h.count(&b), json!(0));
        assert_eq!(h.runtime.revision(&b), Some(0));
    }

    #[tokio::test]
    async fn test_released_identity_produces_fresh_instance() {
        let h = Harness::new();
        let id = assert_ok!(h.runtime.instantiate("Counter", json!({}), Some("a"), None).await);
        assert_ok!(h.runtime.call(&id, "increment", vec![]).await);

        assert_eq!(assert_ok!(h.runtime.release(&id)), vec![id.clone()]);
        assert_eq!(h.runtime.instance_count(), 0);
        assert!(matches!(
            h.runtime.call(&id, "increment", vec![]).await,
            Err(RlcError::ComponentNotFound { .. })
        ));

        let again = assert_ok!(h.runtime.instantiate("Counter", json!({}), Some("a"), None).await);
        assert_eq!(again, id);
        assert_eq!(h.count(&id), json!(0));
        assert_eq!(h.runtime.revision(&id), Some(0));
    }

    #[tokio::test]
    async fn test_props_hash_addresses_unkeyed_instances() {
        let h = Harness::new();
        let a = assert_ok!(h.runtime.instantiate("Counter", json!({ "start": 4 }), None, None).await);
        let b = assert_ok!(h.runtime.instantiate("Counter", json!({ "start": 4 }), None, None).await);
        let c = assert_ok!(h.runtime.instantiate("Counter", json!({ "start": 5 }), None, None).await);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(h.count(&a), json!(4));
        assert_eq!(h.runtime.fingerprint(&a).unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_failing_methods_leave_instance_intact() {
        let h = Harness::new();
        let handle = h.connect("c1");
        let id = h.counter_for("c1", "a").await.component_id;

        let err = h.runtime.call(&id, "decrement", vec![]).await.unwrap_err();
        assert!(matches!(err, RlcError::MethodNotFound { .. }));

        let err = h.runtime.call(&id, "add", vec![json!("x")]).await.unwrap_err();
        assert!(matches!(err, RlcError::MethodFailed { ref message, .. } if message == "expected a number"));

        let err = h.runtime.call(&id, "explode", vec![]).await.unwrap_err();
        assert!(matches!(err, RlcError::MethodFailed { ref message, .. } if message.contains("boom")));

        assert_eq!(h.count(&id), json!(0));
        assert_eq!(h.runtime.revision(&id), Some(0));
        assert!(handle.sent_of_kind("delta").is_empty());

        assert_ok!(h.runtime.call(&id, "increment", vec![]).await);
        assert_eq!(h.runtime.revision(&id), Some(1));
        assert_eq!(h.runtime.lifecycle(&id), Some(Lifecycle::Active));
    }

    #[tokio::test]
    async fn test_unchanged_state_sends_no_delta() {
        let h = Harness::new();
        let handle = h.connect("c1");
        let id = h.counter_for("c1", "a").await.component_id;

        assert_eq!(assert_ok!(h.runtime.call(&id, "peek", vec![]).await), json!(0));
        assert_eq!(h.runtime.revision(&id), Some(0));
        assert!(handle.sent_of_kind("delta").is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_serialized() {
        let h = Harness::new();
        let handle = h.connect("c1");
        let id = h.counter_for("c1", "a").await.component_id;

        let calls = (0..10).map(|_| h.runtime.call(&id, "slow_increment", vec![]));
        let results = join_all(calls).await;
        assert!(results.iter().all(Result::is_ok));

        assert_eq!(h.count(&id), json!(10));
        assert_eq!(handle.revisions(&id), (1..=10).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_awaiting_call_does_not_block_other_instances() {
        let h = Harness::new();
        let release = Arc::new(Notify::new());
        let gate = release.clone();
        h.runtime.register_type(
            ComponentType::new("Waiter", |_| StateMap::new()).async_method("wait", move |ctx| {
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                    (ctx, Ok(json!("done")))
                }
            }),
        );

        let waiter = assert_ok!(h.runtime.instantiate("Waiter", json!({}), Some("w"), None).await);
        let counter = assert_ok!(h.runtime.instantiate("Counter", json!({}), Some("a"), None).await);

        let runtime = h.runtime.clone();
        let pending = tokio::spawn(async move { runtime.call(&waiter, "wait", vec![]).await });
        tokio::task::yield_now().await;

        assert_ok!(h.runtime.call(&counter, "increment", vec![]).await);
        assert_eq!(h.count(&counter), json!(1));
        assert!(!pending.is_finished());

        release.notify_one();
        assert_eq!(pending.await.unwrap().unwrap(), json!("done"));
    }

    #[tokio::test]
    async fn test_events_reach_connections_and_local_listeners() {
        let h = Harness::new();
        let handle = h.connect("c1");
        let id = h.counter_for("c1", "a").await.component_id;

        let deltas = Arc::new(Mutex::new(Vec::new()));
        let events = Arc::new(Mutex::new(Vec::new()));
        let subscription = {
            let deltas = deltas.clone();
            let events = events.clone();
            assert_ok!(h.runtime.subscribe(
                &id,
                move |revision, changes| deltas.lock().unwrap().push((revision, changes.len())),
                move |name, payload| events.lock().unwrap().push((name.to_string(), payload.clone())),
            ))
        };

        assert_ok!(h.runtime.call(&id, "increment", vec![]).await);
        assert_ok!(h.runtime.call(&id, "announce", vec![]).await);

        assert_eq!(*deltas.lock().unwrap(), vec![(1, 1)]);
        assert_eq!(
            *events.lock().unwrap(),
            vec![("announced".to_string(), json!({ "count": 1 }))]
        );
        assert_eq!(handle.sent_of_kind("event").len(), 1);

        assert!(subscription.is_active());
        subscription.unsubscribe();
        assert_ok!(h.runtime.call(&id, "increment", vec![]).await);
        assert_eq!(deltas.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_owner_loss_suspends_then_reattach_resumes() {
        let h = Harness::new();
        h.connect("c1");
        let watcher = h.connect("c2");
        let id = h.counter_for("c1", "a").await.component_id;
        assert_ok!(h.runtime.attach("c2", &id).await);
        assert_ok!(h.runtime.call_from(Some("c1"), &id, "increment", vec![]).await);

        assert!(h.disconnect("c1").is_empty());
        assert_eq!(h.runtime.lifecycle(&id), Some(Lifecycle::Suspended));
        assert_eq!(h.count(&id), json!(1));

        // The same logical owner comes back on a new connection
        let returning = h.connect("c3");
        let outcome = h.counter_for("c3", "a").await;
        assert!(outcome.resumed);
        assert_eq!(outcome.revision, 1);
        assert_eq!(h.runtime.lifecycle(&id), Some(Lifecycle::Active));
        assert!(matches!(
            returning.sent_of_kind("resync").as_slice(),
            [ServerMessage::Resync { revision: 1, .. }]
        ));

        assert_ok!(h.runtime.call_from(Some("c3"), &id, "increment", vec![]).await);
        assert_eq!(watcher.revisions(&id), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_owner_loss_without_subscribers_destroys_subtree() {
        let h = Harness::new();
        h.connect("c1");
        let parent = h.counter_for("c1", "root").await.component_id;
        let child = h
            .runtime
            .instantiate_for(Some("c1"), "Counter", json!({}), Some("leaf"), Some(&parent), None)
            .await
            .unwrap()
            .component_id;
        assert_eq!(h.runtime.identity(&child).unwrap().depth, 1);

        let destroyed = h.disconnect("c1");
        assert_eq!(destroyed, vec![child.clone(), parent.clone()]);
        assert_eq!(h.runtime.instance_count(), 0);
        assert!(h.runtime.identity(&parent).is_none());
    }

    #[tokio::test]
    async fn test_suspended_instances_expire_without_subscribers() {
        let h = Harness::new();
        h.connect("c1");
        h.connect("c2");
        let id = h.counter_for("c1", "a").await.component_id;
        assert_ok!(h.runtime.attach("c2", &id).await);

        h.disconnect("c1");
        h.clock.advance(TTL_MS * 5);
        // A subscriber is still watching
        assert!(h.runtime.sweep_suspended().is_empty());

        h.disconnect("c2");
        assert_eq!(h.runtime.lifecycle(&id), Some(Lifecycle::Suspended));
        h.clock.advance(TTL_MS - 1);
        assert!(h.runtime.sweep_suspended().is_empty());
        h.clock.advance(1);
        assert_eq!(h.runtime.sweep_suspended(), vec![id.clone()]);
        assert!(h.runtime.lifecycle(&id).is_none());
    }

    #[tokio::test]
    async fn test_local_listener_keeps_suspended_instance() {
        let h = Harness::new();
        h.connect("c1");
        let id = h.counter_for("c1", "a").await.component_id;
        let subscription = h.runtime.subscribe(&id, |_, _| {}, |_, _| {}).unwrap();

        h.disconnect("c1");
        assert_eq!(h.runtime.lifecycle(&id), Some(Lifecycle::Suspended));
        h.clock.advance(TTL_MS * 5);
        assert!(h.runtime.sweep_suspended().is_empty());

        // The orphan clock starts when the listener goes away
        drop(subscription);
        h.clock.advance(TTL_MS - 1);
        assert!(h.runtime.sweep_suspended().is_empty());
        h.clock.advance(1);
        assert_eq!(h.runtime.sweep_suspended(), vec![id]);
    }

    #[derive(Debug, Clone, Copy)]
    enum Offered {
        Valid,
        Expired,
        Tampered,
    }

    #[rstest]
    #[case(Offered::Valid, None)]
    #[case(Offered::Expired, Some("SNAPSHOT_EXPIRED"))]
    #[case(Offered::Tampered, Some("CHECKSUM_MISMATCH"))]
    #[tokio::test]
    async fn test_hydration_from_snapshot(#[case] offered: Offered, #[case] refused: Option<&str>) {
        let h = Harness::new();
        h.connect("c1");

        let mut saved = StateMap::new();
        saved.insert("count".into(), json!(41));
        let mut snapshot = integrity::create_snapshot(&saved, None, h.clock.now_ms());
        match offered {
            Offered::Valid => {}
            Offered::Expired => h.clock.advance(MAX_AGE_MS + 1),
            Offered::Tampered => {
                snapshot.data.insert("count".into(), json!(1_000));
            }
        }

        let outcome = h
            .runtime
            .instantiate_for(Some("c1"), "Counter", json!({}), Some("a"), None, Some(snapshot))
            .await
            .unwrap();

        assert_eq!(outcome.hydrated, refused.is_none());
        assert_eq!(outcome.hydration_error.as_deref(), refused);
        let expected = if refused.is_none() { json!(41) } else { json!(0) };
        assert_eq!(outcome.state["count"], expected);
        // Keys absent from the snapshot keep their initial values
        assert_eq!(outcome.state["_renders"], json!(0));
    }

    #[tokio::test]
    async fn test_hydration_ignores_transient_keys() {
        let h = Harness::with_config(RlcConfig::default().with_checksum_secret("server-only"));
        h.connect("c1");

        let mut saved = StateMap::new();
        saved.insert("count".into(), json!(7));
        let mut snapshot = integrity::create_snapshot(&saved, Some("server-only"), h.clock.now_ms());
        // Outside the checksum, so the snapshot still verifies
        snapshot.data.insert("_renders".into(), json!(99));
        snapshot.data.insert("_injected".into(), json!("x"));
        snapshot.data.insert("$admin".into(), json!(true));

        let outcome = h
            .runtime
            .instantiate_for(Some("c1"), "Counter", json!({}), Some("a"), None, Some(snapshot))
            .await
            .unwrap();

        assert!(outcome.hydrated);
        assert_eq!(outcome.state["count"], json!(7));
        assert_eq!(outcome.state["_renders"], json!(0));
        assert!(!outcome.state.contains_key("_injected"));
        assert!(!outcome.state.contains_key("$admin"));
    }

    #[tokio::test]
    async fn test_staged_snapshot_is_used_once() {
        let h = Harness::new();
        let id = crate::identity::component_id_for("Counter", IdentityKey::Supplied("a"), None);
        let mut saved = StateMap::new();
        saved.insert("count".into(), json!(9));
        h.runtime
            .stage_snapshot(id.clone(), integrity::create_snapshot(&saved, None, h.clock.now_ms()));

        assert_ok!(h.runtime.instantiate("Counter", json!({}), Some("a"), None).await);
        assert_eq!(h.count(&id), json!(9));

        assert_ok!(h.runtime.release(&id));
        assert_ok!(h.runtime.instantiate("Counter", json!({}), Some("a"), None).await);
        assert_eq!(h.count(&id), json!(0));
    }

    #[tokio::test]
    async fn test_snapshot_checksum_is_cached_until_change() {
        let h = Harness::new();
        let id = assert_ok!(h.runtime.instantiate("Counter", json!({}), Some("a"), None).await);

        let snapshot = assert_ok!(h.runtime.snapshot(&id));
        assert_ok!(integrity::verify_snapshot(&snapshot, MAX_AGE_MS, None, h.clock.now_ms()));
        assert_eq!(assert_ok!(h.runtime.checksum(&id)), snapshot.checksum);

        assert_ok!(h.runtime.call(&id, "increment", vec![]).await);
        assert_ne!(assert_ok!(h.runtime.checksum(&id)), snapshot.checksum);
    }

    #[tokio::test]
    async fn test_client_message_protocol() {
        let h = Harness::new();
        let handle = h.connect("c1");

        h.runtime
            .handle_client_message(
                "c1",
                ClientMessage::Instantiate {
                    correlation_id: Some("r1".into()),
                    component_type: "Counter".into(),
                    props: json!({}),
                    supplied_id: Some("a".into()),
                    parent_id: None,
                    snapshot: None,
                },
            )
            .await;
        let id = match handle.sent().last() {
            Some(ServerMessage::Response {
                correlation_id,
                payload,
                ..
            }) => {
                assert_eq!(correlation_id.as_deref(), Some("r1"));
                assert_eq!(payload["created"], json!(true));
                payload["componentId"].as_str().unwrap().to_string()
            }
            other => panic!("Expected a response, got: {:?}", other),
        };

        h.runtime
            .handle_client_message(
                "c1",
                ClientMessage::Call {
                    component_id: id.clone(),
                    correlation_id: "r2".into(),
                    method: "add".into(),
                    args: vec![json!(2)],
                },
            )
            .await;
        let kinds: Vec<&str> = handle.sent().iter().map(|m| m.kind()).collect();
        assert_eq!(kinds, vec!["response", "delta", "response"]);

        h.runtime
            .handle_client_message(
                "c1",
                ClientMessage::Call {
                    component_id: id.clone(),
                    correlation_id: "r3".into(),
                    method: "nope".into(),
                    args: vec![],
                },
            )
            .await;
        assert!(matches!(
            handle.sent().last(),
            Some(ServerMessage::Error { code, correlation_id: Some(c), .. })
                if code == "METHOD_NOT_FOUND" && c == "r3"
        ));

        h.runtime
            .handle_client_message(
                "c1",
                ClientMessage::Snapshot {
                    component_id: id.clone(),
                    correlation_id: Some("r4".into()),
                },
            )
            .await;
        let snapshot: StateSnapshot = match handle.sent().last() {
            Some(ServerMessage::Response { payload, .. }) => {
                serde_json::from_value(payload.clone()).unwrap()
            }
            other => panic!("Expected a snapshot response, got: {:?}", other),
        };
        assert_eq!(snapshot.data["count"], json!(2));

        h.runtime
            .handle_client_message("c1", ClientMessage::Unsubscribe { component_id: id.clone() })
            .await;
        assert!(h.runtime.subscribers(&id).is_empty());
        h.runtime
            .handle_client_message("c1", ClientMessage::Subscribe { component_id: id.clone() })
            .await;
        assert!(matches!(
            handle.sent().last(),
            Some(ServerMessage::Resync { revision: 1, .. })
        ));

        h.runtime
            .handle_client_message(
                "c1",
                ClientMessage::Release {
                    component_id: id.clone(),
                    correlation_id: Some("r5".into()),
                },
            )
            .await;
        assert!(matches!(
            handle.sent().last(),
            Some(ServerMessage::Response { payload, .. }) if payload["released"] == json!([id])
        ));

        handle.clear();
        h.runtime
            .handle_client_message("c1", ClientMessage::Pong { timestamp: Some(1) })
            .await;
        assert!(handle.sent().is_empty());
        assert_eq!(h.connections.connection_metrics("c1").unwrap().messages_received, 8);
    }

    #[tokio::test]
    async fn test_unknown_type_and_parent_are_rejected() {
        let h = Harness::new();
        assert!(matches!(
            h.runtime.instantiate("Missing", json!({}), None, None).await,
            Err(RlcError::ComponentTypeNotFound { .. })
        ));
        assert!(matches!(
            h.runtime.instantiate("Counter", json!({}), Some("a"), Some("ghost")).await,
            Err(RlcError::ParentNotFound { .. })
        ));
        assert_eq!(h.runtime.instance_count(), 0);
    }

    #[tokio::test]
    async fn test_forwarder_resyncs_after_overflow_and_cleans_up_closed() {
        let h = Harness::with_config(RlcConfig::default().with_message_queue_size(1));
        let handle = h.connect("c1");
        let id = h.counter_for("c1", "a").await.component_id;
        h.runtime.start_lifecycle_forwarder();

        handle.set_ready(false);
        for _ in 0..3 {
            assert_ok!(h.runtime.call(&id, "increment", vec![]).await);
        }
        handle.set_ready(true);
        assert_ok!(h.connections.mark_ready("c1"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(
            handle.sent().last(),
            Some(ServerMessage::Resync { revision: 3, .. })
        ));
        assert_ok!(h.runtime.call(&id, "increment", vec![]).await);
        assert_eq!(handle.revisions(&id), vec![4]);

        let mut events = h.connections.subscribe_events();
        assert_ok!(h.connections.unregister_connection("c1"));
        assert!(matches!(
            events.recv().await,
            Ok(ConnectionEvent::Closed { reason: CloseReason::Requested, .. })
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.runtime.instance_count(), 0);

        h.runtime.shutdown();
    }
}
