use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::debug;

use super::component::ComponentType;
use crate::clock::Clock;
use crate::protocol::{Change, StateMap};

/// Lifecycle of a component instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Uninitialized,
    Active,
    /// Its owning connections are gone but subscribers remain
    Suspended,
    /// Terminal
    Destroyed,
}

pub(crate) type DeltaListener = Arc<dyn Fn(u64, &[Change]) + Send + Sync>;
pub(crate) type EventListener = Arc<dyn Fn(&str, &JsonValue) + Send + Sync>;

pub(crate) struct Listener {
    pub(crate) on_delta: DeltaListener,
    pub(crate) on_event: EventListener,
}

/// Mutable part of an instance, guarded by a short-lived lock
pub(crate) struct InstanceState {
    pub(crate) state: StateMap,
    pub(crate) revision: u64,
    pub(crate) checksum: Option<String>,
    pub(crate) lifecycle: Lifecycle,
    /// Connections receiving deltas and events
    pub(crate) subscribers: BTreeSet<String>,
    /// Connections that instantiated or called the instance
    pub(crate) owners: BTreeSet<String>,
    pub(crate) suspended_since_ms: Option<i64>,
    pub(crate) listeners: BTreeMap<u64, Listener>,
}

/// A live component: state bound to an identity
pub(crate) struct Instance {
    pub(crate) component_id: String,
    pub(crate) component_type: Arc<ComponentType>,
    pub(crate) props: JsonValue,
    /// Serializes method calls in arrival order
    pub(crate) call_gate: tokio::sync::Mutex<()>,
    inner: Mutex<InstanceState>,
    next_listener_id: AtomicU64,
}

impl Instance {
    pub(crate) fn new(
        component_id: String,
        component_type: Arc<ComponentType>,
        props: JsonValue,
    ) -> Self {
        Self {
            component_id,
            component_type,
            props,
            call_gate: tokio::sync::Mutex::new(()),
            inner: Mutex::new(InstanceState {
                state: StateMap::new(),
                revision: 0,
                checksum: None,
                lifecycle: Lifecycle::Uninitialized,
                subscribers: BTreeSet::new(),
                owners: BTreeSet::new(),
                suspended_since_ms: None,
                listeners: BTreeMap::new(),
            }),
            next_listener_id: AtomicU64::new(0),
        }
    }

    /// Lock the mutable state; never held across an await or a send
    pub(crate) fn lock(&self) -> MutexGuard<'_, InstanceState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn activate(&self, state: StateMap) {
        let mut inner = self.lock();
        inner.state = state;
        inner.lifecycle = Lifecycle::Active;
    }

    /// Release the state and every subscriber
    pub(crate) fn destroy(&self) {
        let mut inner = self.lock();
        inner.lifecycle = Lifecycle::Destroyed;
        inner.state.clear();
        inner.checksum = None;
        inner.subscribers.clear();
        inner.owners.clear();
        inner.listeners.clear();
        inner.suspended_since_ms = None;
    }

    pub(crate) fn add_listener(&self, listener: Listener) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.lock().listeners.insert(id, listener);
        id
    }
}

impl InstanceState {
    pub(crate) fn resume(&mut self) {
        if self.lifecycle == Lifecycle::Suspended {
            self.lifecycle = Lifecycle::Active;
            self.suspended_since_ms = None;
        }
    }

    pub(crate) fn has_subscribers(&self) -> bool {
        !self.subscribers.is_empty() || !self.listeners.is_empty()
    }

    // The time-to-live of a suspended instance counts from its last subscriber leaving
    pub(crate) fn start_orphan_clock(&mut self, now_ms: i64) {
        if self.lifecycle == Lifecycle::Suspended && !self.has_subscribers() {
            self.suspended_since_ms = Some(now_ms);
        }
    }

    pub(crate) fn delta_listeners(&self) -> Vec<DeltaListener> {
        self.listeners
            .values()
            .map(|listener| listener.on_delta.clone())
            .collect()
    }

    pub(crate) fn event_listeners(&self) -> Vec<EventListener> {
        self.listeners
            .values()
            .map(|listener| listener.on_event.clone())
            .collect()
    }
}

/// A local subscription to a component's deltas and events
///
/// The listeners are removed when the subscription is dropped, or
/// explicitly with [`unsubscribe`](Self::unsubscribe).
pub struct Subscription {
    component_id: String,
    listener_id: u64,
    instance: Weak<Instance>,
    clock: Arc<dyn Clock>,
    active: AtomicBool,
}

impl Subscription {
    pub(crate) fn new(instance: &Arc<Instance>, listener_id: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            component_id: instance.component_id.clone(),
            listener_id,
            instance: Arc::downgrade(instance),
            clock,
            active: AtomicBool::new(true),
        }
    }

    pub fn component_id(&self) -> &str {
        &self.component_id
    }

    /// Whether the listeners are still registered
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && self.instance.strong_count() > 0
    }

    pub fn unsubscribe(self) {
        self.detach();
    }

    fn detach(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            if let Some(instance) = self.instance.upgrade() {
                let mut inner = instance.lock();
                inner.listeners.remove(&self.listener_id);
                inner.start_orphan_clock(self.clock.now_ms());
                debug!("Removed local subscription on '{}'", self.component_id);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}
