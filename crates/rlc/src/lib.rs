//! # RLC - Remote Live Components
//!
//! A server-authoritative component state synchronization engine.
//!
//! Clients instantiate components by deterministic identity, call their
//! methods remotely and receive revisioned state deltas and named events
//! over persistent connections. Snapshots are checksummed so a reconnecting
//! client can rehydrate a component the server no longer holds.

pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod identity;
pub mod integrity;
pub mod protocol;
pub mod runtime;

#[cfg(feature = "persistence")]
pub mod persistence;

#[cfg(feature = "axum")]
pub mod axum;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RlcConfig;
pub use connection::{
    ConnectionEvent, ConnectionHandle, ConnectionManager, ConnectionStatus, Delivery,
    LoadBalancePolicy, SendTarget,
};
pub use error::{RlcError, RlcResult};
pub use identity::{ComponentIdentity, IdentityKey, IdentityManager};
pub use integrity::{compute_checksum, create_snapshot, fingerprint, verify_snapshot, StateSnapshot};
pub use protocol::{Change, ClientMessage, ServerMessage, StateMap};
pub use runtime::{ComponentRuntime, ComponentType, Lifecycle, MethodContext, Subscription};

#[cfg(feature = "axum")]
pub use axum::{router_with_rlc, router_with_rlc_state, RlcState, WebSocketHandler};

#[cfg(feature = "persistence")]
pub use persistence::SnapshotStore;
