use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::integrity::StateSnapshot;
use crate::RlcError;

/// The state of a single component instance
pub type StateMap = serde_json::Map<String, JsonValue>;

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Create a component instance, or reattach to the one its identity resolves to
    Instantiate {
        correlation_id: Option<String>,
        component_type: String,
        #[serde(default)]
        props: JsonValue,
        supplied_id: Option<String>,
        parent_id: Option<String>,
        /// Snapshot previously handed out by the server, used for hydration
        snapshot: Option<StateSnapshot>,
    },
    /// Invoke a remote method on a component
    Call {
        component_id: String,
        correlation_id: String,
        method: String,
        #[serde(default)]
        args: Vec<JsonValue>,
    },
    /// Receive deltas and events for a component
    Subscribe { component_id: String },
    /// Stop receiving deltas and events for a component
    Unsubscribe { component_id: String },
    /// Destroy a component and all of its children
    Release {
        component_id: String,
        correlation_id: Option<String>,
    },
    /// Request a checksummed snapshot of a component's state
    Snapshot {
        component_id: String,
        correlation_id: Option<String>,
    },
    /// Heartbeat reply
    Pong { timestamp: Option<i64> },
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Result of a request, paired by correlation id
    Response {
        #[serde(skip_serializing_if = "Option::is_none")]
        component_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
        payload: JsonValue,
    },
    /// Incremental state update tied to a revision
    Delta {
        component_id: String,
        revision: u64,
        payload: DeltaPayload,
    },
    /// Named application event emitted by a component method
    Event {
        component_id: String,
        name: String,
        payload: JsonValue,
    },
    /// Full-state replacement after a queue overflow or reattachment
    Resync {
        component_id: String,
        revision: u64,
        payload: StateMap,
    },
    /// Non-fatal per-call or per-connection error report
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        component_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
        code: String,
        message: String,
    },
    /// Heartbeat probe
    Ping { timestamp: i64 },
}

impl ServerMessage {
    /// Build an `error` message from an engine error
    pub fn error(
        err: &RlcError,
        component_id: Option<String>,
        correlation_id: Option<String>,
    ) -> Self {
        ServerMessage::Error {
            component_id,
            correlation_id,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    /// Wire name of the message type
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Response { .. } => "response",
            ServerMessage::Delta { .. } => "delta",
            ServerMessage::Event { .. } => "event",
            ServerMessage::Resync { .. } => "resync",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Ping { .. } => "ping",
        }
    }

    pub fn component_id(&self) -> Option<&str> {
        match self {
            ServerMessage::Response { component_id, .. }
            | ServerMessage::Error { component_id, .. } => component_id.as_deref(),
            ServerMessage::Delta { component_id, .. }
            | ServerMessage::Event { component_id, .. }
            | ServerMessage::Resync { component_id, .. } => Some(component_id),
            ServerMessage::Ping { .. } => None,
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            ServerMessage::Response { correlation_id, .. }
            | ServerMessage::Error { correlation_id, .. } => correlation_id.as_deref(),
            _ => None,
        }
    }
}

/// Body of a `delta` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaPayload {
    pub changes: Vec<Change>,
}

/// Represents a change operation on a component's state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Change {
    /// Insert a new key-value pair
    Insert { key: String, value: JsonValue },
    /// Update an existing key with a new value
    Update {
        key: String,
        old_value: JsonValue,
        new_value: JsonValue,
    },
    /// Remove a key-value pair
    Remove { key: String, old_value: JsonValue },
}

/// Compute the changes that turn `before` into `after`
///
/// Changes are ordered by key.
pub fn diff_states(before: &StateMap, after: &StateMap) -> Vec<Change> {
    let mut keys: Vec<&String> = before.keys().chain(after.keys()).collect();
    keys.sort();
    keys.dedup();

    keys.into_iter()
        .filter_map(|key| match (before.get(key), after.get(key)) {
            (None, Some(value)) => Some(Change::Insert {
                key: key.clone(),
                value: value.clone(),
            }),
            (Some(old_value), Some(new_value)) if old_value != new_value => Some(Change::Update {
                key: key.clone(),
                old_value: old_value.clone(),
                new_value: new_value.clone(),
            }),
            (Some(old_value), None) => Some(Change::Remove {
                key: key.clone(),
                old_value: old_value.clone(),
            }),
            _ => None,
        })
        .collect()
}

/// Encode a message using lib0 format
pub fn encode_message<T: Serialize>(message: &T) -> crate::RlcResult<Vec<u8>> {
    let json = serde_json::to_string(message)?;
    let mut encoder = Vec::new();
    lib0::encoding::Write::write_string(&mut encoder, &json);
    Ok(encoder)
}

/// Decode a message from lib0 format
pub fn decode_message<T: for<'de> Deserialize<'de>>(data: &[u8]) -> crate::RlcResult<T> {
    let mut decoder = lib0::decoding::Cursor::new(data);
    let json =
        lib0::decoding::Read::read_string(&mut decoder).map_err(|e| crate::RlcError::Protocol {
            message: format!("Failed to decode lib0 string: {}", e),
        })?;

    let message = serde_json::from_str(json)?;
    Ok(message)
}
