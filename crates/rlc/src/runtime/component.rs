use futures_util::future::BoxFuture;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::protocol::StateMap;

type Initializer = Arc<dyn Fn(&JsonValue) -> StateMap + Send + Sync>;

/// Result of a method handler; the error string is reported to the caller
pub type MethodResult = Result<JsonValue, String>;

pub(crate) type SyncHandler = Arc<dyn Fn(&mut MethodContext) -> MethodResult + Send + Sync>;
pub(crate) type AsyncHandler =
    Arc<dyn Fn(MethodContext) -> BoxFuture<'static, (MethodContext, MethodResult)> + Send + Sync>;

#[derive(Clone)]
pub(crate) enum MethodHandler {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

/// Behavior shared by every instance of one component type
///
/// Methods are registered once, up front; calling a name that was never
/// registered fails with `MethodNotFound`.
///
/// ```
/// use rlc::ComponentType;
/// use serde_json::json;
///
/// let counter = ComponentType::new("Counter", |_props| {
///     let mut state = serde_json::Map::new();
///     state.insert("count".to_string(), json!(0));
///     state
/// })
/// .method("increment", |ctx| {
///     let count = ctx.get("count").and_then(|v| v.as_i64()).unwrap_or(0) + 1;
///     ctx.set("count", json!(count));
///     Ok(json!(count))
/// });
///
/// assert!(counter.has_method("increment"));
/// ```
pub struct ComponentType {
    name: String,
    initializer: Initializer,
    methods: HashMap<String, MethodHandler>,
}

impl ComponentType {
    /// Create a component type whose initial state is built from the props
    pub fn new<F>(name: impl Into<String>, initializer: F) -> Self
    where
        F: Fn(&JsonValue) -> StateMap + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            initializer: Arc::new(initializer),
            methods: HashMap::new(),
        }
    }

    /// Register a synchronous method
    pub fn method<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut MethodContext) -> MethodResult + Send + Sync + 'static,
    {
        self.methods
            .insert(name.into(), MethodHandler::Sync(Arc::new(handler)));
        self
    }

    /// Register a method that awaits downstream work
    ///
    /// The handler owns the context while it runs and hands it back with
    /// its result. Other instances keep making progress meanwhile; calls on
    /// this instance wait their turn.
    pub fn async_method<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(MethodContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = (MethodContext, MethodResult)> + Send + 'static,
    {
        let handler: AsyncHandler = Arc::new(move |ctx| Box::pin(handler(ctx)));
        self.methods.insert(name.into(), MethodHandler::Async(handler));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Registered method names, sorted
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub(crate) fn initial_state(&self, props: &JsonValue) -> StateMap {
        (self.initializer)(props)
    }

    pub(crate) fn handler(&self, name: &str) -> Option<MethodHandler> {
        self.methods.get(name).cloned()
    }
}

impl fmt::Debug for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentType")
            .field("name", &self.name)
            .field("methods", &self.method_names())
            .finish()
    }
}

/// What a method handler sees: a working copy of the state, the call
/// arguments, and an outbox for named events
///
/// Changes to the working copy are committed only if the handler returns
/// `Ok`.
#[derive(Debug, Clone)]
pub struct MethodContext {
    component_id: String,
    state: StateMap,
    args: Vec<JsonValue>,
    events: Vec<(String, JsonValue)>,
}

impl MethodContext {
    pub(crate) fn new(component_id: String, state: StateMap, args: Vec<JsonValue>) -> Self {
        Self {
            component_id,
            state,
            args,
            events: Vec::new(),
        }
    }

    pub fn component_id(&self) -> &str {
        &self.component_id
    }

    pub fn state(&self) -> &StateMap {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut StateMap {
        &mut self.state
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.state.get(key)
    }

    /// Set a state value, returning the previous one
    pub fn set(&mut self, key: impl Into<String>, value: JsonValue) -> Option<JsonValue> {
        self.state.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<JsonValue> {
        self.state.remove(key)
    }

    pub fn args(&self) -> &[JsonValue] {
        &self.args
    }

    pub fn arg(&self, index: usize) -> Option<&JsonValue> {
        self.args.get(index)
    }

    /// Queue a named event for subscribers
    pub fn emit(&mut self, name: impl Into<String>, payload: JsonValue) {
        self.events.push((name.into(), payload));
    }

    pub(crate) fn into_parts(self) -> (StateMap, Vec<(String, JsonValue)>) {
        (self.state, self.events)
    }
}
