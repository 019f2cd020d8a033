use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use rlc::{
    ComponentRuntime, ComponentType, ConnectionManager, RlcConfig, RlcError, RlcState,
    SnapshotStore, StateMap, SystemClock,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, Level};

#[derive(Debug, Deserialize)]
pub struct CallRequest {
    #[serde(default)]
    pub args: Vec<JsonValue>,
}

fn counter_type() -> ComponentType {
    ComponentType::new("Counter", |props| {
        let mut state = StateMap::new();
        state.insert(
            "count".to_string(),
            props.get("start").cloned().unwrap_or(json!(0)),
        );
        state.insert(
            "step".to_string(),
            props.get("step").cloned().unwrap_or(json!(1)),
        );
        state
    })
    .method("increment", |ctx| {
        let step = ctx.get("step").and_then(JsonValue::as_i64).unwrap_or(1);
        let count = ctx.get("count").and_then(JsonValue::as_i64).unwrap_or(0) + step;
        ctx.set("count", json!(count));
        if count % 10 == 0 {
            ctx.emit("milestone", json!({ "count": count }));
        }
        Ok(json!(count))
    })
    .method("reset", |ctx| {
        ctx.set("count", json!(0));
        Ok(JsonValue::Null)
    })
}

fn status_for(err: &RlcError) -> StatusCode {
    match err {
        RlcError::ComponentNotFound { .. } | RlcError::MethodNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        RlcError::MethodFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// REST API handlers
async fn list_components(State(rlc_state): State<RlcState>) -> Json<JsonValue> {
    let runtime = rlc_state.runtime();
    let components: Vec<JsonValue> = runtime
        .component_ids()
        .into_iter()
        .map(|id| {
            json!({
                "componentId": id,
                "revision": runtime.revision(&id),
                "lifecycle": runtime.lifecycle(&id),
                "subscribers": runtime.subscribers(&id),
            })
        })
        .collect();

    Json(json!(components))
}

async fn get_component(
    State(rlc_state): State<RlcState>,
    Path(id): Path<String>,
) -> Result<Json<JsonValue>, StatusCode> {
    let snapshot = rlc_state
        .runtime()
        .snapshot(&id)
        .map_err(|e| status_for(&e))?;

    Ok(Json(json!(snapshot)))
}

async fn call_component(
    State(rlc_state): State<RlcState>,
    Path((id, method)): Path<(String, String)>,
    Json(request): Json<CallRequest>,
) -> Result<Json<JsonValue>, StatusCode> {
    let result = rlc_state
        .runtime()
        .call(&id, &method, request.args)
        .await
        .map_err(|e| status_for(&e))?;

    info!("Called '{}' on '{}' over REST", method, id);
    Ok(Json(result))
}

async fn get_metrics(State(rlc_state): State<RlcState>) -> Json<JsonValue> {
    let metrics = rlc_state.connections().system_metrics();
    Json(json!({
        "connections": metrics,
        "components": rlc_state.runtime().instance_count(),
    }))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting Counter Server with RLC...");

    let config = match std::env::var("RLC_CONFIG") {
        Ok(path) => RlcConfig::from_json_str(&tokio::fs::read_to_string(path).await?)?,
        Err(_) => RlcConfig::default(),
    };

    let clock = Arc::new(SystemClock);
    let connections = Arc::new(ConnectionManager::new(config.clone(), clock.clone())?);
    let runtime = Arc::new(ComponentRuntime::new(config, clock, connections)?);
    runtime.register_type(counter_type());

    // Restore snapshots written by a previous run
    let mut snapshots = SnapshotStore::new(runtime.clone(), "./data/snapshots");
    snapshots.start().await?;
    let staged = snapshots.load_all().await?;
    info!("Restored {} component snapshot(s)", staged);

    let rlc_state = RlcState::new(runtime.clone());

    let app: Router = rlc::router_with_rlc_state(rlc_state.clone())
        .route("/components", get(list_components))
        .route("/components/{id}", get(get_component))
        .route("/components/{id}/call/{method}", post(call_component))
        .route("/metrics", get(get_metrics))
        .with_state(rlc_state);

    // Start server
    let listener = TcpListener::bind("127.0.0.1:3001").await?;
    info!("Server running on http://127.0.0.1:3001");
    info!("WebSocket endpoint available at ws://127.0.0.1:3001/rlc (optional ?pool=<name>)");
    info!("API endpoints:");
    info!("  GET    /components                     - List live components");
    info!("  GET    /components/:id                 - Snapshot of a component");
    info!("  POST   /components/:id/call/:method    - Call a component method");
    info!("  GET    /metrics                        - Connection metrics");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    snapshots.stop().await;
    runtime.shutdown();

    Ok(())
}
