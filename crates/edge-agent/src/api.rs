use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use application::metrics::MetricsCollector;
use application::provisioning::{DeviceManager, ProvisionSettings};
use application::reconciler::StateReconciler;
use domain::DomainError;
use domain::runtime::ContainerRuntime;
use domain::state::{ConfigPatch, TargetSource};
use domain::store::{DeviceStore, meta_keys};

use crate::sync::SyncManager;

/// Shared state behind the local-only control API.
pub struct ApiState {
    pub device: Arc<DeviceManager>,
    pub reconciler: Arc<StateReconciler>,
    pub sync: Option<Arc<SyncManager>>,
    pub collector: Arc<MetricsCollector>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub store: Arc<dyn DeviceStore>,
    pub provision_settings: ProvisionSettings,
    pub memory_threshold_mb: u64,
    /// Cancelling this token initiates a scheduled restart (exit code 0).
    pub restart: CancellationToken,
}

pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/v1/device", get(get_device))
        .route("/v1/provision", post(provision))
        .route("/v1/provision/status", get(provision_status))
        .route("/v1/deprovision", post(deprovision))
        .route("/v1/factory-reset", post(factory_reset))
        .route("/v1/config", get(get_config).post(set_config))
        .route("/v1/apps/{app_id}/start", post(start_app))
        .route("/v1/apps/{app_id}/stop", post(stop_app))
        .route("/v1/apps/{app_id}/restart", post(restart_app))
        .route("/v1/apps/{app_id}/purge", post(purge_app))
        .route("/v1/apps/{app_id}/info", get(app_info))
        .route("/v1/restart", post(restart_agent))
        .route("/v1/healthy", get(healthy))
        .route("/v2/connection/health", get(connection_health))
        .with_state(state)
}

fn error_response(e: DomainError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &e {
        DomainError::BadRequest(_) | DomainError::InvalidTargetState(_) => StatusCode::BAD_REQUEST,
        DomainError::NotInitialized | DomainError::NotProvisioned => StatusCode::CONFLICT,
        DomainError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
        DomainError::DeviceUnknown(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": e.to_string() })))
}

async fn get_device(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match state.device.identity().await {
        Ok(identity) => {
            // Credentials never leave the process, even on loopback.
            let mut value = serde_json::to_value(&identity).unwrap_or_default();
            if let Some(obj) = value.as_object_mut() {
                obj.remove("device_key");
                obj.remove("provisioning_key");

                let mut counters = serde_json::Map::new();
                for key in [meta_keys::POLL_COUNT, meta_keys::REPORT_COUNT] {
                    if let Ok(Some(count)) = state.store.get_meta(key).await {
                        counters.insert(key.to_string(), json!(count));
                    }
                }
                obj.insert("counters".to_string(), counters.into());
            }
            Json(value).into_response()
        }
        Err(e) => error_response(e).into_response(),
    }
}

async fn provision(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match state.device.provision(&state.provision_settings).await {
        Ok(identity) => Json(json!({
            "provisioned": true,
            "uuid": identity.uuid,
            "deviceId": identity.device_id,
        }))
        .into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn provision_status(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match state.device.identity().await {
        Ok(identity) => Json(json!({
            "provisioned": identity.provisioned,
            "localMode": identity.local_mode,
            "uuid": identity.uuid,
        }))
        .into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn deprovision(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match state.device.reset().await {
        Ok(_) => Json(json!({ "status": "reset" })).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn factory_reset(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match state.device.factory_reset().await {
        Ok(()) => {
            info!("factory reset requested via local API, restarting");
            state.restart.cancel();
            Json(json!({ "status": "factory-reset" })).into_response()
        }
        Err(e) => error_response(e).into_response(),
    }
}

async fn get_config(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let target = state.reconciler.target_state().await;
    Json(json!({
        "config": target.config,
        "version": target.version,
    }))
}

/// Subset-merge a config patch into the target (local source).
async fn set_config(
    State(state): State<Arc<ApiState>>,
    Json(patch): Json<ConfigPatch>,
) -> impl IntoResponse {
    let mut target = state.reconciler.target_state().await;
    target.config.merge_from(patch);
    match state
        .reconciler
        .set_target(target, TargetSource::Local)
        .await
    {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn start_app(
    Path(app_id): Path<String>,
    State(state): State<Arc<ApiState>>,
) -> impl IntoResponse {
    match state.reconciler.start_app(&app_id).await {
        Ok(()) => Json(json!({ "status": "started" })).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn stop_app(
    Path(app_id): Path<String>,
    State(state): State<Arc<ApiState>>,
) -> impl IntoResponse {
    match state.reconciler.stop_app(&app_id).await {
        Ok(()) => Json(json!({ "status": "stopped" })).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn restart_app(
    Path(app_id): Path<String>,
    State(state): State<Arc<ApiState>>,
) -> impl IntoResponse {
    match state.reconciler.restart_app(&app_id).await {
        Ok(()) => Json(json!({ "status": "restarted" })).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn purge_app(
    Path(app_id): Path<String>,
    State(state): State<Arc<ApiState>>,
) -> impl IntoResponse {
    match state.reconciler.purge_app(&app_id).await {
        Ok(()) => Json(json!({ "status": "purged" })).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn app_info(
    Path(app_id): Path<String>,
    State(state): State<Arc<ApiState>>,
) -> impl IntoResponse {
    let target = state.reconciler.target_state().await;
    let current = state.reconciler.current_state().await.unwrap_or_default();
    let logs = state
        .reconciler
        .app_logs(&app_id, 50)
        .await
        .unwrap_or_default();

    Json(json!({
        "appId": app_id,
        "target": target.apps.get(&app_id),
        "current": current.apps.get(&app_id),
        "logs": logs.into_iter().collect::<std::collections::BTreeMap<_, _>>(),
    }))
}

async fn restart_agent(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    info!("restart requested via local API");
    state.restart.cancel();
    Json(json!({ "status": "restarting" }))
}

/// Composite healthcheck: runtime reachable AND process memory growth
/// within bounds.
async fn healthy(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let runtime_ok = state.runtime.ping().await.is_ok();
    let memory_ok = state.collector.memory_healthy(state.memory_threshold_mb);

    if runtime_ok && memory_ok {
        (StatusCode::OK, Json(json!({ "healthy": true })))
    } else {
        warn!(runtime_ok, memory_ok, "healthcheck failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "healthy": false,
                "runtime": runtime_ok,
                "memory": memory_ok,
            })),
        )
    }
}

async fn connection_health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match &state.sync {
        Some(sync) => Json(serde_json::to_value(sync.connection_health()).unwrap_or_default()),
        None => Json(json!({ "status": "offline", "localMode": true })),
    }
}
