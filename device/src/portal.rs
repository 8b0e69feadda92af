use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use pillbox_common::{ConfigError, NetworkConfig, TelemetrySnapshot};

use crate::{
    host::AppStore,
    provisioning::{
        apply_network_update, broker_restart_required, build_network_config_view,
        NetworkConfigUpdate, NetworkUpdateResponse,
    },
};

/// Requests the portal hands to the control loop.
#[derive(Debug)]
pub enum PortalRequest {
    Reconfigure(NetworkConfig),
    Restart,
}

#[derive(Clone)]
pub struct PortalState {
    pub store: AppStore,
    pub snapshots: watch::Receiver<Option<TelemetrySnapshot>>,
    pub requests: mpsc::Sender<PortalRequest>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct RestartResponse {
    restarting: bool,
}

pub fn router(state: PortalState) -> Router {
    Router::new()
        .route("/api/status", get(handle_get_status))
        .route(
            "/api/network",
            get(handle_get_network).put(handle_put_network),
        )
        .route("/api/restart", post(handle_post_restart))
        .with_state(state)
}

async fn handle_get_status(State(state): State<PortalState>) -> impl IntoResponse {
    let snapshot = state.snapshots.borrow().clone();
    match snapshot {
        Some(snapshot) => Json(snapshot).into_response(),
        None => error_response(StatusCode::SERVICE_UNAVAILABLE, "device is starting"),
    }
}

async fn handle_get_network(State(state): State<PortalState>) -> impl IntoResponse {
    let network = match state.store.load_config().await {
        Ok(loaded) => loaded.config.network,
        Err(err) => {
            warn!("failed to load network config from store: {err:#}");
            NetworkConfig::default()
        }
    };
    Json(build_network_config_view(&network))
}

async fn handle_put_network(
    State(state): State<PortalState>,
    Json(update): Json<NetworkConfigUpdate>,
) -> impl IntoResponse {
    let previous = match state.store.load_config().await {
        Ok(loaded) => loaded.config.network,
        Err(err) => {
            warn!("failed to load existing config for update: {err:#}");
            NetworkConfig::default()
        }
    };
    let network = apply_network_update(&previous, update);
    if let Err(err) = network.validate() {
        return error_response(StatusCode::BAD_REQUEST, &err.to_string());
    }

    if let Err(err) = state.store.save_network(&network).await {
        warn!("failed to persist network config update: {err:#}");
        if matches!(err.downcast_ref::<ConfigError>(), Some(ConfigError::Unreadable(_))) {
            return error_response(StatusCode::CONFLICT, &format!("{err:#}"));
        }
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist network settings",
        );
    }

    if let Err(err) = state
        .requests
        .send(PortalRequest::Reconfigure(network.clone()))
        .await
    {
        warn!("control loop is gone; network update saved only: {err}");
    }

    let payload = NetworkUpdateResponse {
        restart_required: broker_restart_required(&previous, &network),
        network: build_network_config_view(&network),
    };
    Json(payload).into_response()
}

async fn handle_post_restart(State(state): State<PortalState>) -> impl IntoResponse {
    info!("restart requested from local portal");
    if state.requests.send(PortalRequest::Restart).await.is_err() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "control loop is not running");
    }
    (StatusCode::ACCEPTED, Json(RestartResponse { restarting: true })).into_response()
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
