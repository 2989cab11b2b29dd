use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, put};
use axum::Router;
use rumqttc::{AsyncClient, QoS};
use serde_json::Value;
use std::env;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::mqtt::{check_config_body, config_topic, valid_device_id};
use crate::state::SharedState;

/// Handler state: the status snapshot plus a client for config pushes.
#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub mqtt: AsyncClient,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(app: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/devices/{id}/config", put(put_config))
        .with_state(app)
}

async fn api_status(State(app): State<AppState>) -> impl IntoResponse {
    let st = app.shared.read().await;
    Json(st.to_status())
}

/// Publish a parameter update, retained so a controller that connects later
/// still receives it.
async fn put_config(
    State(app): State<AppState>,
    Path(device_id): Path<String>,
    Json(body): Json<Value>,
) -> Result<StatusCode, (StatusCode, String)> {
    if !valid_device_id(&device_id) {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("invalid device id '{device_id}'"),
        ));
    }
    check_config_body(&body).map_err(|e| (StatusCode::BAD_REQUEST, e))?;

    let keys = body.as_object().map_or(0, |m| m.len());
    let payload = body.to_string();
    let topic = config_topic(&device_id);

    if let Err(e) = app
        .mqtt
        .publish(&topic, QoS::AtLeastOnce, true, payload)
        .await
    {
        warn!(%topic, "config publish failed: {e}");
        app.shared
            .write()
            .await
            .record_error(format!("{device_id}: config publish failed: {e}"));
        return Err((StatusCode::SERVICE_UNAVAILABLE, "broker unavailable".into()));
    }

    info!(device = %device_id, keys, "config pushed");
    app.shared.write().await.record_config_push(&device_id, keys);
    Ok(StatusCode::ACCEPTED)
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(app: AppState) -> Result<()> {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("http api listening on http://{addr}");

    axum::serve(listener, router(app))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
