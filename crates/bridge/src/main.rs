mod mqtt;
mod state;
mod web;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mqtt::{extract_device_id, parse_telemetry, EVENTS_FILTER};
use state::{SharedState, SystemState};
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("greenhouse_bridge=info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);

    // ── Shared state (ephemeral, for the HTTP API) ──────────────────
    let shared: SharedState = Arc::new(RwLock::new(SystemState::new()));
    shared.write().await.record_system("bridge started".to_string());

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("greenhouse-bridge", broker.as_str(), port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    // ── Web server ──────────────────────────────────────────────────
    let app = AppState {
        shared: Arc::clone(&shared),
        mqtt: client.clone(),
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(app).await {
            error!("{e:#}");
        }
    });

    info!(%broker, port, "bridge connecting");

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let mut st = shared.write().await;
                handle_publish(&mut st, &p.topic, &p.payload);
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                // Clean sessions drop subscriptions, so renew on every connect.
                if let Err(e) = client.try_subscribe(EVENTS_FILTER, QoS::AtLeastOnce) {
                    warn!("subscribe failed: {e}");
                }
                info!("mqtt connected, subscribed to {EVENTS_FILTER}");
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                {
                    let mut st = shared.write().await;
                    if st.mqtt_connected {
                        st.record_error(format!("mqtt error: {e}"));
                    }
                    st.mqtt_connected = false;
                }
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

/// Route one incoming publish into the shared state.
fn handle_publish(st: &mut SystemState, topic: &str, payload: &[u8]) {
    let Some(device_id) = extract_device_id(topic) else {
        warn!(%topic, "unhandled topic");
        return;
    };

    match parse_telemetry(payload) {
        Ok(msg) => {
            info!(
                device = device_id,
                humidity = msg.humidity,
                pump = msg.pump_active,
                light = msg.light_active,
                "telemetry"
            );
            st.record_telemetry(device_id, msg);
        }
        Err(e) => {
            warn!(device = device_id, "{e}");
            st.record_error(format!("{device_id}: {e}"));
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
