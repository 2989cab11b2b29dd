mod actuator;
mod adc;
mod backoff;
mod board;
mod clock;
mod cloud;
mod control;
mod credential;
mod device;
mod params;
mod settings;
#[cfg(not(feature = "gpio"))]
mod sim;
mod telemetry;

use anyhow::{Context, Result};
use std::{env, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use clock::LocalClock;
use cloud::CloudChannel;
use control::ActuationController;
use params::{ConfigStore, JsonFile};
use telemetry::TelemetryAggregator;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("greenhouse_controller=info")),
        )
        .init();

    // ── Settings ────────────────────────────────────────────────────
    let settings_path =
        env::var("CONTROLLER_CONFIG").unwrap_or_else(|_| "controller.toml".to_string());
    let settings = settings::load(&settings_path)?;

    // ── Runtime parameters ──────────────────────────────────────────
    let store = Arc::new(
        ConfigStore::load(JsonFile::new(&settings.device.params_path)).with_context(|| {
            format!(
                "failed to load parameters from {}",
                settings.device.params_path.display()
            )
        })?,
    );

    info!(
        scheme = %store.get(params::WATERING_SCHEME)?,
        poll_interval = %store.get(params::DEVICE_POLL_INTERVAL)?,
        send_interval = %store.get(params::SEND_INTERVAL)?,
        "parameters in effect"
    );

    let telemetry = Arc::new(TelemetryAggregator::new());
    let cancel = CancellationToken::new();
    tokio::spawn(watch_signals(cancel.clone()));

    // ── Board (fail-safe OFF on open) ───────────────────────────────
    let board = board::open(&settings.gpio, settings.device.sensor_channel)?;
    let mut clock = LocalClock::system();
    let controller = ActuationController::new(
        board.pump,
        board.light,
        Arc::clone(&telemetry),
        clock.now(),
    )?;

    info!(
        device = %settings.device.id,
        offset = %clock.offset(),
        params = %settings.device.params_path.display(),
        "greenhouse controller started"
    );

    // ── Tasks ───────────────────────────────────────────────────────
    let device = {
        let cancel = cancel.clone();
        let store = Arc::clone(&store);
        let sensor = board.sensor;
        tokio::spawn(async move {
            let result = device::run(sensor, controller, store, clock, cancel.clone()).await;
            // The device loop ending ends the process.
            cancel.cancel();
            result
        })
    };

    let cloud = {
        let cancel = cancel.clone();
        let device_id = settings.device.id.clone();
        let telemetry = Arc::clone(&telemetry);
        let store = Arc::clone(&store);
        let cloud_settings = settings.cloud;
        tokio::spawn(async move {
            let channel = CloudChannel::new(cloud_settings, &device_id, telemetry, store)?;
            channel.run(cancel).await
        })
    };

    let (device, cloud) = tokio::join!(device, cloud);

    match cloud {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("cloud channel stopped, telemetry is no longer sent: {e:#}"),
        Err(e) => error!("cloud task panicked: {e}"),
    }

    device.context("device task panicked")??;
    info!(
        unsent_samples = telemetry.pending(),
        "greenhouse controller stopped"
    );
    Ok(())
}

/// Cancel on SIGINT or SIGTERM.
async fn watch_signals(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!("cannot listen for Ctrl+C: {e}");
                return;
            }
            info!("received Ctrl+C, shutting down");
        }
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
    cancel.cancel();
}
