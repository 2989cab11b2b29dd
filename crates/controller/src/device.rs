//! Device-control loop: sample, decide, actuate, sleep.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adc::HumiditySource;
use crate::clock::LocalClock;
use crate::control::{ActuationController, ControlParams};
use crate::params::ConfigStore;

/// Run until `cancel` fires or a cycle fails. Both actuators are forced off
/// on the way out in every case.
///
/// Parameters are re-read every cycle so remote updates take effect on the
/// next poll. Time-of-day windows are evaluated in `clock`'s local time.
pub async fn run<S: HumiditySource>(
    mut sensor: S,
    mut controller: ActuationController,
    store: Arc<ConfigStore>,
    mut clock: LocalClock,
    cancel: CancellationToken,
) -> Result<()> {
    info!(offset = %clock.offset(), "device loop starting");

    let result =
        cycle_until_cancelled(&mut sensor, &mut controller, &store, &mut clock, &cancel).await;
    let off = controller.shutdown().context("failed to force actuators off");

    match (&result, &off) {
        (Ok(()), Ok(())) => info!("device loop stopped, actuators off"),
        (Err(e), _) => error!("device loop failed: {e:#}"),
        (Ok(()), Err(e)) => error!("{e:#}"),
    }
    result.and(off)
}

async fn cycle_until_cancelled<S: HumiditySource>(
    sensor: &mut S,
    controller: &mut ActuationController,
    store: &ConfigStore,
    clock: &mut LocalClock,
    cancel: &CancellationToken,
) -> Result<()> {
    while !cancel.is_cancelled() {
        let params = ControlParams::resolve(&store.snapshot())
            .context("cannot resolve control parameters")?;

        let humidity = match sensor.read_humidity() {
            Ok(h) => Some(h),
            Err(e) => {
                warn!(error = %e, "humidity read failed, skipping sample");
                None
            }
        };

        let now = clock.now();
        controller.step(humidity, now, &params)?;
        let state = controller.state();
        debug!(
            humidity = ?humidity,
            pump = state.pump_on,
            light = state.light_on,
            "cycle done"
        );

        sleep(params.poll_interval).await;
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
