//! Pump and grow-light decision engine.
//!
//! Once per poll cycle the controller turns the latest humidity reading, the
//! wall clock and the current parameters into on/off decisions and applies
//! them to the actuators. Outputs are edge-triggered: an actuator is only
//! touched when its computed state differs from the current one.
//!
//! ## Pump hysteresis (dynamic scheme)
//!
//! ```text
//!   Inactive ──[below]──▶ BelowPhaseNotYetActivated ──[below for lag]──▶ Active
//!      ▲                     │ [above]                                     │ [above]
//!      │                     ▼                                             ▼
//!      │                  Inactive        Active ◀──[below]── AbovePhaseNotYetDeactivated
//!      │                                                                   │
//!      └──────────────────────────[above for lag]──────────────────────────┘
//! ```
//!
//! A crossing only takes effect once humidity has stayed on the new side of
//! the threshold for at least `lag`; shorter excursions are ignored.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use time::{OffsetDateTime, Time};
use tracing::{debug, error, info, warn};

use crate::actuator::Actuator;
use crate::params::{
    Config, WateringScheme, DEVICE_POLL_INTERVAL, LIGHTNING_END, LIGHTNING_START,
    WATERING_DURATION, WATERING_START, WATERING_THRESHOLD, WATERING_THRESHOLD_LAG,
    WINDOW_WRAPS_MIDNIGHT,
};
use crate::telemetry::TelemetryAggregator;

// ---------------------------------------------------------------------------
// Parameters resolved for one cycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ControlParams {
    pub poll_interval: Duration,
    pub scheme: WateringScheme,
    pub threshold: f64,
    pub lag: Duration,
    pub watering_start: Time,
    pub watering_duration: Duration,
    pub light_start: Time,
    pub light_end: Time,
    pub wraps_midnight: bool,
}

impl ControlParams {
    pub fn resolve(config: &Config) -> Result<Self> {
        let params = Self {
            poll_interval: config.seconds(DEVICE_POLL_INTERVAL)?,
            scheme: config.scheme()?,
            threshold: config.number(WATERING_THRESHOLD)?,
            lag: config.seconds(WATERING_THRESHOLD_LAG)?,
            watering_start: config.time_of_day(WATERING_START)?,
            watering_duration: config.seconds(WATERING_DURATION)?,
            light_start: config.time_of_day(LIGHTNING_START)?,
            light_end: config.time_of_day(LIGHTNING_END)?,
            wraps_midnight: config.flag_or(WINDOW_WRAPS_MIDNIGHT, false)?,
        };
        Ok(params)
    }

    /// End of the fixed watering window, modulo 24h.
    pub fn watering_end(&self) -> Time {
        self.watering_start + self.watering_duration
    }

    /// Windows that can never match under the current midnight handling.
    pub fn empty_windows(&self) -> Vec<&'static str> {
        let mut empty = Vec::new();
        if !self.wraps_midnight {
            if self.light_start > self.light_end {
                empty.push("lighting");
            }
            if self.scheme == WateringScheme::Fixed && self.watering_start > self.watering_end()
            {
                empty.push("watering");
            }
        }
        empty
    }
}

// ---------------------------------------------------------------------------
// Time windows
// ---------------------------------------------------------------------------

/// Light window: open at both ends, `start < now < end`.
pub fn in_light_window(params: &ControlParams, now: Time) -> bool {
    let (start, end) = (params.light_start, params.light_end);
    if start <= end {
        start < now && now < end
    } else if params.wraps_midnight {
        now > start || now < end
    } else {
        false
    }
}

/// Fixed watering window: `start <= now < start + duration`.
pub fn in_watering_window(params: &ControlParams, now: Time) -> bool {
    if params.watering_duration.is_zero() {
        return false;
    }
    let (start, end) = (params.watering_start, params.watering_end());
    if start < end {
        start <= now && now < end
    } else if params.wraps_midnight {
        now >= start || now < end
    } else {
        false
    }
}

// ---------------------------------------------------------------------------
// Actuator state
// ---------------------------------------------------------------------------

/// Which threshold crossing happened most recently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crossing {
    Below,
    Above,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpPhase {
    Inactive,
    BelowPhaseNotYetActivated,
    Active,
    AbovePhaseNotYetDeactivated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActuatorState {
    pub pump_on: bool,
    pub light_on: bool,
    pub last_below_crossing: OffsetDateTime,
    pub last_above_crossing: OffsetDateTime,
    /// Marker that was updated last.
    pub latest: Crossing,
}

impl ActuatorState {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            pump_on: false,
            light_on: false,
            last_below_crossing: start,
            last_above_crossing: start,
            latest: Crossing::Above,
        }
    }

    pub fn pump_phase(&self) -> PumpPhase {
        match (self.pump_on, self.latest) {
            (false, Crossing::Above) => PumpPhase::Inactive,
            (false, Crossing::Below) => PumpPhase::BelowPhaseNotYetActivated,
            (true, Crossing::Below) => PumpPhase::Active,
            (true, Crossing::Above) => PumpPhase::AbovePhaseNotYetDeactivated,
        }
    }

    /// Dynamic-scheme decision. Updates the crossing markers and returns the
    /// pump state this reading calls for.
    pub fn evaluate_hysteresis(
        &mut self,
        humidity: u8,
        threshold: f64,
        lag: Duration,
        now: OffsetDateTime,
    ) -> bool {
        if f64::from(humidity) < threshold {
            if self.latest == Crossing::Above {
                self.last_below_crossing = now;
                self.latest = Crossing::Below;
                debug!(humidity, threshold, "humidity crossed below threshold");
            } else if !self.pump_on && now >= self.last_below_crossing + lag {
                self.last_below_crossing = now;
                return true;
            }
        } else if self.latest == Crossing::Below {
            self.last_above_crossing = now;
            self.latest = Crossing::Above;
            debug!(humidity, threshold, "humidity crossed above threshold");
        } else if self.pump_on && now >= self.last_above_crossing + lag {
            self.last_above_crossing = now;
            return false;
        }
        self.pump_on
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct ActuationController {
    pump: Box<dyn Actuator>,
    light: Box<dyn Actuator>,
    state: ActuatorState,
    telemetry: Arc<TelemetryAggregator>,
    warned_empty: Vec<&'static str>,
}

impl ActuationController {
    /// Both actuators are forced off before the controller is returned.
    pub fn new(
        mut pump: Box<dyn Actuator>,
        mut light: Box<dyn Actuator>,
        telemetry: Arc<TelemetryAggregator>,
        start: OffsetDateTime,
    ) -> Result<Self> {
        pump.turn_off()?;
        light.turn_off()?;
        Ok(Self {
            pump,
            light,
            state: ActuatorState::new(start),
            telemetry,
            warned_empty: Vec::new(),
        })
    }

    pub fn state(&self) -> &ActuatorState {
        &self.state
    }

    /// One poll cycle. `humidity` is `None` when the sensor read failed; the
    /// time-based policies still run, the dynamic pump policy holds its state
    /// and no sample is recorded.
    pub fn step(
        &mut self,
        humidity: Option<u8>,
        now: OffsetDateTime,
        params: &ControlParams,
    ) -> Result<()> {
        self.warn_empty_windows(params);
        let tod = now.time();

        let light = in_light_window(params, tod);
        if light != self.state.light_on {
            switch(self.light.as_mut(), "light", light)?;
            self.state.light_on = light;
        }

        let pump = match (params.scheme, humidity) {
            (WateringScheme::Fixed, _) => in_watering_window(params, tod),
            (WateringScheme::Dynamic, Some(h)) => {
                self.state
                    .evaluate_hysteresis(h, params.threshold, params.lag, now)
            }
            (WateringScheme::Dynamic, None) => self.state.pump_on,
        };
        if pump != self.state.pump_on {
            switch(self.pump.as_mut(), "pump", pump)?;
            self.state.pump_on = pump;
            info!(
                humidity = ?humidity,
                scheme = ?params.scheme,
                phase = ?self.state.pump_phase(),
                at = %tod,
                "pump {}",
                if pump { "activated" } else { "deactivated" }
            );
        }

        match humidity {
            Some(h) => self
                .telemetry
                .record(h, self.state.pump_on, self.state.light_on),
            None => self
                .telemetry
                .record_flags(self.state.pump_on, self.state.light_on),
        }
        Ok(())
    }

    /// Force both actuators off, whatever their current state.
    pub fn shutdown(&mut self) -> Result<()> {
        let pump = self.pump.turn_off();
        let light = self.light.turn_off();
        if pump.is_ok() {
            self.state.pump_on = false;
        }
        if light.is_ok() {
            self.state.light_on = false;
        }
        self.telemetry
            .record_flags(self.state.pump_on, self.state.light_on);
        pump.and(light)
    }

    fn warn_empty_windows(&mut self, params: &ControlParams) {
        let empty = params.empty_windows();
        if empty != self.warned_empty {
            for window in &empty {
                warn!(
                    window,
                    "{window} window starts after it ends and {WINDOW_WRAPS_MIDNIGHT} is false; \
                     it will never be active"
                );
            }
            self.warned_empty = empty;
        }
    }
}

fn switch(actuator: &mut dyn Actuator, name: &str, on: bool) -> Result<()> {
    let res = if on {
        actuator.turn_on()
    } else {
        actuator.turn_off()
    };
    if let Err(e) = &res {
        error!(actuator = name, "failed to switch {}: {e:#}", if on { "ON" } else { "OFF" });
    }
    res
}

// ===========================================================================
// Tests
// ===========================================================================
