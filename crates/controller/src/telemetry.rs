//! Running aggregate of humidity samples and the latest actuator flags,
//! shared between the device loop (writer) and the cloud loop (reader).

use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// What gets published to the telemetry topic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    /// Mean humidity since the previous drain, 0 if nothing was recorded.
    pub humidity: f64,
    pub pump_active: bool,
    pub light_active: bool,
    /// Number of samples folded into `humidity`.
    #[serde(skip)]
    pub samples: usize,
}

#[derive(Default)]
struct Inner {
    samples: Vec<u8>,
    pump_active: bool,
    light_active: bool,
}

#[derive(Default)]
pub struct TelemetryAggregator {
    inner: Mutex<Inner>,
}

impl TelemetryAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a humidity sample and overwrite the actuator flags.
    pub fn record(&self, humidity: u8, pump_active: bool, light_active: bool) {
        let mut inner = self.lock();
        inner.samples.push(humidity);
        inner.pump_active = pump_active;
        inner.light_active = light_active;
    }

    /// Overwrite the actuator flags without adding a sample.
    pub fn record_flags(&self, pump_active: bool, light_active: bool) {
        let mut inner = self.lock();
        inner.pump_active = pump_active;
        inner.light_active = light_active;
    }

    /// Mean of the buffered samples plus current flags; clears the buffer.
    pub fn drain(&self) -> TelemetrySnapshot {
        let mut inner = self.lock();
        let samples = inner.samples.len();
        let humidity = if samples == 0 {
            0.0
        } else {
            let sum: u64 = inner.samples.iter().map(|&h| u64::from(h)).sum();
            sum as f64 / samples as f64
        };
        inner.samples.clear();

        TelemetrySnapshot {
            humidity,
            pump_active: inner.pump_active,
            light_active: inner.light_active,
            samples,
        }
    }

    pub fn pending(&self) -> usize {
        self.lock().samples.len()
    }

    // A panic while holding the lock cannot leave `Inner` half-written: every
    // mutation is a plain field store.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
