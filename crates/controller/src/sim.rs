//! Simulated board for development without hardware: relay lines that only
//! remember their level, and an emulated MCP3008 whose selected input is fed
//! by a humidity model. The real bit-banged driver runs against it unchanged.
//!
//! The humidity model:
//! - Temporal coherence via random walk with mean reversion
//! - Gradual drying drift (evaporation)
//! - Per-reading ADC noise
//! - Occasional spikes (sensor flakiness)
//! - Closed-loop watering response (humidity rises while the pump line is on)

use embedded_hal::digital::{ErrorType, InputPin, OutputPin};
use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::adc::FULL_SCALE;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Output line
// ---------------------------------------------------------------------------

/// Output line that stores its electrical level.
#[derive(Default)]
pub struct SimLine {
    level: Arc<AtomicBool>,
}

impl SimLine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared view of the line level, readable after the line is moved.
    pub fn probe(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.level)
    }
}

impl ErrorType for SimLine {
    type Error = Infallible;
}

impl OutputPin for SimLine {
    fn set_low(&mut self) -> Result<(), Infallible> {
        self.level.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.level.store(true, Ordering::Relaxed);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profiles selectable via the `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Starts mid-range and dries steadily; crosses a 40 % threshold within
    /// a few minutes at a 1 s poll.
    Drying,
    /// Hovers near the centre with little noise.
    Stable,
    /// High noise and frequent spikes. Exercises the hysteresis debounce.
    Flaky,
    /// Starts near saturation and dries very slowly.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Drying,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

// ---------------------------------------------------------------------------
// Humidity probe
// ---------------------------------------------------------------------------

/// Probe model in raw converter counts (0..=1023, higher is wetter).
pub struct HumiditySim {
    /// Current "true" humidity in counts. Evolves each sample.
    base: f64,

    drift_per_sample: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    center: f64,
    noise_sigma: f64,

    spike_prob: f32,
    spike_sigma: f64,

    /// Pump line level plus its polarity, to tell when water is flowing.
    pump_line: Arc<AtomicBool>,
    pump_active_low: bool,
    wet_rate: f64,
}

impl HumiditySim {
    pub fn new(scenario: Scenario, pump_line: Arc<AtomicBool>, pump_active_low: bool) -> Self {
        let full = f64::from(FULL_SCALE);

        // start_frac: 0.0 = bone dry, 1.0 = saturated
        let (drift, walk_sigma, mean_rev, noise_sigma, spike_prob, spike_sigma, start_frac) =
            match scenario {
                Scenario::Drying => (-1.5, 4.0, 0.002, 3.0, 0.03_f32, 80.0, 0.5),
                Scenario::Stable => (-0.1, 1.5, 0.05, 1.0, 0.005, 40.0, 0.5),
                Scenario::Flaky => (-1.0, 8.0, 0.02, 12.0, 0.10, 150.0, 0.45),
                Scenario::Wet => (-0.2, 2.0, 0.01, 2.0, 0.02, 60.0, 0.85),
            };

        Self {
            base: full * start_frac,
            drift_per_sample: drift,
            walk_sigma,
            mean_reversion: mean_rev,
            center: full * 0.5,
            noise_sigma,
            spike_prob,
            spike_sigma,
            pump_line,
            pump_active_low,
            wet_rate: 12.0,
        }
    }

    fn watering(&self) -> bool {
        self.pump_line.load(Ordering::Relaxed) != self.pump_active_low
    }

    /// Next raw conversion value.
    pub fn sample_raw(&mut self) -> u16 {
        let full = f64::from(FULL_SCALE);

        let pull = self.mean_reversion * (self.center - self.base);
        let walk = gaussian(0.0, self.walk_sigma);
        let wet = if self.watering() { self.wet_rate } else { 0.0 };
        self.base = (self.base + self.drift_per_sample + pull + walk + wet).clamp(0.0, full);

        let noise = gaussian(0.0, self.noise_sigma);
        let spike = if fastrand::f32() < self.spike_prob {
            gaussian(0.0, self.spike_sigma)
        } else {
            0.0
        };

        (self.base + noise + spike).round().clamp(0.0, full) as u16
    }
}

// ---------------------------------------------------------------------------
// Emulated converter
// ---------------------------------------------------------------------------

/// Clock edges in the command phase (start, mode, three channel bits).
const COMMAND_EDGES: u32 = 5;

/// Clock edges in a full transfer: command plus 12 response bits.
const TRANSFER_EDGES: u32 = 17;

struct Converter {
    model: HumiditySim,
    /// Input the probe is wired to; every other input reads 0.
    probe_channel: u8,
    selected: bool,
    command_bit: bool,
    edges: u32,
    command: u8,
    response: u16,
}

impl Converter {
    fn select(&mut self, selected: bool) {
        self.selected = selected;
        self.edges = 0;
        self.command = 0;
        self.response = 0;
    }

    fn rising_edge(&mut self) {
        if !self.selected || self.edges >= TRANSFER_EDGES {
            return;
        }
        self.edges += 1;
        if self.edges <= COMMAND_EDGES {
            self.command = (self.command << 1) | u8::from(self.command_bit);
        }
        if self.edges == COMMAND_EDGES {
            let channel = self.command & 0b111;
            self.response = if channel == self.probe_channel {
                self.model.sample_raw()
            } else {
                0
            };
        }
    }

    /// Response bit for the most recent clock edge, MSB of 12 first.
    fn response_bit(&self) -> bool {
        if !self.selected || self.edges <= COMMAND_EDGES {
            return false;
        }
        (self.response >> (TRANSFER_EDGES - self.edges)) & 1 == 1
    }
}

/// Shared handle to one emulated MCP3008; hands out its four lines.
#[derive(Clone)]
pub struct SimAdc {
    inner: Arc<Mutex<Converter>>,
}

impl SimAdc {
    pub fn new(model: HumiditySim, probe_channel: u8) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Converter {
                model,
                probe_channel,
                selected: false,
                command_bit: false,
                edges: 0,
                command: 0,
                response: 0,
            })),
        }
    }

    pub fn clock(&self) -> SimAdcLine {
        self.line(Role::Clock)
    }

    /// Controller-to-converter data line.
    pub fn data_out(&self) -> SimAdcLine {
        self.line(Role::Command)
    }

    pub fn chip_select(&self) -> SimAdcLine {
        self.line(Role::ChipSelect)
    }

    /// Converter-to-controller data line.
    pub fn data_in(&self) -> SimAdcInput {
        SimAdcInput { adc: self.clone() }
    }

    fn line(&self, role: Role) -> SimAdcLine {
        SimAdcLine {
            adc: self.clone(),
            role,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Converter> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone, Copy)]
enum Role {
    Clock,
    Command,
    ChipSelect,
}

/// A line driven by the controller into the emulated converter.
pub struct SimAdcLine {
    adc: SimAdc,
    role: Role,
}

impl SimAdcLine {
    fn set(&mut self, high: bool) {
        let mut conv = self.adc.lock();
        match self.role {
            Role::Clock if high => conv.rising_edge(),
            Role::Clock => {}
            Role::Command => conv.command_bit = high,
            // Chip select is active low.
            Role::ChipSelect => conv.select(!high),
        }
    }
}

impl ErrorType for SimAdcLine {
    type Error = Infallible;
}

impl OutputPin for SimAdcLine {
    fn set_low(&mut self) -> Result<(), Infallible> {
        self.set(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.set(true);
        Ok(())
    }
}

/// The converter's serial output as seen by the controller.
pub struct SimAdcInput {
    adc: SimAdc,
}

impl ErrorType for SimAdcInput {
    type Error = Infallible;
}

impl InputPin for SimAdcInput {
    fn is_high(&mut self) -> Result<bool, Infallible> {
        Ok(self.adc.lock().response_bit())
    }

    fn is_low(&mut self) -> Result<bool, Infallible> {
        self.is_high().map(|b| !b)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
