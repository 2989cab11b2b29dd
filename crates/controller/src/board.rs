//! Wiring of the sensor and both actuators. The `gpio` feature gates the real
//! rppal lines; without it, simulated lines and an emulated converter are used.

use anyhow::Result;

use crate::actuator::{Actuator, LineActuator};
use crate::adc::{HumiditySource, Mcp3008, Sampler};
use crate::settings::GpioSettings;

/// Everything the device loop drives.
pub struct Board {
    pub sensor: Box<dyn HumiditySource>,
    pub pump: Box<dyn Actuator>,
    pub light: Box<dyn Actuator>,
}

// ---------------------------------------------------------------------------
// Real GPIO board (production, requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
mod lines {
    use embedded_hal::digital::{ErrorType, InputPin, OutputPin};
    use rppal::gpio;
    use std::convert::Infallible;

    /// rppal output behind the embedded-hal trait.
    pub struct Output(pub gpio::OutputPin);

    impl ErrorType for Output {
        type Error = Infallible;
    }

    impl OutputPin for Output {
        fn set_low(&mut self) -> Result<(), Infallible> {
            self.0.set_low();
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Infallible> {
            self.0.set_high();
            Ok(())
        }
    }

    /// rppal input behind the embedded-hal trait.
    pub struct Input(pub gpio::InputPin);

    impl ErrorType for Input {
        type Error = Infallible;
    }

    impl InputPin for Input {
        fn is_high(&mut self) -> Result<bool, Infallible> {
            Ok(self.0.is_high())
        }

        fn is_low(&mut self) -> Result<bool, Infallible> {
            Ok(self.0.is_low())
        }
    }
}

#[cfg(feature = "gpio")]
pub fn open(pins: &GpioSettings, channel: u8) -> Result<Board> {
    use anyhow::Context;
    use lines::{Input, Output};
    use rppal::gpio::Gpio;

    let gpio = Gpio::new().context("failed to open GPIO")?;
    let output = |pin: u8| -> Result<Output> {
        Ok(Output(
            gpio.get(pin)
                .with_context(|| format!("GPIO {pin} unavailable"))?
                .into_output(),
        ))
    };

    let adc = Mcp3008::new(
        output(pins.clock)?,
        output(pins.data_out)?,
        Input(
            gpio.get(pins.data_in)
                .with_context(|| format!("GPIO {} unavailable", pins.data_in))?
                .into_input(),
        ),
        output(pins.chip_select)?,
    );

    // Fail-safe: LineActuator::new drives OFF before returning.
    let pump = LineActuator::new("pump", output(pins.pump)?, pins.active_low)?;
    let light = LineActuator::new("light", output(pins.light)?, pins.active_low)?;

    tracing::info!(
        clock = pins.clock,
        data_out = pins.data_out,
        data_in = pins.data_in,
        chip_select = pins.chip_select,
        channel,
        pump = pins.pump,
        light = pins.light,
        active_low = pins.active_low,
        "gpio board ready"
    );

    Ok(Board {
        sensor: Box::new(Sampler::new(adc, channel)),
        pump: Box::new(pump),
        light: Box::new(light),
    })
}

// ---------------------------------------------------------------------------
// Simulated board (development, no hardware)
// ---------------------------------------------------------------------------

#[cfg(not(feature = "gpio"))]
pub fn open(pins: &GpioSettings, channel: u8) -> Result<Board> {
    use crate::sim::{HumiditySim, Scenario, SimAdc, SimLine};

    let scenario = std::env::var("SIM_SCENARIO")
        .map(|s| Scenario::from_str_lossy(&s))
        .unwrap_or(Scenario::Drying);

    let pump_line = SimLine::new();
    let model = HumiditySim::new(scenario, pump_line.probe(), pins.active_low);
    let sim = SimAdc::new(model, channel);
    let adc = Mcp3008::new(sim.clock(), sim.data_out(), sim.data_in(), sim.chip_select());

    let pump = LineActuator::new("pump", pump_line, pins.active_low)?;
    let light = LineActuator::new("light", SimLine::new(), pins.active_low)?;

    tracing::warn!(%scenario, channel, "gpio feature disabled, using simulated board");

    Ok(Board {
        sensor: Box::new(Sampler::new(adc, channel)),
        pump: Box::new(pump),
        light: Box::new(light),
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, not(feature = "gpio")))]
mod tests {
    use super::*;

    #[test]
    fn simulated_board_starts_off_and_switches() {
        let mut board = open(&GpioSettings::default(), 0).unwrap();
        let h = board.sensor.read_humidity().unwrap();
        assert!(h <= 100);
        board.pump.turn_on().unwrap();
        board.light.turn_on().unwrap();
        board.pump.turn_off().unwrap();
        board.light.turn_off().unwrap();
    }

    #[test]
    fn simulated_pump_line_follows_polarity() {
        use crate::sim::SimLine;
        use std::sync::atomic::Ordering;

        let line = SimLine::new();
        let level = line.probe();
        let mut pump = LineActuator::new("pump", line, true).unwrap();
        assert!(level.load(Ordering::Relaxed), "active-low OFF is high");
        pump.turn_on().unwrap();
        assert!(!level.load(Ordering::Relaxed));
    }
}
