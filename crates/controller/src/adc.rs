//! MCP3008 10-bit ADC driver, bit-banged over four GPIO lines.
//!
//! The humidity probe is wired to one single-ended input of the converter.
//! Each read is a full chip-select framed transfer:
//!
//! ```text
//! CS   ‾‾\________________________________________________/‾‾
//! DOUT     S  D  C2 C1 C0                                        (5 command bits)
//! DIN                      P  N  B9 B8 B7 B6 B5 B4 B3 B2 B1 B0   (12 response bits)
//! ```
//!
//! `S` is the start bit, `D` selects single-ended mode, `C2..C0` is the
//! channel. The response starts with a padding bit and a null bit which are
//! dropped before scaling.

use embedded_hal::digital::{ErrorKind, InputPin, OutputPin};
use thiserror::Error;

// ── Protocol constants ──────────────────────────────────────────────────────

/// Highest single-ended input on the converter.
pub const MAX_CHANNEL: u8 = 7;

/// Start bit + single-ended bit, followed by three zero bits for the channel.
const START_SINGLE_ENDED: u8 = 0b11000;

/// Command word length in clock pulses.
const COMMAND_BITS: u32 = 5;

/// Padding bit + null bit + 10 data bits.
const RESPONSE_BITS: u32 = 12;

/// Mask keeping the 10 data bits of the response.
const DATA_MASK: u16 = 0x3FF;

/// Largest raw conversion value.
pub const FULL_SCALE: u16 = 1023;

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SampleError {
    #[error("adc channel {0} out of range (0-{MAX_CHANNEL})")]
    InvalidChannel(u8),
    #[error("adc line failure: {0:?}")]
    Line(ErrorKind),
}

fn line_err<E: embedded_hal::digital::Error>(e: E) -> SampleError {
    SampleError::Line(e.kind())
}

// ── Driver ──────────────────────────────────────────────────────────────────

/// Bit-banged MCP3008 driver.
pub struct Mcp3008<CLK, DOUT, DIN, CS> {
    clk: CLK,
    dout: DOUT,
    din: DIN,
    cs: CS,
}

impl<CLK, DOUT, DIN, CS> Mcp3008<CLK, DOUT, DIN, CS>
where
    CLK: OutputPin,
    DOUT: OutputPin,
    DIN: InputPin,
    CS: OutputPin,
{
    pub fn new(clk: CLK, dout: DOUT, din: DIN, cs: CS) -> Self {
        Self { clk, dout, din, cs }
    }

    /// Run one conversion on `channel` and return the raw value (0–1023).
    pub fn read_raw(&mut self, channel: u8) -> Result<u16, SampleError> {
        if channel > MAX_CHANNEL {
            return Err(SampleError::InvalidChannel(channel));
        }

        // Frame start: deselect, idle clock low, select.
        self.cs.set_high().map_err(line_err)?;
        self.clk.set_low().map_err(line_err)?;
        self.cs.set_low().map_err(line_err)?;

        let command = START_SINGLE_ENDED | channel;
        for bit in (0..COMMAND_BITS).rev() {
            if (command >> bit) & 1 == 1 {
                self.dout.set_high().map_err(line_err)?;
            } else {
                self.dout.set_low().map_err(line_err)?;
            }
            self.pulse_clock()?;
        }

        let mut raw: u16 = 0;
        for _ in 0..RESPONSE_BITS {
            self.pulse_clock()?;
            raw <<= 1;
            if self.din.is_high().map_err(line_err)? {
                raw |= 1;
            }
        }

        self.cs.set_high().map_err(line_err)?;

        Ok(raw & DATA_MASK)
    }

    /// Read `channel` and scale it to a 0–100 percentage.
    pub fn sample(&mut self, channel: u8) -> Result<u8, SampleError> {
        self.read_raw(channel).map(to_percent)
    }

    fn pulse_clock(&mut self) -> Result<(), SampleError> {
        self.clk.set_high().map_err(line_err)?;
        self.clk.set_low().map_err(line_err)
    }
}

/// Linear 0–1023 → 0–100 rescale, rounded to the nearest integer.
pub fn to_percent(raw: u16) -> u8 {
    let raw = f64::from(raw.min(FULL_SCALE));
    (raw * 100.0 / f64::from(FULL_SCALE)).round() as u8
}

// ── Humidity source ─────────────────────────────────────────────────────────

/// Anything the device loop can ask for a humidity percentage.
pub trait HumiditySource: Send {
    fn read_humidity(&mut self) -> Result<u8, SampleError>;
}

impl<T: HumiditySource + ?Sized> HumiditySource for Box<T> {
    fn read_humidity(&mut self) -> Result<u8, SampleError> {
        (**self).read_humidity()
    }
}

/// An [`Mcp3008`] bound to the channel the probe is wired to.
pub struct Sampler<CLK, DOUT, DIN, CS> {
    adc: Mcp3008<CLK, DOUT, DIN, CS>,
    channel: u8,
}

impl<CLK, DOUT, DIN, CS> Sampler<CLK, DOUT, DIN, CS> {
    pub fn new(adc: Mcp3008<CLK, DOUT, DIN, CS>, channel: u8) -> Self {
        Self { adc, channel }
    }
}

impl<CLK, DOUT, DIN, CS> HumiditySource for Sampler<CLK, DOUT, DIN, CS>
where
    CLK: OutputPin + Send,
    DOUT: OutputPin + Send,
    DIN: InputPin + Send,
    CS: OutputPin + Send,
{
    fn read_humidity(&mut self) -> Result<u8, SampleError> {
        self.adc.sample(self.channel)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
