//! On/off actuators (pump, grow light) driven through a single output line.

use anyhow::{anyhow, Result};
use embedded_hal::digital::{Error as _, OutputPin};
use tracing::info;

/// The capability the controller needs from an actuator.
pub trait Actuator: Send {
    fn turn_on(&mut self) -> Result<()>;
    fn turn_off(&mut self) -> Result<()>;
}

/// Relay on one digital output line.
pub struct LineActuator<P> {
    name: &'static str,
    pin: P,
    active_low: bool, // many relay boards are active-low
}

impl<P: OutputPin> LineActuator<P> {
    /// Take ownership of `pin` and drive it to the OFF level immediately.
    pub fn new(name: &'static str, pin: P, active_low: bool) -> Result<Self> {
        let mut actuator = Self {
            name,
            pin,
            active_low,
        };
        actuator.drive(false)?;
        Ok(actuator)
    }

    fn drive(&mut self, on: bool) -> Result<()> {
        // active-low: LOW = ON, HIGH = OFF
        let high = on != self.active_low;
        let res = if high {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };
        res.map_err(|e| anyhow!("{} line: {:?}", self.name, e.kind()))
    }
}

impl<P: OutputPin + Send> Actuator for LineActuator<P> {
    fn turn_on(&mut self) -> Result<()> {
        self.drive(true)?;
        info!(actuator = self.name, "set ON");
        Ok(())
    }

    fn turn_off(&mut self) -> Result<()> {
        self.drive(false)?;
        info!(actuator = self.name, "set OFF");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal::digital::{ErrorKind, ErrorType};
    use std::convert::Infallible;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingPin {
        levels: Arc<Mutex<Vec<bool>>>,
    }

    impl RecordingPin {
        fn last(&self) -> Option<bool> {
            self.levels.lock().unwrap().last().copied()
        }
    }

    impl ErrorType for RecordingPin {
        type Error = Infallible;
    }

    impl OutputPin for RecordingPin {
        fn set_low(&mut self) -> Result<(), Infallible> {
            self.levels.lock().unwrap().push(false);
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Infallible> {
            self.levels.lock().unwrap().push(true);
            Ok(())
        }
    }

    struct StuckPin;

    impl ErrorType for StuckPin {
        type Error = ErrorKind;
    }

    impl OutputPin for StuckPin {
        fn set_low(&mut self) -> Result<(), ErrorKind> {
            Err(ErrorKind::Other)
        }

        fn set_high(&mut self) -> Result<(), ErrorKind> {
            Err(ErrorKind::Other)
        }
    }

    // -- Fail-safe at construction -------------------------------------------

    #[test]
    fn new_active_low_drives_high() {
        let pin = RecordingPin::default();
        let _pump = LineActuator::new("pump", pin.clone(), true).unwrap();
        assert_eq!(pin.last(), Some(true));
    }

    #[test]
    fn new_active_high_drives_low() {
        let pin = RecordingPin::default();
        let _light = LineActuator::new("light", pin.clone(), false).unwrap();
        assert_eq!(pin.last(), Some(false));
    }

    // -- Polarity ---------------------------------------------------------------

    #[test]
    fn active_low_on_is_low() {
        let pin = RecordingPin::default();
        let mut pump = LineActuator::new("pump", pin.clone(), true).unwrap();
        pump.turn_on().unwrap();
        assert_eq!(pin.last(), Some(false));
        pump.turn_off().unwrap();
        assert_eq!(pin.last(), Some(true));
    }

    #[test]
    fn active_high_on_is_high() {
        let pin = RecordingPin::default();
        let mut light = LineActuator::new("light", pin.clone(), false).unwrap();
        light.turn_on().unwrap();
        assert_eq!(pin.last(), Some(true));
        light.turn_off().unwrap();
        assert_eq!(pin.last(), Some(false));
    }

    #[test]
    fn line_error_names_actuator() {
        let err = LineActuator::new("pump", StuckPin, true).err().unwrap();
        assert!(err.to_string().contains("pump line"), "got: {err}");
    }

    #[test]
    fn usable_as_trait_object() {
        let pin = RecordingPin::default();
        let mut boxed: Box<dyn Actuator> =
            Box::new(LineActuator::new("light", pin.clone(), false).unwrap());
        boxed.turn_on().unwrap();
        assert_eq!(pin.last(), Some(true));
    }
}
