//! Process settings (device identity, cloud endpoint, wiring) loaded from a
//! TOML file at startup. Runtime-tunable parameters live in `params` instead.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Settings file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub device: DeviceSettings,
    pub cloud: CloudSettings,
    #[serde(default)]
    pub gpio: GpioSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceSettings {
    pub id: String,
    #[serde(default = "default_params_path")]
    pub params_path: PathBuf,
    /// ADC input the humidity probe is wired to.
    #[serde(default)]
    pub sensor_channel: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SigningAlgorithm {
    #[default]
    Rs256,
    Es256,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloudSettings {
    pub project_id: String,
    pub region: String,
    pub registry_id: String,
    pub private_key_file: PathBuf,
    #[serde(default)]
    pub algorithm: SigningAlgorithm,
    /// Root certificates; TLS is used when set.
    #[serde(default)]
    pub ca_certs: Option<PathBuf>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_keep_alive_sec")]
    pub keep_alive_sec: u64,
    #[serde(default = "default_token_validity_min")]
    pub token_validity_min: u64,
    #[serde(default = "default_token_refresh_min")]
    pub token_refresh_min: u64,
    #[serde(default = "default_initial_backoff_sec")]
    pub initial_backoff_sec: u64,
    #[serde(default = "default_max_backoff_sec")]
    pub max_backoff_sec: u64,
}

impl CloudSettings {
    pub fn token_validity(&self) -> Duration {
        Duration::from_secs(self.token_validity_min * 60)
    }

    pub fn token_refresh(&self) -> Duration {
        Duration::from_secs(self.token_refresh_min * 60)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_secs(self.initial_backoff_sec)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_sec)
    }
}

/// BCM pin numbers. Defaults follow the common MCP3008 breakout wiring.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GpioSettings {
    pub clock: u8,
    pub data_out: u8,
    pub data_in: u8,
    pub chip_select: u8,
    pub pump: u8,
    pub light: u8,
    /// Many relay boards are active-low.
    pub active_low: bool,
}

impl Default for GpioSettings {
    fn default() -> Self {
        Self {
            clock: 18,
            data_out: 24,
            data_in: 23,
            chip_select: 25,
            pump: 17,
            light: 27,
            active_low: true,
        }
    }
}

impl GpioSettings {
    fn lines(&self) -> [(&'static str, u8); 6] {
        [
            ("clock", self.clock),
            ("data_out", self.data_out),
            ("data_in", self.data_in),
            ("chip_select", self.chip_select),
            ("pump", self.pump),
            ("light", self.light),
        ]
    }
}

fn default_params_path() -> PathBuf {
    PathBuf::from("greenhouse.json")
}

fn default_host() -> String {
    "mqtt.googleapis.com".to_string()
}

fn default_port() -> u16 {
    8883
}

fn default_keep_alive_sec() -> u64 {
    60
}

fn default_token_validity_min() -> u64 {
    60
}

fn default_token_refresh_min() -> u64 {
    20
}

fn default_initial_backoff_sec() -> u64 {
    1
}

fn default_max_backoff_sec() -> u64 {
    32
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
const VALID_GPIO_PINS: std::ops::RangeInclusive<u8> = 2..=27;

/// Highest MCP3008 input.
const MAX_SENSOR_CHANNEL: u8 = 7;

/// rumqttc refuses keep-alives shorter than this.
const MIN_KEEP_ALIVE_SEC: u64 = 5;

impl Settings {
    /// Validate every section. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_device(&mut errors);
        self.validate_cloud(&mut errors);
        self.validate_gpio(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "settings validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_device(&self, errors: &mut Vec<String>) {
        let d = &self.device;
        if d.id.trim().is_empty() {
            errors.push("device.id is empty".to_string());
        } else if d.id.contains(['/', '+', '#']) {
            errors.push(format!(
                "device.id '{}' must not contain MQTT topic characters (/ + #)",
                d.id
            ));
        }
        if d.sensor_channel > MAX_SENSOR_CHANNEL {
            errors.push(format!(
                "device.sensor_channel {} out of range (0-{MAX_SENSOR_CHANNEL})",
                d.sensor_channel
            ));
        }
    }

    fn validate_cloud(&self, errors: &mut Vec<String>) {
        let c = &self.cloud;

        for (field, value) in [
            ("project_id", &c.project_id),
            ("region", &c.region),
            ("registry_id", &c.registry_id),
            ("host", &c.host),
        ] {
            if value.trim().is_empty() {
                errors.push(format!("cloud.{field} is empty"));
            }
        }

        if c.port == 0 {
            errors.push("cloud.port must be non-zero".to_string());
        }
        if c.keep_alive_sec < MIN_KEEP_ALIVE_SEC {
            errors.push(format!(
                "cloud.keep_alive_sec must be at least {MIN_KEEP_ALIVE_SEC}, got {}",
                c.keep_alive_sec
            ));
        }

        if c.token_validity_min == 0 {
            errors.push("cloud.token_validity_min must be positive".to_string());
        }
        if c.token_refresh_min == 0 {
            errors.push("cloud.token_refresh_min must be positive".to_string());
        } else if c.token_refresh_min >= c.token_validity_min {
            errors.push(format!(
                "cloud.token_refresh_min ({}) must be less than token_validity_min ({})",
                c.token_refresh_min, c.token_validity_min
            ));
        }

        if c.initial_backoff_sec == 0 {
            errors.push("cloud.initial_backoff_sec must be positive".to_string());
        } else if c.initial_backoff_sec > c.max_backoff_sec {
            errors.push(format!(
                "cloud.initial_backoff_sec ({}) exceeds max_backoff_sec ({})",
                c.initial_backoff_sec, c.max_backoff_sec
            ));
        }
    }

    fn validate_gpio(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<u8> = HashSet::new();
        for (name, pin) in self.gpio.lines() {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "gpio.{name}: {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if !seen.insert(pin) {
                errors.push(format!("gpio.{name}: pin {pin} is already used by another line"));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML settings file.
pub fn load(path: &str) -> Result<Settings> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read settings: {path}"))?;
    let settings = parse(&contents).with_context(|| format!("invalid settings: {path}"))?;
    tracing::info!(
        device = %settings.device.id,
        broker = %settings.cloud.host,
        port = settings.cloud.port,
        tls = settings.cloud.ca_certs.is_some(),
        "settings loaded"
    );
    Ok(settings)
}

pub fn parse(contents: &str) -> Result<Settings> {
    let settings: Settings = toml::from_str(contents).context("failed to parse settings")?;
    settings.validate()?;
    Ok(settings)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const MINIMAL: &str = r#"
[device]
id = "raspi1"

[cloud]
project_id = "greenhouse-test"
region = "europe-west1"
registry_id = "inventory1"
private_key_file = "rsa_private.pem"
"#;

    pub(crate) fn minimal() -> Settings {
        parse(MINIMAL).unwrap()
    }

    fn assert_validation_err(settings: &Settings, needle: &str) {
        let err = settings.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn minimal_settings_get_defaults() {
        let s = minimal();
        assert_eq!(s.device.id, "raspi1");
        assert_eq!(s.device.params_path, PathBuf::from("greenhouse.json"));
        assert_eq!(s.device.sensor_channel, 0);
        assert_eq!(s.cloud.algorithm, SigningAlgorithm::Rs256);
        assert_eq!(s.cloud.host, "mqtt.googleapis.com");
        assert_eq!(s.cloud.port, 8883);
        assert!(s.cloud.ca_certs.is_none());
        assert_eq!(s.cloud.token_validity(), Duration::from_secs(3600));
        assert_eq!(s.cloud.token_refresh(), Duration::from_secs(1200));
        assert_eq!(s.cloud.initial_backoff(), Duration::from_secs(1));
        assert_eq!(s.cloud.max_backoff(), Duration::from_secs(32));
        assert_eq!(s.gpio.pump, 17);
        assert!(s.gpio.active_low);
    }

    #[test]
    fn full_settings_parse() {
        let toml_str = r#"
[device]
id = "bed-2"
params_path = "/var/lib/greenhouse/params.json"
sensor_channel = 3

[cloud]
project_id = "p"
region = "r"
registry_id = "g"
private_key_file = "ec_private.pem"
algorithm = "ES256"
ca_certs = "roots.pem"
host = "localhost"
port = 1883
token_refresh_min = 10

[gpio]
pump = 5
light = 6
active_low = false
"#;
        let s = parse(toml_str).unwrap();
        assert_eq!(s.device.sensor_channel, 3);
        assert_eq!(s.cloud.algorithm, SigningAlgorithm::Es256);
        assert_eq!(s.cloud.ca_certs, Some(PathBuf::from("roots.pem")));
        assert_eq!(s.cloud.token_refresh_min, 10);
        assert_eq!(s.gpio.pump, 5);
        assert_eq!(s.gpio.clock, 18, "unset gpio fields keep defaults");
        assert!(!s.gpio.active_low);
    }

    #[test]
    fn unknown_algorithm_fails_to_parse() {
        let toml_str = MINIMAL.replace(
            "private_key_file = \"rsa_private.pem\"",
            "private_key_file = \"k.pem\"\nalgorithm = \"HS256\"",
        );
        assert!(parse(&toml_str).is_err());
    }

    #[test]
    fn missing_cloud_section_fails() {
        assert!(parse("[device]\nid = \"x\"\n").is_err());
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn minimal_settings_pass() {
        minimal().validate().unwrap();
    }

    #[test]
    fn empty_device_id_rejected() {
        let mut s = minimal();
        s.device.id = " ".into();
        assert_validation_err(&s, "device.id is empty");
    }

    #[test]
    fn topic_characters_in_device_id_rejected() {
        let mut s = minimal();
        s.device.id = "a/b".into();
        assert_validation_err(&s, "must not contain MQTT topic characters");
    }

    #[test]
    fn sensor_channel_out_of_range() {
        let mut s = minimal();
        s.device.sensor_channel = 8;
        assert_validation_err(&s, "device.sensor_channel 8 out of range (0-7)");
    }

    #[test]
    fn refresh_must_be_shorter_than_validity() {
        let mut s = minimal();
        s.cloud.token_refresh_min = 60;
        assert_validation_err(&s, "must be less than token_validity_min");
    }

    #[test]
    fn initial_backoff_above_max_rejected() {
        let mut s = minimal();
        s.cloud.initial_backoff_sec = 64;
        assert_validation_err(&s, "exceeds max_backoff_sec");
    }

    #[test]
    fn zero_backoff_rejected() {
        let mut s = minimal();
        s.cloud.initial_backoff_sec = 0;
        assert_validation_err(&s, "initial_backoff_sec must be positive");
    }

    #[test]
    fn short_keep_alive_rejected() {
        let mut s = minimal();
        s.cloud.keep_alive_sec = 2;
        assert_validation_err(&s, "keep_alive_sec must be at least 5");
    }

    #[test]
    fn reserved_pin_rejected() {
        let mut s = minimal();
        s.gpio.pump = 1;
        assert_validation_err(&s, "gpio.pump: 1 is not a valid BCM GPIO pin");
    }

    #[test]
    fn shared_pin_rejected() {
        let mut s = minimal();
        s.gpio.light = s.gpio.pump;
        assert_validation_err(&s, "gpio.light: pin 17 is already used");
    }

    #[test]
    fn all_errors_reported_together() {
        let mut s = minimal();
        s.device.id = "".into();
        s.cloud.region = "".into();
        s.gpio.clock = 40;
        assert_validation_err(&s, "3 errors");
    }

    #[test]
    fn load_missing_file_fails() {
        let err = load("/nonexistent/controller.toml").unwrap_err();
        assert!(format!("{err:#}").contains("failed to read settings"));
    }
}
