//! Runtime parameters: a flat name → scalar document, persisted as JSON and
//! replaceable at runtime by configuration pushes from the cloud.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use time::macros::format_description;
use time::Time;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Parameter names
// ---------------------------------------------------------------------------

pub const DEVICE_POLL_INTERVAL: &str = "device_poll_interval";
pub const WATERING_SCHEME: &str = "watering_scheme";
pub const WATERING_THRESHOLD: &str = "watering_threshold";
pub const WATERING_THRESHOLD_LAG: &str = "watering_threshold_lag";
pub const WATERING_START: &str = "watering_start";
pub const WATERING_DURATION: &str = "watering_duration";
pub const LIGHTNING_START: &str = "lightning_start";
pub const LIGHTNING_END: &str = "lightning_end";
pub const SEND_INTERVAL: &str = "gcp_send_interval";
/// Optional; `false` when absent.
pub const WINDOW_WRAPS_MIDNIGHT: &str = "time_window_wraps_midnight";

const DURATION_KEYS: &[&str] = &[
    DEVICE_POLL_INTERVAL,
    WATERING_THRESHOLD_LAG,
    WATERING_DURATION,
    SEND_INTERVAL,
];
const TIME_OF_DAY_KEYS: &[&str] = &[WATERING_START, LIGHTNING_START, LIGHTNING_END];

/// The fixed watering window is taken modulo 24h, so it must end within a day.
const MAX_WATERING_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// A single parameter value. Nested arrays/objects and `null` are rejected
/// at deserialization time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// Numbers compare by value, so `10` and `10.0` are the same setting.
impl PartialEq for Scalar {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Text(a), Self::Text(b)) => a == b,
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => write!(f, "{s:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WateringScheme {
    /// Pump runs in a daily time window.
    Fixed,
    /// Pump follows humidity with hysteresis.
    Dynamic,
}

impl std::str::FromStr for WateringScheme {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fixed" => Ok(Self::Fixed),
            "dynamic" => Ok(Self::Dynamic),
            other => bail!("unknown watering scheme '{other}' (use fixed/dynamic)"),
        }
    }
}

// ---------------------------------------------------------------------------
// Config document
// ---------------------------------------------------------------------------

/// A complete, validated parameter set. Construct through [`Config::from_map`]
/// or [`Config::from_json`]; a value of this type always carries every
/// required key with a usable value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Config {
    values: BTreeMap<String, Scalar>,
}

impl Config {
    pub fn from_map(values: BTreeMap<String, Scalar>) -> Result<Self> {
        let config = Self { values };
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let values: BTreeMap<String, Scalar> = serde_json::from_slice(bytes)
            .context("parameters must be a flat JSON object of scalar values")?;
        Self::from_map(values)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to encode parameters")
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Raw lookup. An unknown name is a programming error and reported as such.
    pub fn get(&self, name: &str) -> Result<&Scalar> {
        self.values
            .get(name)
            .ok_or_else(|| anyhow!("unknown config parameter '{name}'"))
    }

    pub fn number(&self, name: &str) -> Result<f64> {
        let v = self.get(name)?;
        v.as_f64()
            .ok_or_else(|| anyhow!("{name}: expected a number, got {v}"))
    }

    /// Non-negative number of seconds (fractions allowed).
    pub fn seconds(&self, name: &str) -> Result<Duration> {
        let secs = self.number(name)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|_| anyhow!("{name}: {secs} is not a valid number of seconds"))
    }

    /// `HH:MM` or `HH:MM:SS`.
    pub fn time_of_day(&self, name: &str) -> Result<Time> {
        let v = self.get(name)?;
        let s = v
            .as_str()
            .ok_or_else(|| anyhow!("{name}: expected a time of day, got {v}"))?;
        parse_time_of_day(s).with_context(|| format!("{name}: invalid time of day {s:?}"))
    }

    pub fn scheme(&self) -> Result<WateringScheme> {
        let v = self.get(WATERING_SCHEME)?;
        v.as_str()
            .ok_or_else(|| anyhow!("{WATERING_SCHEME}: expected a string, got {v}"))?
            .parse()
    }

    /// Optional boolean; `default` when the key is absent.
    pub fn flag_or(&self, name: &str, default: bool) -> Result<bool> {
        match self.values.get(name) {
            None => Ok(default),
            Some(v) => v
                .as_bool()
                .ok_or_else(|| anyhow!("{name}: expected true/false, got {v}")),
        }
    }

    /// Check every required key, reporting all problems at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        for key in DURATION_KEYS {
            if let Err(e) = self.seconds(key) {
                errors.push(format!("{e:#}"));
            }
        }
        for key in TIME_OF_DAY_KEYS {
            if let Err(e) = self.time_of_day(key) {
                errors.push(format!("{e:#}"));
            }
        }
        match self.number(WATERING_THRESHOLD) {
            Ok(t) if !(0.0..=100.0).contains(&t) => {
                errors.push(format!("{WATERING_THRESHOLD}: {t} out of range [0, 100]"));
            }
            Ok(_) => {}
            Err(e) => errors.push(format!("{e:#}")),
        }
        if let Err(e) = self.scheme() {
            errors.push(format!("{e:#}"));
        }
        if let Err(e) = self.flag_or(WINDOW_WRAPS_MIDNIGHT, false) {
            errors.push(format!("{e:#}"));
        }
        match self.seconds(WATERING_DURATION) {
            Ok(d) if d >= MAX_WATERING_DURATION => {
                errors.push(format!(
                    "{WATERING_DURATION}: {}s must be shorter than {}s",
                    d.as_secs(),
                    MAX_WATERING_DURATION.as_secs()
                ));
            }
            _ => {}
        }
        match self.seconds(DEVICE_POLL_INTERVAL) {
            Ok(d) if d.is_zero() => {
                errors.push(format!("{DEVICE_POLL_INTERVAL} must be positive"));
            }
            _ => {}
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "parameter validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

pub fn parse_time_of_day(s: &str) -> Result<Time> {
    let s = s.trim();
    let hm = format_description!("[hour]:[minute]");
    let hms = format_description!("[hour]:[minute]:[second]");
    Time::parse(s, hm)
        .or_else(|_| Time::parse(s, hms))
        .map_err(|e| anyhow!("{e}"))
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

pub trait ConfigBackend: Send + Sync {
    fn load(&self) -> Result<Config>;
    fn save(&self, config: &Config) -> Result<()>;
}

/// JSON document on disk, rewritten wholesale on change.
pub struct JsonFile {
    path: PathBuf,
}

impl JsonFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl ConfigBackend for JsonFile {
    fn load(&self) -> Result<Config> {
        let path = self.path.display();
        let bytes = std::fs::read(&self.path)
            .with_context(|| format!("failed to read parameters: {path}"))?;
        Config::from_json(&bytes).with_context(|| format!("invalid parameters: {path}"))
    }

    fn save(&self, config: &Config) -> Result<()> {
        let path = self.path.display();
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, config.to_json_pretty()?)
            .with_context(|| format!("failed to write parameters: {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace parameters: {path}"))
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Cached parameter set shared by the device and cloud loops.
pub struct ConfigStore {
    backend: Box<dyn ConfigBackend>,
    current: RwLock<Arc<Config>>,
}

impl ConfigStore {
    /// Load the persisted parameters. Failing here is fatal for the process.
    pub fn load(backend: impl ConfigBackend + 'static) -> Result<Self> {
        let config = backend.load()?;
        info!(parameters = config.len(), "parameters loaded");
        Ok(Self {
            backend: Box::new(backend),
            current: RwLock::new(Arc::new(config)),
        })
    }

    /// The whole current parameter set; stays consistent for as long as the
    /// caller holds it.
    pub fn snapshot(&self) -> Arc<Config> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    pub fn get(&self, name: &str) -> Result<Scalar> {
        self.snapshot().get(name).cloned()
    }

    /// Swap in `new` if it differs from the cached set, persisting it first.
    /// Returns whether anything changed. Identical sets cause no I/O.
    pub fn replace(&self, new: Config) -> Result<bool> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if **current == new {
            debug!("received parameters identical to current, ignoring");
            return Ok(false);
        }

        self.backend.save(&new)?;
        info!(parameters = new.len(), "parameters changed and persisted");
        *current = Arc::new(new);
        Ok(true)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
