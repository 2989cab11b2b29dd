//! Local wall-clock time for the light and watering windows.
//!
//! The UTC offset is looked up again on every reading, so daylight-saving
//! changes take effect without a restart.

use anyhow::{anyhow, Result};
use time::{OffsetDateTime, UtcOffset};
use tracing::{info, warn};

/// Maps an instant to the UTC offset in force at that instant.
pub trait ZoneRules: Send {
    fn offset_at(&self, utc: OffsetDateTime) -> Result<UtcOffset>;
}

/// Zone rules from the TZif database or a POSIX TZ string.
pub struct SystemZone(tz::TimeZone);

impl SystemZone {
    /// `TZ` if set, otherwise `/etc/localtime`.
    pub fn local() -> Result<Self> {
        tz::TimeZone::local()
            .map(Self)
            .map_err(|e| anyhow!("cannot load local time zone: {e}"))
    }

    /// e.g. `CET-1CEST,M3.5.0,M10.5.0/3`
    pub fn from_posix(rule: &str) -> Result<Self> {
        tz::TimeZone::from_posix_tz(rule)
            .map(Self)
            .map_err(|e| anyhow!("invalid TZ rule '{rule}': {e}"))
    }
}

impl ZoneRules for SystemZone {
    fn offset_at(&self, utc: OffsetDateTime) -> Result<UtcOffset> {
        let ty = self
            .0
            .find_local_time_type(utc.unix_timestamp())
            .map_err(|e| anyhow!("no local time type for {utc}: {e}"))?;
        UtcOffset::from_whole_seconds(ty.ut_offset()).map_err(|e| anyhow!("{e}"))
    }
}

/// Constant offset, no daylight saving.
pub struct FixedZone(pub UtcOffset);

impl ZoneRules for FixedZone {
    fn offset_at(&self, _utc: OffsetDateTime) -> Result<UtcOffset> {
        Ok(self.0)
    }
}

pub struct LocalClock {
    rules: Box<dyn ZoneRules>,
    offset: UtcOffset,
}

impl LocalClock {
    pub fn new(rules: impl ZoneRules + 'static) -> Self {
        let offset = rules
            .offset_at(OffsetDateTime::now_utc())
            .unwrap_or(UtcOffset::UTC);
        Self {
            rules: Box::new(rules),
            offset,
        }
    }

    /// System time zone, or UTC with a warning when it cannot be loaded.
    pub fn system() -> Self {
        match SystemZone::local() {
            Ok(zone) => Self::new(zone),
            Err(e) => {
                warn!("{e:#}, time windows use UTC");
                Self::fixed(UtcOffset::UTC)
            }
        }
    }

    pub fn fixed(offset: UtcOffset) -> Self {
        Self::new(FixedZone(offset))
    }

    /// Offset used for the most recent reading.
    pub fn offset(&self) -> UtcOffset {
        self.offset
    }

    pub fn now(&mut self) -> OffsetDateTime {
        self.at(OffsetDateTime::now_utc())
    }

    /// Convert `utc` to local time. A failed lookup keeps the last offset.
    pub fn at(&mut self, utc: OffsetDateTime) -> OffsetDateTime {
        match self.rules.offset_at(utc) {
            Ok(offset) if offset != self.offset => {
                info!(from = %self.offset, to = %offset, "local UTC offset changed");
                self.offset = offset;
            }
            Ok(_) => {}
            Err(e) => warn!(offset = %self.offset, "{e:#}, keeping previous offset"),
        }
        utc.to_offset(self.offset)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
