//! Window lengths and window semantics.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::store::ExpireMode;

/// Named time units accepted in limit class configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of this time unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// A window length as written in configuration: a unit name or a number of
/// seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WindowSpec {
    Unit(TimeUnit),
    Seconds(u64),
}

impl WindowSpec {
    pub fn duration(&self) -> Duration {
        match self {
            WindowSpec::Unit(unit) => unit.duration(),
            WindowSpec::Seconds(secs) => Duration::from_secs(*secs),
        }
    }
}

impl From<TimeUnit> for WindowSpec {
    fn from(unit: TimeUnit) -> Self {
        WindowSpec::Unit(unit)
    }
}

/// How a counter's expiry moves as requests arrive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowMode {
    /// Every increment pushes the expiry a full window into the future. Under
    /// sustained traffic the counter never resets; it only clears after a
    /// full window of silence.
    #[default]
    Rolling,
    /// The expiry is set by the first increment and left alone afterwards, so
    /// the counter resets one window after the first request it saw.
    Fixed,
}

impl WindowMode {
    /// The expire mode to pair with each increment.
    pub fn expire_mode(&self) -> ExpireMode {
        match self {
            WindowMode::Rolling => ExpireMode::Always,
            WindowMode::Fixed => ExpireMode::IfUnset,
        }
    }
}
