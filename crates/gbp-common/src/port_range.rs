//! Classifier port ranges
//!
//! A port range is written either as a single port (`"80"`) or as
//! `"min:max"` (`"1000:2000"`). Both bounds must lie in `1..=65535` and
//! `min` may not exceed `max`. An absent range means any port.

use crate::error::GbpError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lowest valid port
pub const MIN_PORT: u32 = 1;
/// Highest valid port
pub const MAX_PORT: u32 = 65535;

/// Inclusive port range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortRange {
    min: u16,
    max: u16,
}

impl PortRange {
    /// Build a range, validating bounds and order
    pub fn new(min: u32, max: u32) -> Result<Self, GbpError> {
        for port in [min, max] {
            if !(MIN_PORT..=MAX_PORT).contains(&port) {
                return Err(GbpError::InvalidPortRange(format!(
                    "port {} is outside {}-{}",
                    port, MIN_PORT, MAX_PORT
                )));
            }
        }
        if min > max {
            return Err(GbpError::InvalidPortRange(format!("{}:{} is reversed", min, max)));
        }
        Ok(Self { min: min as u16, max: max as u16 })
    }

    /// Single-port range
    pub fn single(port: u16) -> Result<Self, GbpError> {
        Self::new(port as u32, port as u32)
    }

    /// Lower bound
    pub fn min(&self) -> u16 {
        self.min
    }

    /// Upper bound
    pub fn max(&self) -> u16 {
        self.max
    }

    /// Split an optional range into the (min, max) pair used by access rules
    pub fn split(range: Option<&PortRange>) -> (Option<u16>, Option<u16>) {
        match range {
            Some(r) => (Some(r.min), Some(r.max)),
            None => (None, None),
        }
    }

    /// Join an access rule's (min, max) pair back into a range.
    /// A missing lower bound means any port; a missing upper bound means a
    /// single port.
    pub fn join(min: Option<u16>, max: Option<u16>) -> Result<Option<PortRange>, GbpError> {
        match (min, max) {
            (None, _) => Ok(None),
            (Some(min), None) => Self::single(min).map(Some),
            (Some(min), Some(max)) => Self::new(min as u32, max as u32).map(Some),
        }
    }
}

fn parse_port(raw: &str, input: &str) -> Result<u32, GbpError> {
    raw.trim()
        .parse::<u32>()
        .map_err(|_| GbpError::InvalidPortRange(format!("'{}' is not a port range", input)))
}

impl FromStr for PortRange {
    type Err = GbpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((min, max)) => Self::new(parse_port(min, s)?, parse_port(max, s)?),
            None => {
                let port = parse_port(s, s)?;
                Self::new(port, port)
            }
        }
    }
}

impl TryFrom<String> for PortRange {
    type Error = GbpError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PortRange> for String {
    fn from(value: PortRange) -> Self {
        value.to_string()
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min == self.max {
            write!(f, "{}", self.min)
        } else {
            write!(f, "{}:{}", self.min, self.max)
        }
    }
}
