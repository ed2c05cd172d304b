//! Simulated time
//!
//! Simulated time is a finite `f64` quantity with an optional unit tag.
//! The engine normalizes every time that enters the kernel into *ticks* of
//! the configured base unit; mixing dimensioned and dimensionless values
//! fails with [`SimError::UnitMismatch`](crate::SimError::UnitMismatch).

use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};

/// Unit tag for simulated time values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    /// Dimensionless time
    None,
    Seconds,
    Minutes,
    Hours,
}

impl TimeUnit {
    /// Seconds per unit; `None` carries no factor
    fn factor(self) -> Option<f64> {
        match self {
            TimeUnit::None => None,
            TimeUnit::Seconds => Some(1.0),
            TimeUnit::Minutes => Some(60.0),
            TimeUnit::Hours => Some(3600.0),
        }
    }
}

impl Default for TimeUnit {
    fn default() -> Self {
        TimeUnit::None
    }
}

impl std::fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TimeUnit::None => "none",
            TimeUnit::Seconds => "seconds",
            TimeUnit::Minutes => "minutes",
            TimeUnit::Hours => "hours",
        };
        write!(f, "{}", s)
    }
}

/// A simulated-time quantity
///
/// A value built with [`SimTime::new`] is a bare literal and adopts the
/// model's base unit wherever it is used. Values built with the unit
/// constructors ([`SimTime::seconds`] and friends) are dimensioned and are
/// converted into the base unit on entry into the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimTime {
    value: f64,
    /// `None` marks a bare literal that adopts the base unit
    unit: Option<TimeUnit>,
}

impl SimTime {
    /// A bare time literal in the model's base unit
    pub fn new(value: f64) -> Self {
        Self { value, unit: None }
    }

    /// Zero time, valid under any base unit
    pub fn zero() -> Self {
        Self::new(0.0)
    }

    /// An explicitly dimensionless time
    pub fn dimensionless(value: f64) -> Self {
        Self {
            value,
            unit: Some(TimeUnit::None),
        }
    }

    pub fn seconds(value: f64) -> Self {
        Self {
            value,
            unit: Some(TimeUnit::Seconds),
        }
    }

    pub fn minutes(value: f64) -> Self {
        Self {
            value,
            unit: Some(TimeUnit::Minutes),
        }
    }

    pub fn hours(value: f64) -> Self {
        Self {
            value,
            unit: Some(TimeUnit::Hours),
        }
    }

    /// Raw value as written, before any unit conversion
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Unit tag, or `None` for a bare literal
    pub fn unit(&self) -> Option<TimeUnit> {
        self.unit
    }

    /// Rebuild a time from kernel ticks in the given base unit
    pub(crate) fn from_ticks(ticks: f64, base: TimeUnit) -> Self {
        Self {
            value: ticks,
            unit: Some(base),
        }
    }

    /// Normalize into ticks of the base unit.
    ///
    /// Bare literals pass through unchanged. Dimensioned values convert
    /// between seconds/minutes/hours; a dimensioned value in a
    /// dimensionless model (or vice versa) is a unit mismatch. Non-finite
    /// values are rejected here so NaN can never reach the event queue.
    pub(crate) fn to_ticks(&self, base: TimeUnit) -> SimResult<f64> {
        if !self.value.is_finite() {
            return Err(SimError::InvalidRequest(format!(
                "non-finite time value {}",
                self.value
            )));
        }
        let unit = match self.unit {
            None => return Ok(self.value),
            Some(u) => u,
        };
        match (unit.factor(), base.factor()) {
            (None, None) => Ok(self.value),
            (Some(from), Some(to)) => Ok(self.value * from / to),
            (None, Some(_)) => Err(SimError::UnitMismatch(format!(
                "dimensionless time {} used in a model with base unit {}",
                self.value, base
            ))),
            (Some(_), None) => Err(SimError::UnitMismatch(format!(
                "dimensioned time {} {} used in a dimensionless model",
                self.value,
                unit
            ))),
        }
    }

    /// Checked addition in the context of a base unit
    pub fn checked_add(&self, other: &SimTime, base: TimeUnit) -> SimResult<SimTime> {
        Ok(SimTime::from_ticks(
            self.to_ticks(base)? + other.to_ticks(base)?,
            base,
        ))
    }

    /// Checked subtraction in the context of a base unit
    pub fn checked_sub(&self, other: &SimTime, base: TimeUnit) -> SimResult<SimTime> {
        Ok(SimTime::from_ticks(
            self.to_ticks(base)? - other.to_ticks(base)?,
            base,
        ))
    }
}

impl std::fmt::Display for SimTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.unit {
            Some(u) if u != TimeUnit::None => write!(f, "{} {}", self.value, u),
            _ => write!(f, "{}", self.value),
        }
    }
}
