//! Unit types for physical quantities.
//!
//! Type-safe wrappers for the lengths, times and step counts that appear in
//! configuration files.

use serde::Deserialize;

use crate::error::ConfigError;

/// Linear distance in millimetres.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Deserialize)]
#[serde(transparent)]
pub struct Millimetres(pub f32);

impl Millimetres {
    /// Create a new Millimetres value.
    #[inline]
    pub const fn new(value: f32) -> Self {
        Self(value)
    }

    /// Get the raw value.
    #[inline]
    pub const fn value(self) -> f32 {
        self.0
    }
}

/// Duration in seconds.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Deserialize)]
#[serde(transparent)]
pub struct Seconds(pub f32);

impl Seconds {
    /// Create a new Seconds value.
    #[inline]
    pub const fn new(value: f32) -> Self {
        Self(value)
    }

    /// Get the raw value.
    #[inline]
    pub const fn value(self) -> f32 {
        self.0
    }

    /// Convert to step clock ticks.
    #[inline]
    pub fn to_clocks(self, clock_hz: u32) -> f32 {
        self.0 * clock_hz as f32
    }
}

/// Motor position in steps (absolute from the machine origin).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Steps(pub i32);

impl Steps {
    /// Create a new Steps value.
    #[inline]
    pub const fn new(value: i32) -> Self {
        Self(value)
    }

    /// Get the raw value.
    #[inline]
    pub const fn value(self) -> i32 {
        self.0
    }

    /// Convert to millimetres using a steps per mm ratio.
    #[inline]
    pub fn to_mm(self, steps_per_mm: f32) -> Millimetres {
        Millimetres(self.0 as f32 / steps_per_mm)
    }

    /// Create from millimetres using a steps per mm ratio, rounding to nearest.
    #[inline]
    pub fn from_mm(mm: Millimetres, steps_per_mm: f32) -> Self {
        Self(libm::roundf(mm.0 * steps_per_mm) as i32)
    }
}

/// Microstep divisor (1, 2, 4, 8, 16, 32, 64, 128, 256).
///
/// Validated at construction to be a power of 2 within the valid range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Microsteps(u16);

impl Microsteps {
    /// Full step (no microstepping).
    pub const FULL: Self = Self(1);
    /// Eighth step.
    pub const EIGHTH: Self = Self(8);
    /// Sixteenth step.
    pub const SIXTEENTH: Self = Self(16);
    /// Thirty-second step.
    pub const THIRTY_SECOND: Self = Self(32);

    /// Valid microstep values.
    const VALID_VALUES: [u16; 9] = [1, 2, 4, 8, 16, 32, 64, 128, 256];

    /// Create a new Microsteps value with validation.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidParameter` if the value is not a valid power of 2.
    pub fn new(value: u16) -> Result<Self, ConfigError> {
        if Self::VALID_VALUES.contains(&value) {
            Ok(Self(value))
        } else {
            Err(ConfigError::InvalidParameter {
                letter: 'M',
                value: value as f32,
            })
        }
    }

    /// Get the raw divisor value.
    #[inline]
    pub const fn value(self) -> u16 {
        self.0
    }

    /// Number of bits to shift a microstep count by to get full steps.
    #[inline]
    pub const fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }
}

impl Default for Microsteps {
    fn default() -> Self {
        Self::SIXTEENTH
    }
}

impl TryFrom<u16> for Microsteps {
    type Error = ConfigError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl<'de> Deserialize<'de> for Microsteps {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use core::fmt::Write;
        let value = u16::deserialize(deserializer)?;
        Microsteps::new(value).map_err(|e| {
            let mut buf = heapless::String::<128>::new();
            let _ = write!(buf, "{}", e);
            serde::de::Error::custom(buf.as_str())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_microsteps_invalid_values() {
        assert!(Microsteps::new(0).is_err());
        assert!(Microsteps::new(3).is_err());
        assert!(Microsteps::new(512).is_err());
        assert_eq!(Microsteps::new(16).unwrap().shift(), 4);
    }

    #[test]
    fn test_steps_round_to_nearest() {
        assert_eq!(Steps::from_mm(Millimetres(1.006), 100.0), Steps(101));
        assert_eq!(Steps::from_mm(Millimetres(-1.006), 100.0), Steps(-101));
        assert!((Steps(250).to_mm(80.0).value() - 3.125).abs() < 1e-6);
    }

    #[test]
    fn test_seconds_to_clocks() {
        assert!((Seconds(0.05).to_clocks(1_000_000) - 50_000.0).abs() < 0.01);
    }
}
