//! Axis travel limits.

use serde::Deserialize;

use super::units::Millimetres;
use crate::MAX_AXES;

/// Tolerance applied when checking a coordinate against its limits, so that
/// positions recovered from motor steps are not rejected for rounding.
pub const AXIS_ROUNDING_ERROR: f32 = 0.02;

/// Travel limits of one axis (from configuration).
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct AxisLimits {
    /// Minimum allowed position in mm.
    #[serde(rename = "min_mm")]
    pub min: Millimetres,

    /// Maximum allowed position in mm.
    #[serde(rename = "max_mm")]
    pub max: Millimetres,
}

impl AxisLimits {
    /// Create new axis limits.
    pub const fn new(min: Millimetres, max: Millimetres) -> Self {
        Self { min, max }
    }

    /// Check if limits are valid (min < max).
    pub fn is_valid(&self) -> bool {
        self.min.0 < self.max.0
    }

    /// Check if a position is within limits, allowing for rounding.
    pub fn contains(&self, position: f32) -> bool {
        position >= self.min.0 - AXIS_ROUNDING_ERROR && position <= self.max.0 + AXIS_ROUNDING_ERROR
    }

    /// Clamp a position into the limits. Returns `true` if it was changed.
    pub fn clamp(&self, position: &mut f32) -> bool {
        if *position < self.min.0 {
            *position = self.min.0;
            true
        } else if *position > self.max.0 {
            *position = self.max.0;
            true
        } else {
            false
        }
    }
}

impl Default for AxisLimits {
    fn default() -> Self {
        Self::new(Millimetres(0.0), Millimetres(200.0))
    }
}

/// Limits for every axis slot, held by the kinematics at runtime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisLimitTable {
    limits: [AxisLimits; MAX_AXES],
}

impl AxisLimitTable {
    /// Create a table with the default limits on every axis.
    pub fn new() -> Self {
        Self {
            limits: [AxisLimits::default(); MAX_AXES],
        }
    }

    /// Limits of one axis.
    #[inline]
    pub fn get(&self, axis: usize) -> AxisLimits {
        self.limits.get(axis).copied().unwrap_or_default()
    }

    /// Replace the limits of one axis. Out of range axes are ignored.
    pub fn set(&mut self, axis: usize, limits: AxisLimits) {
        if let Some(slot) = self.limits.get_mut(axis) {
            *slot = limits;
        }
    }

    /// Minimum of an axis in mm.
    #[inline]
    pub fn min(&self, axis: usize) -> f32 {
        self.get(axis).min.0
    }

    /// Maximum of an axis in mm.
    #[inline]
    pub fn max(&self, axis: usize) -> f32 {
        self.get(axis).max.0
    }
}

impl Default for AxisLimitTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_limits_contains_with_rounding() {
        let limits = AxisLimits::new(Millimetres(-10.0), Millimetres(10.0));

        assert!(limits.contains(0.0));
        assert!(limits.contains(10.01));
        assert!(limits.contains(-10.01));
        assert!(!limits.contains(10.5));
    }

    #[test]
    fn test_axis_limits_clamp() {
        let limits = AxisLimits::new(Millimetres(0.0), Millimetres(100.0));

        let mut p = 150.0;
        assert!(limits.clamp(&mut p));
        assert_eq!(p, 100.0);

        let mut p = -5.0;
        assert!(limits.clamp(&mut p));
        assert_eq!(p, 0.0);

        let mut p = 42.0;
        assert!(!limits.clamp(&mut p));
        assert_eq!(p, 42.0);
    }

    #[test]
    fn test_limit_table_ignores_out_of_range_axis() {
        let mut table = AxisLimitTable::new();
        table.set(MAX_AXES + 3, AxisLimits::new(Millimetres(1.0), Millimetres(2.0)));
        table.set(2, AxisLimits::new(Millimetres(-1.0), Millimetres(250.0)));

        assert_eq!(table.min(2), -1.0);
        assert_eq!(table.max(2), 250.0);
        assert_eq!(table.max(0), 200.0);
    }
}
