//! Axis and extruder drive configuration from TOML.

use serde::Deserialize;

use super::limits::AxisLimits;
use super::units::{Millimetres, Seconds};

/// Configuration of one motion axis and the drive that moves it.
#[derive(Debug, Clone, Deserialize)]
pub struct AxisConfig {
    /// Motor steps per mm of axis travel.
    pub steps_per_mm: f32,

    /// Minimum position in mm.
    #[serde(default = "default_min", rename = "min_mm")]
    pub min: Millimetres,

    /// Maximum position in mm.
    #[serde(default = "default_max", rename = "max_mm")]
    pub max: Millimetres,

    /// Invert direction pin logic.
    #[serde(default)]
    pub invert_direction: bool,
}

fn default_min() -> Millimetres {
    Millimetres(0.0)
}

fn default_max() -> Millimetres {
    Millimetres(200.0)
}

impl AxisConfig {
    /// Travel limits of this axis.
    pub fn limits(&self) -> AxisLimits {
        AxisLimits::new(self.min, self.max)
    }
}

/// Configuration of one extruder drive.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtruderConfig {
    /// Motor steps per mm of filament.
    pub steps_per_mm: f32,

    /// Pressure advance constant in seconds.
    #[serde(default, rename = "pressure_advance_s")]
    pub pressure_advance: Seconds,

    /// Invert direction pin logic.
    #[serde(default)]
    pub invert_direction: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_limits_from_config() {
        let config = AxisConfig {
            steps_per_mm: 80.0,
            min: Millimetres(-5.0),
            max: Millimetres(235.0),
            invert_direction: false,
        };

        let limits = config.limits();
        assert!(limits.is_valid());
        assert!(limits.contains(235.0));
        assert!(!limits.contains(-6.0));
    }
}
