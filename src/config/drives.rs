//! Per-drive parameters derived from the machine configuration.

use super::machine::MachineConfig;
use super::units::{Millimetres, Seconds, Steps};
use crate::error::{ConfigError, Result};
use crate::{MAX_AXES, MAX_DRIVES, MAX_EXTRUDERS};

/// Smallest interval between full step-time calculations, in microseconds.
/// Faster drives are switched to double, quad or octal stepping.
pub const MIN_CALC_INTERVAL_US: u32 = 40;

/// Derived drive parameters computed once at initialization.
///
/// Axis `i` is driven by drive `i`; extruder `e` by drive `num_axes + e`.
#[derive(Debug, Clone, PartialEq)]
pub struct DriveTable {
    num_axes: usize,
    num_extruders: usize,
    steps_per_mm: [f32; MAX_DRIVES],
    inverted: [bool; MAX_DRIVES],
    /// Pressure advance per extruder in seconds.
    pressure_advance: [f32; MAX_EXTRUDERS],
    clock_hz: u32,
}

impl DriveTable {
    /// Build the drive table from a machine configuration.
    pub fn from_config(config: &MachineConfig) -> Result<Self> {
        let num_axes = config.axes.len();
        let num_extruders = config.extruders.len();
        if num_axes > MAX_AXES || num_extruders > MAX_EXTRUDERS || num_axes + num_extruders > MAX_DRIVES
        {
            return Err(ConfigError::TooManyDrives {
                requested: num_axes + num_extruders,
                capacity: MAX_DRIVES,
            }
            .into());
        }

        let mut table = Self::new(num_axes, num_extruders, config.step_clock_hz);
        for (i, (_, axis)) in config.axes.iter().enumerate() {
            table.steps_per_mm[i] = axis.steps_per_mm;
            table.inverted[i] = axis.invert_direction;
        }
        for (e, (_, extruder)) in config.extruders.iter().enumerate() {
            let drive = num_axes + e;
            table.steps_per_mm[drive] = extruder.steps_per_mm;
            table.inverted[drive] = extruder.invert_direction;
            table.pressure_advance[e] = extruder.pressure_advance.value();
        }
        Ok(table)
    }

    /// Create a table with 80 steps/mm on every drive.
    pub fn new(num_axes: usize, num_extruders: usize, clock_hz: u32) -> Self {
        Self {
            num_axes: num_axes.min(MAX_AXES),
            num_extruders: num_extruders.min(MAX_EXTRUDERS),
            steps_per_mm: [80.0; MAX_DRIVES],
            inverted: [false; MAX_DRIVES],
            pressure_advance: [0.0; MAX_EXTRUDERS],
            clock_hz,
        }
    }

    /// Number of visible axes.
    #[inline]
    pub fn num_axes(&self) -> usize {
        self.num_axes
    }

    /// Number of extruders.
    #[inline]
    pub fn num_extruders(&self) -> usize {
        self.num_extruders
    }

    /// Total number of drives in use.
    #[inline]
    pub fn num_drives(&self) -> usize {
        self.num_axes + self.num_extruders
    }

    /// Drive number of an extruder.
    #[inline]
    pub fn extruder_drive(&self, extruder: usize) -> usize {
        self.num_axes + extruder
    }

    /// Steps per mm of every drive slot.
    #[inline]
    pub fn steps_per_mm(&self) -> &[f32; MAX_DRIVES] {
        &self.steps_per_mm
    }

    /// Steps per mm of one drive.
    #[inline]
    pub fn drive_steps_per_mm(&self, drive: usize) -> f32 {
        self.steps_per_mm.get(drive).copied().unwrap_or(0.0)
    }

    /// Override the steps per mm of one drive.
    pub fn set_steps_per_mm(&mut self, drive: usize, value: f32) {
        if let Some(slot) = self.steps_per_mm.get_mut(drive) {
            *slot = value;
        }
    }

    /// Whether a drive's direction output is inverted.
    #[inline]
    pub fn is_inverted(&self, drive: usize) -> bool {
        self.inverted.get(drive).copied().unwrap_or(false)
    }

    /// Pressure advance of an extruder expressed in step clocks.
    #[inline]
    pub fn pressure_advance_clocks(&self, extruder: usize) -> f32 {
        Seconds(self.pressure_advance.get(extruder).copied().unwrap_or(0.0)).to_clocks(self.clock_hz)
    }

    /// Step clock frequency in Hz.
    #[inline]
    pub fn clock_hz(&self) -> u32 {
        self.clock_hz
    }

    /// Minimum full-calculation interval in step clocks.
    #[inline]
    pub fn min_calc_interval(&self) -> u32 {
        ((MIN_CALC_INTERVAL_US as u64 * self.clock_hz as u64) / 1_000_000) as u32
    }

    /// Convert millimetres to steps on one drive.
    #[inline]
    pub fn mm_to_steps(&self, drive: usize, mm: f32) -> Steps {
        Steps::from_mm(Millimetres(mm), self.drive_steps_per_mm(drive))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::axis::{AxisConfig, ExtruderConfig};
    use crate::config::units::Seconds;

    fn make_test_config() -> MachineConfig {
        let mut config = MachineConfig::default();
        for (name, spm) in [("x", 80.0), ("y", 80.0), ("z", 400.0)] {
            let axis = AxisConfig {
                steps_per_mm: spm,
                min: Millimetres(0.0),
                max: Millimetres(200.0),
                invert_direction: name == "y",
            };
            config
                .axes
                .insert(heapless::String::try_from(name).unwrap(), axis)
                .unwrap();
        }
        let extruder = ExtruderConfig {
            steps_per_mm: 420.0,
            pressure_advance: Seconds(0.05),
            invert_direction: false,
        };
        config
            .extruders
            .insert(heapless::String::try_from("e0").unwrap(), extruder)
            .unwrap();
        config
    }

    #[test]
    fn test_drive_numbering() {
        let table = DriveTable::from_config(&make_test_config()).unwrap();

        assert_eq!(table.num_axes(), 3);
        assert_eq!(table.num_drives(), 4);
        assert_eq!(table.extruder_drive(0), 3);
        assert_eq!(table.drive_steps_per_mm(2), 400.0);
        assert_eq!(table.drive_steps_per_mm(3), 420.0);
        assert!(table.is_inverted(1));
    }

    #[test]
    fn test_clock_derived_values() {
        let table = DriveTable::from_config(&make_test_config()).unwrap();

        // 40us at 1MHz
        assert_eq!(table.min_calc_interval(), 40);
        assert!((table.pressure_advance_clocks(0) - 50_000.0).abs() < 0.5);
        assert_eq!(table.mm_to_steps(0, 10.0), Steps(800));
    }
}
