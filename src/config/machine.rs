//! Machine configuration - root configuration structure.

use heapless::{FnvIndexMap, String};
use serde::Deserialize;

use super::axis::{AxisConfig, ExtruderConfig};
use super::kinematics::KinematicsSection;

/// Default step clock: 1 MHz.
pub const DEFAULT_STEP_CLOCK_HZ: u32 = 1_000_000;

/// Root configuration structure from TOML.
///
/// Axes are assigned drive numbers in the order they appear in the file,
/// followed by the extruders in file order.
#[derive(Debug, Clone, Deserialize)]
pub struct MachineConfig {
    /// Step timer frequency in Hz.
    #[serde(default = "default_step_clock")]
    pub step_clock_hz: u32,

    /// Kinematics selection and geometry.
    #[serde(default)]
    pub kinematics: KinematicsSection,

    /// Axes keyed by their letter.
    pub axes: FnvIndexMap<String<8>, AxisConfig, 16>,

    /// Extruders keyed by name.
    #[serde(default)]
    pub extruders: FnvIndexMap<String<8>, ExtruderConfig, 8>,
}

fn default_step_clock() -> u32 {
    DEFAULT_STEP_CLOCK_HZ
}

impl MachineConfig {
    /// Get an axis configuration by key.
    pub fn axis(&self, name: &str) -> Option<&AxisConfig> {
        self.axes
            .iter()
            .find(|(k, _)| k.as_str().eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Get an extruder configuration by key.
    pub fn extruder(&self, name: &str) -> Option<&ExtruderConfig> {
        self.extruders
            .iter()
            .find(|(k, _)| k.as_str() == name)
            .map(|(_, v)| v)
    }

    /// Number of visible axes.
    pub fn num_axes(&self) -> usize {
        self.axes.len()
    }

    /// Number of drives (axes plus extruders).
    pub fn num_drives(&self) -> usize {
        self.axes.len() + self.extruders.len()
    }

    /// Axis letters in drive order, upper case.
    pub fn axis_letters(&self) -> impl Iterator<Item = char> + '_ {
        self.axes
            .keys()
            .map(|k| k.chars().next().unwrap_or('?').to_ascii_uppercase())
    }

    /// List all axis keys.
    pub fn axis_names(&self) -> impl Iterator<Item = &str> {
        self.axes.keys().map(|s| s.as_str())
    }
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            step_clock_hz: DEFAULT_STEP_CLOCK_HZ,
            kinematics: KinematicsSection::default(),
            axes: FnvIndexMap::new(),
            extruders: FnvIndexMap::new(),
        }
    }
}
