//! Configuration module for drive-motion.
//!
//! Provides the machine description loaded from TOML files (with `std`
//! feature) or built in code, the derived per-drive table, and the
//! parameter-letter command parser used to reconfigure kinematics at runtime.

mod axis;
pub mod command;
mod drives;
mod kinematics;
mod limits;
mod machine;
pub mod units;
#[cfg(feature = "std")]
mod loader;
mod validation;

pub use axis::{AxisConfig, ExtruderConfig};
pub use command::{Command, CommandParams};
pub use drives::{DriveTable, MIN_CALC_INTERVAL_US};
pub use kinematics::{DeltaSection, KinematicsKind, KinematicsSection, RepropeSection};
pub use limits::{AxisLimitTable, AxisLimits, AXIS_ROUNDING_ERROR};
pub use machine::{MachineConfig, DEFAULT_STEP_CLOCK_HZ};
pub use validation::validate_config;

#[cfg(feature = "std")]
pub use loader::{load_config, parse_config};

// Re-export unit types at config level
pub use units::{Microsteps, Millimetres, Seconds, Steps};
