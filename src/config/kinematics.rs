//! Kinematics section of the machine configuration.

use serde::Deserialize;

use super::units::{Microsteps, Millimetres};

/// Which geometry the machine uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KinematicsKind {
    /// Independent X, Y and Z axes.
    #[default]
    Cartesian,
    /// Three-tower linear delta.
    LinearDelta,
    /// Eight-cable suspended robot.
    Reprope,
}

/// `[kinematics]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KinematicsSection {
    /// Geometry selector.
    #[serde(default)]
    pub kind: KinematicsKind,

    /// Segments per second for segmented moves.
    #[serde(default)]
    pub segments_per_second: Option<f32>,

    /// Minimum segment length for segmented moves.
    #[serde(default, rename = "min_segment_length_mm")]
    pub min_segment_length: Option<Millimetres>,

    /// Z is homed with a probe, so X and Y must be homed first.
    #[serde(default)]
    pub home_z_with_probe: bool,

    /// Linear delta geometry (required when `kind = "linear_delta"`).
    #[serde(default)]
    pub delta: Option<DeltaSection>,

    /// Reprope geometry; any omitted field keeps its default.
    #[serde(default)]
    pub reprope: Option<RepropeSection>,
}

/// `[kinematics.delta]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct DeltaSection {
    /// Diagonal rod length.
    #[serde(rename = "diagonal_mm")]
    pub diagonal: Millimetres,

    /// Horizontal distance from the centre to each tower.
    #[serde(rename = "radius_mm")]
    pub radius: Millimetres,

    /// Nozzle height when all carriages sit on their endstops.
    #[serde(rename = "homed_height_mm")]
    pub homed_height: Millimetres,

    /// Radius of the printable area.
    #[serde(rename = "print_radius_mm")]
    pub print_radius: Millimetres,

    /// Tower angle corrections in degrees.
    #[serde(default)]
    pub angle_corrections: [f32; 3],

    /// Endstop adjustments in mm.
    #[serde(default)]
    pub endstop_adjustments: [f32; 3],
}

/// `[kinematics.reprope]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepropeSection {
    /// Anchor coordinates A to H.
    #[serde(default)]
    pub anchors: Option<[[f32; 3]; 8]>,

    /// Radius of the printable area.
    #[serde(default, rename = "print_radius_mm")]
    pub print_radius: Option<Millimetres>,

    /// Spool radius growth per wound layer.
    #[serde(default)]
    pub spool_buildup_factor: Option<f32>,

    /// Empty spool radii in mm.
    #[serde(default)]
    pub spool_radii: Option<[f32; 8]>,

    /// Pulley mechanical advantage per line.
    #[serde(default)]
    pub mechanical_advantage: Option<[u32; 8]>,

    /// Lines wound on each spool.
    #[serde(default)]
    pub lines_per_spool: Option<[u32; 8]>,

    /// Motor gear teeth.
    #[serde(default)]
    pub motor_gear_teeth: Option<[u32; 8]>,

    /// Spool gear teeth.
    #[serde(default)]
    pub spool_gear_teeth: Option<[u32; 8]>,

    /// Full steps per motor revolution.
    #[serde(default)]
    pub full_steps_per_motor_rev: Option<[u32; 8]>,

    /// Driver microstepping per winch.
    #[serde(default)]
    pub microstepping: Option<[Microsteps; 8]>,
}
