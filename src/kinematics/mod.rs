//! Machine kinematics.
//!
//! A kinematics maps machine Cartesian coordinates to motor positions and
//! back, decides which axes the segment-free delta step law applies to,
//! enforces reachability, and tells a homing sequencer how homing proceeds.
//! Concrete geometries implement [`Kinematics`]; [`AnyKinematics`] is the
//! closed set this crate can build at configuration time.

mod any;
mod base;
mod cartesian;
mod linear_delta;
mod reprope;

use core::fmt;
use core::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

pub use any::AnyKinematics;
pub use base::KinematicsBase;
pub use cartesian::CartesianKinematics;
pub use linear_delta::{DeltaGeometry, LinearDeltaKinematics};
pub use reprope::{RepropeKinematics, RepropeParams, REPROPE_AXES};

use crate::config::CommandParams;
use crate::error::Result;

/// X axis index.
pub const X_AXIS: usize = 0;
/// Y axis index.
pub const Y_AXIS: usize = 1;
/// Z axis index.
pub const Z_AXIS: usize = 2;

/// Kinematics type numbers, matching the `K` parameter of M669.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum KinematicsType {
    /// Independent X, Y and Z axes.
    Cartesian = 0,
    /// CoreXY.
    CoreXY = 1,
    /// CoreXZ.
    CoreXZ = 2,
    /// Three-tower linear delta.
    LinearDelta = 3,
    /// SCARA arm.
    Scara = 4,
    /// CoreXYU.
    CoreXYU = 5,
    /// Four-cable hangprinter.
    Hangprinter = 6,
    /// Polar.
    Polar = 7,
    /// CoreXYUV.
    CoreXYUV = 8,
    /// Five-bar SCARA.
    FiveBarScara = 9,
    /// Rotary delta.
    RotaryDelta = 10,
    /// Markforged.
    MarkForged = 11,
    /// Collinear tripteron.
    CollinearTripteron = 12,
    /// Five-axis robot.
    Robot5Axis = 13,
    /// Eight-cable reprope.
    Reprope = 14,
}

impl KinematicsType {
    /// Look up a type by its `K` number.
    pub fn from_number(k: u32) -> Option<Self> {
        use KinematicsType::*;
        const ALL: [KinematicsType; 15] = [
            Cartesian,
            CoreXY,
            CoreXZ,
            LinearDelta,
            Scara,
            CoreXYU,
            Hangprinter,
            Polar,
            CoreXYUV,
            FiveBarScara,
            RotaryDelta,
            MarkForged,
            CollinearTripteron,
            Robot5Axis,
            Reprope,
        ];
        ALL.get(k as usize).copied()
    }

    /// The `K` number of this type.
    #[inline]
    pub fn number(self) -> u32 {
        self as u32
    }
}

/// Step law a drive uses for an axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MotionType {
    /// Motor position is linear in the distance moved.
    Linear,
    /// Closed-form delta tower law, no segmentation needed.
    SegmentFreeDelta,
}

/// How the machine is homed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HomingMode {
    /// Home Cartesian axes one by one.
    HomeCartesianAxes,
    /// Home each motor against its own endstop.
    HomeIndividualMotors,
    /// Motors are shared between axes.
    HomeSharedMotors,
}

/// Outcome of [`Kinematics::limit_position`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LimitPositionResult {
    /// Final and intermediate positions are reachable.
    Ok,
    /// The final position was limited.
    Adjusted,
    /// The final position is reachable but some intermediate ones are not.
    IntermediateUnreachable,
    /// The final position was limited and intermediate ones are still unreachable.
    AdjustedAndIntermediateUnreachable,
}

impl LimitPositionResult {
    /// Whether the final position was changed.
    #[inline]
    pub fn was_adjusted(self) -> bool {
        matches!(
            self,
            LimitPositionResult::Adjusted | LimitPositionResult::AdjustedAndIntermediateUnreachable
        )
    }
}

/// Which moves are split into short linear segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentationType {
    /// Segment regular moves.
    pub use_segmentation: bool,
    /// Segment moves that only change Z.
    pub use_z_segmentation: bool,
    /// Segment rapid (G0) moves.
    pub use_g0_segmentation: bool,
}

impl SegmentationType {
    /// Build a segmentation type.
    pub const fn new(use_segmentation: bool, use_z_segmentation: bool, use_g0_segmentation: bool) -> Self {
        Self {
            use_segmentation,
            use_z_segmentation,
            use_g0_segmentation,
        }
    }
}

/// Set of axis indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct AxesBitmap(u32);

/// X, Y and Z.
pub const XYZ_AXES: AxesBitmap = AxesBitmap(0b111);
/// X and Y.
pub const XY_AXES: AxesBitmap = AxesBitmap(0b011);

impl AxesBitmap {
    /// Empty set.
    pub const fn new() -> Self {
        Self(0)
    }

    /// Set from raw bits.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Set holding one axis.
    pub const fn from_axis(axis: usize) -> Self {
        if axis < 32 {
            Self(1 << axis)
        } else {
            Self(0)
        }
    }

    /// Set holding axes `0..n`.
    pub const fn lowest_n(n: usize) -> Self {
        if n >= 32 {
            Self(u32::MAX)
        } else {
            Self((1u32 << n) - 1)
        }
    }

    /// Raw bits.
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether `axis` is in the set.
    #[inline]
    pub const fn is_set(self, axis: usize) -> bool {
        axis < 32 && self.0 & (1 << axis) != 0
    }

    /// Add `axis`.
    #[inline]
    pub fn set(&mut self, axis: usize) {
        self.0 |= Self::from_axis(axis).0;
    }

    /// Remove `axis`.
    #[inline]
    pub fn clear(&mut self, axis: usize) {
        self.0 &= !Self::from_axis(axis).0;
    }

    /// Whether the set is empty.
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether the sets share an axis.
    #[inline]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Whether every axis of `other` is in this set.
    #[inline]
    pub const fn contains_all(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Lowest axis in the set.
    #[inline]
    pub fn lowest(self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }

    /// Iterate over axes in ascending order.
    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..32).filter(move |&axis| self.is_set(axis))
    }
}

impl BitOr for AxesBitmap {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for AxesBitmap {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for AxesBitmap {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl BitAndAssign for AxesBitmap {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl Not for AxesBitmap {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0)
    }
}

/// Geometry of one delta tower as seen by the delta step law.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeltaTower {
    /// Tower X position.
    pub x: f32,
    /// Tower Y position.
    pub y: f32,
    /// Diagonal rod length squared.
    pub diagonal_squared: f32,
}

/// Motor coordinates that homing can overwrite.
pub trait DriveCoordinates {
    /// Define the current position of `drive` in steps.
    fn set_drive_coordinate(&mut self, drive: usize, steps: i32);
}

/// Contract every machine geometry satisfies.
///
/// Position arrays are indexed by axis. `num_visible_axes` counts the axes a
/// user addresses; `num_total_axes` includes hidden axes such as the extra
/// winches of a cable robot.
pub trait Kinematics {
    /// Human readable name.
    fn name(&self) -> &'static str;

    /// Shared state.
    fn base(&self) -> &KinematicsBase;

    /// Shared state, mutable.
    fn base_mut(&mut self) -> &mut KinematicsBase;

    /// Type tag.
    fn kinematics_type(&self) -> KinematicsType {
        self.base().kinematics_type()
    }

    /// Apply an M665/M666/M669 command.
    ///
    /// Returns `Ok(true)` when the geometry changed. With no relevant
    /// parameters the current configuration is written to `reply` and nothing
    /// changes. On error nothing changes.
    fn configure(&mut self, code: u16, params: &CommandParams<'_>, reply: &mut dyn fmt::Write) -> Result<bool> {
        let name = self.name();
        self.base_mut().configure(code, params, reply, name)
    }

    /// Convert machine coordinates to motor steps.
    ///
    /// Returns `false` when the position has no motor solution; the caller
    /// must refuse the move.
    fn cartesian_to_motor_steps(
        &self,
        machine_pos: &[f32],
        steps_per_mm: &[f32],
        num_visible_axes: usize,
        num_total_axes: usize,
        motor_pos: &mut [i32],
        is_coordinated: bool,
    ) -> bool;

    /// Convert motor steps back to machine coordinates.
    fn motor_steps_to_cartesian(
        &self,
        motor_pos: &[i32],
        steps_per_mm: &[f32],
        num_visible_axes: usize,
        num_total_axes: usize,
        machine_pos: &mut [f32],
    );

    /// Whether the head can reach `coords` on the axes in `axes`.
    fn is_reachable(&self, coords: &[f32], axes: AxesBitmap) -> bool {
        self.base().within_limits(coords, axes)
    }

    /// Limit a target position to what the machine can reach.
    ///
    /// Intermediate points between `initial_coords` and `final_coords` are
    /// not checked.
    fn limit_position(
        &self,
        final_coords: &mut [f32],
        _initial_coords: Option<&[f32]>,
        num_visible_axes: usize,
        axes_to_limit: AxesBitmap,
        _is_coordinated: bool,
        apply_limits: bool,
    ) -> LimitPositionResult {
        if apply_limits && self.base().limit_position_from_axis(final_coords, 0, num_visible_axes, axes_to_limit) {
            LimitPositionResult::Adjusted
        } else {
            LimitPositionResult::Ok
        }
    }

    /// Step law to use for `axis`.
    fn motion_type(&self, _axis: usize) -> MotionType {
        MotionType::Linear
    }

    /// How the machine is homed.
    fn homing_mode(&self) -> HomingMode;

    /// Axes known after a G92 that set `g92_axes`.
    fn axes_assumed_homed(&self, g92_axes: AxesBitmap) -> AxesBitmap {
        g92_axes
    }

    /// Axes that must be homed before `axes_moving` may move.
    fn must_be_homed_axes(&self, axes_moving: AxesBitmap, disallow_moves_before_homing: bool) -> AxesBitmap {
        if disallow_moves_before_homing {
            axes_moving
        } else {
            AxesBitmap::new()
        }
    }

    /// Pick the homing file for a request.
    ///
    /// On success `filename` is set and an empty set returned; otherwise the
    /// returned axes must be homed first.
    fn homing_file_name(
        &self,
        to_be_homed: AxesBitmap,
        already_homed: AxesBitmap,
        num_visible_axes: usize,
        filename: &mut heapless::String<32>,
    ) -> AxesBitmap {
        self.base().homing_file_name(
            to_be_homed,
            already_homed,
            num_visible_axes,
            self.axes_to_home_before_probing(),
            filename,
        )
    }

    /// Whether an endstop on `axis` ends the whole homing move.
    fn query_terminate_homing_move(&self, axis: usize) -> bool;

    /// Define the position of the motor whose endstop triggered.
    fn on_homing_switch_triggered(
        &self,
        axis: usize,
        high_end: bool,
        steps_per_mm: &[f32],
        target: &mut dyn DriveCoordinates,
    );

    /// Axes that must be homed before probing the bed.
    fn axes_to_home_before_probing(&self) -> AxesBitmap {
        XY_AXES
    }

    /// Axes that move linearly with their motor.
    fn linear_axes(&self) -> AxesBitmap;

    /// Position assumed after switching to this kinematics.
    fn assumed_initial_position(&self, positions: &mut [f32]) {
        positions.iter_mut().for_each(|p| *p = 0.0);
    }

    /// Write calibration as commands `configure` accepts.
    fn write_calibration_parameters(&self, _out: &mut dyn fmt::Write) -> fmt::Result {
        Ok(())
    }

    /// Steps per mm this kinematics imposes on `drive`, if it owns them.
    fn derived_steps_per_unit(&self, _drive: usize) -> Option<f32> {
        None
    }

    /// Tower geometry for a segment-free delta drive.
    fn delta_tower(&self, _axis: usize) -> Option<DeltaTower> {
        None
    }

    /// Segments per second, when segmentation is enabled.
    fn segments_per_second(&self) -> Option<f32> {
        self.base().segments_per_second()
    }

    /// Minimum segment length, when segmentation is enabled.
    fn min_segment_length(&self) -> Option<f32> {
        self.base().min_segment_length()
    }

    /// Number of segments for a move of `distance` mm taking `duration` seconds.
    fn segment_count(&self, distance: f32, duration: f32) -> u32 {
        self.base().segment_count(distance, duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinematics_numbers() {
        assert_eq!(KinematicsType::from_number(0), Some(KinematicsType::Cartesian));
        assert_eq!(KinematicsType::from_number(3), Some(KinematicsType::LinearDelta));
        assert_eq!(KinematicsType::from_number(14), Some(KinematicsType::Reprope));
        assert_eq!(KinematicsType::from_number(15), None);
        assert_eq!(KinematicsType::Reprope.number(), 14);
    }

    #[test]
    fn test_axes_bitmap() {
        let mut axes = AxesBitmap::lowest_n(3);
        assert_eq!(axes, XYZ_AXES);
        assert!(axes.contains_all(XY_AXES));

        axes.clear(0);
        assert_eq!(axes.lowest(), Some(1));
        axes.set(5);
        assert_eq!(axes.iter().collect::<heapless::Vec<usize, 8>>().as_slice(), &[1, 2, 5]);
        assert!(!(axes & !XYZ_AXES).is_empty());
        assert!(AxesBitmap::new().lowest().is_none());
    }
}
