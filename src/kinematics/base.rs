//! State shared by every kinematics.

use core::fmt::{self, Write};

use super::{AxesBitmap, KinematicsType, SegmentationType, Z_AXIS};
use crate::config::{AxisLimitTable, AxisLimits, CommandParams, Millimetres};
use crate::error::{ConfigError, Result};
use crate::MAX_AXES;

/// Default segments per second for segmented kinematics.
pub const DEFAULT_SEGMENTS_PER_SECOND: f32 = 100.0;
/// Default minimum segment length in mm.
pub const DEFAULT_MIN_SEGMENT_LENGTH: f32 = 0.2;

const HOME_ALL_FILE: &str = "homeall.g";
const DEFAULT_AXIS_LETTERS: [char; MAX_AXES] = ['X', 'Y', 'Z', 'U', 'V', 'W', 'A', 'B', 'C', 'D'];

/// Segmentation settings, type tag, axis limits and axis naming.
#[derive(Debug, Clone, PartialEq)]
pub struct KinematicsBase {
    kinematics_type: KinematicsType,
    segmentation: SegmentationType,
    segments_per_second: f32,
    min_segment_length: f32,
    reciprocal_min_segment_length: f32,
    limits: AxisLimitTable,
    axis_letters: [char; MAX_AXES],
    home_z_with_probe: bool,
}

impl KinematicsBase {
    /// Create the shared state with default segmentation parameters.
    pub fn new(kinematics_type: KinematicsType, segmentation: SegmentationType) -> Self {
        Self {
            kinematics_type,
            segmentation,
            segments_per_second: DEFAULT_SEGMENTS_PER_SECOND,
            min_segment_length: DEFAULT_MIN_SEGMENT_LENGTH,
            reciprocal_min_segment_length: 1.0 / DEFAULT_MIN_SEGMENT_LENGTH,
            limits: AxisLimitTable::new(),
            axis_letters: DEFAULT_AXIS_LETTERS,
            home_z_with_probe: false,
        }
    }

    /// Carry limits, axis names and segmentation parameters over from another kinematics.
    ///
    /// The segmentation type stays the one this kinematics was built with.
    pub fn inherit(&mut self, other: &KinematicsBase) {
        self.limits = other.limits;
        self.axis_letters = other.axis_letters;
        self.home_z_with_probe = other.home_z_with_probe;
        self.segments_per_second = other.segments_per_second;
        self.min_segment_length = other.min_segment_length;
        self.reciprocal_min_segment_length = other.reciprocal_min_segment_length;
    }

    /// Type tag.
    #[inline]
    pub fn kinematics_type(&self) -> KinematicsType {
        self.kinematics_type
    }

    /// Current segmentation type.
    #[inline]
    pub fn segmentation(&self) -> SegmentationType {
        self.segmentation
    }

    /// Segments per second, when segmentation is enabled.
    pub fn segments_per_second(&self) -> Option<f32> {
        self.segmentation
            .use_segmentation
            .then_some(self.segments_per_second)
    }

    /// Minimum segment length, when segmentation is enabled.
    pub fn min_segment_length(&self) -> Option<f32> {
        self.segmentation
            .use_segmentation
            .then_some(self.min_segment_length)
    }

    /// Set segmentation parameters. Segmentation is on only when both are positive.
    pub fn set_segmentation(&mut self, segments_per_second: f32, min_segment_length: f32) {
        self.segments_per_second = segments_per_second;
        self.min_segment_length = min_segment_length;
        self.segmentation.use_segmentation = segments_per_second > 0.0 && min_segment_length > 0.0;
        if self.segmentation.use_segmentation {
            self.reciprocal_min_segment_length = 1.0 / min_segment_length;
        }
    }

    /// Number of segments for a move of `distance` mm lasting `duration` seconds.
    pub fn segment_count(&self, distance: f32, duration: f32) -> u32 {
        if !self.segmentation.use_segmentation {
            return 1;
        }
        let by_length = libm::floorf(distance * self.reciprocal_min_segment_length);
        let by_time = libm::ceilf(duration * self.segments_per_second);
        let count = by_length.min(by_time);
        if count.is_finite() && count > 1.0 {
            count as u32
        } else {
            1
        }
    }

    /// Axis limit table.
    #[inline]
    pub fn limits(&self) -> &AxisLimitTable {
        &self.limits
    }

    /// Replace the limits of one axis.
    pub fn set_axis_limits(&mut self, axis: usize, min: f32, max: f32) {
        self.limits
            .set(axis, AxisLimits::new(Millimetres(min), Millimetres(max)));
    }

    /// Letter of an axis, upper case.
    pub fn axis_letter(&self, axis: usize) -> char {
        self.axis_letters.get(axis).copied().unwrap_or('?')
    }

    /// Rename axes in drive order.
    pub fn set_axis_letters(&mut self, letters: impl IntoIterator<Item = char>) {
        for (slot, letter) in self.axis_letters.iter_mut().zip(letters) {
            *slot = letter.to_ascii_uppercase();
        }
    }

    /// Whether Z is homed with a probe.
    #[inline]
    pub fn home_z_with_probe(&self) -> bool {
        self.home_z_with_probe
    }

    /// Set whether Z is homed with a probe.
    pub fn set_home_z_with_probe(&mut self, value: bool) {
        self.home_z_with_probe = value;
    }

    /// Whether every axis of `axes` lies within its limits.
    pub fn within_limits(&self, coords: &[f32], axes: AxesBitmap) -> bool {
        axes.iter()
            .take_while(|&axis| axis < coords.len())
            .all(|axis| self.limits.get(axis).contains(coords[axis]))
    }

    /// Clamp axes from `first_axis` up to `num_visible_axes` that are in `axes`.
    ///
    /// Returns `true` when any coordinate changed.
    pub fn limit_position_from_axis(
        &self,
        coords: &mut [f32],
        first_axis: usize,
        num_visible_axes: usize,
        axes: AxesBitmap,
    ) -> bool {
        let end = num_visible_axes.min(coords.len());
        let mut limited = false;
        for axis in first_axis..end {
            if axes.is_set(axis) && self.limits.get(axis).clamp(&mut coords[axis]) {
                limited = true;
            }
        }
        limited
    }

    /// Read `S` and `T`. On success the parameters are applied and `seen` set.
    pub fn try_configure_segmentation(&mut self, params: &CommandParams<'_>, seen: &mut bool) -> Result<()> {
        let mut sps = self.segments_per_second;
        let mut min_length = self.min_segment_length;
        let mut found = false;
        params.try_get_f32('S', &mut sps, &mut found)?;
        params.try_get_f32('T', &mut min_length, &mut found)?;
        if !found {
            return Ok(());
        }
        if sps < 0.0 {
            return Err(ConfigError::InvalidParameter { letter: 'S', value: sps }.into());
        }
        if min_length < 0.0 {
            return Err(ConfigError::InvalidParameter {
                letter: 'T',
                value: min_length,
            }
            .into());
        }
        self.set_segmentation(sps, min_length);
        *seen = true;
        Ok(())
    }

    /// Handle M669 for kinematics without parameters of their own.
    pub fn configure(
        &mut self,
        code: u16,
        params: &CommandParams<'_>,
        reply: &mut dyn fmt::Write,
        name: &'static str,
    ) -> Result<bool> {
        if code != 669 {
            return Err(ConfigError::UnsupportedCommand { code, kinematics: name }.into());
        }
        let mut seen = false;
        self.try_configure_segmentation(params, &mut seen)?;
        if !seen && !params.seen('K') {
            let _ = self.write_description(reply, name);
        }
        Ok(seen)
    }

    /// Write "Kinematics is ..." with the segmentation settings.
    pub fn write_description(&self, reply: &mut dyn fmt::Write, name: &str) -> fmt::Result {
        write!(reply, "Kinematics is {}", name)?;
        if self.segmentation.use_segmentation {
            write!(
                reply,
                ", {} segments/sec, min. segment length {:.2}mm",
                self.segments_per_second as i32, self.min_segment_length
            )?;
        }
        Ok(())
    }

    /// Pick a homing file for axes homed one at a time.
    pub fn homing_file_name(
        &self,
        to_be_homed: AxesBitmap,
        already_homed: AxesBitmap,
        num_visible_axes: usize,
        home_first: AxesBitmap,
        filename: &mut heapless::String<32>,
    ) -> AxesBitmap {
        filename.clear();
        let all_axes = AxesBitmap::lowest_n(num_visible_axes);
        if to_be_homed.contains_all(all_axes) {
            let _ = filename.push_str(HOME_ALL_FILE);
            return AxesBitmap::new();
        }

        if self.home_z_with_probe && to_be_homed.is_set(Z_AXIS) && !already_homed.contains_all(home_first) {
            let needed = home_first & !already_homed;
            if !to_be_homed.contains_all(needed) || to_be_homed.lowest() == Some(Z_AXIS) {
                return needed;
            }
        }

        if let Some(axis) = to_be_homed.lowest() {
            let _ = write!(filename, "home{}.g", self.axis_letter(axis).to_ascii_lowercase());
        }
        AxesBitmap::new()
    }
}
