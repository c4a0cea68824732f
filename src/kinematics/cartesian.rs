//! Cartesian kinematics: each axis is driven by its own motor.

use super::{
    AxesBitmap, DriveCoordinates, HomingMode, Kinematics, KinematicsBase, KinematicsType,
    SegmentationType,
};

/// Independent axes with one motor per axis.
#[derive(Debug, Clone, PartialEq)]
pub struct CartesianKinematics {
    base: KinematicsBase,
}

impl CartesianKinematics {
    /// Create Cartesian kinematics with default limits.
    pub fn new() -> Self {
        Self {
            base: KinematicsBase::new(KinematicsType::Cartesian, SegmentationType::default()),
        }
    }
}

impl Default for CartesianKinematics {
    fn default() -> Self {
        Self::new()
    }
}

impl Kinematics for CartesianKinematics {
    fn name(&self) -> &'static str {
        "Cartesian"
    }

    fn base(&self) -> &KinematicsBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut KinematicsBase {
        &mut self.base
    }

    fn cartesian_to_motor_steps(
        &self,
        machine_pos: &[f32],
        steps_per_mm: &[f32],
        _num_visible_axes: usize,
        num_total_axes: usize,
        motor_pos: &mut [i32],
        _is_coordinated: bool,
    ) -> bool {
        for ((motor, pos), spm) in motor_pos
            .iter_mut()
            .zip(machine_pos)
            .zip(steps_per_mm)
            .take(num_total_axes)
        {
            *motor = libm::roundf(pos * spm) as i32;
        }
        true
    }

    fn motor_steps_to_cartesian(
        &self,
        motor_pos: &[i32],
        steps_per_mm: &[f32],
        _num_visible_axes: usize,
        num_total_axes: usize,
        machine_pos: &mut [f32],
    ) {
        for ((pos, motor), spm) in machine_pos
            .iter_mut()
            .zip(motor_pos)
            .zip(steps_per_mm)
            .take(num_total_axes)
        {
            *pos = *motor as f32 / spm;
        }
    }

    fn homing_mode(&self) -> HomingMode {
        HomingMode::HomeCartesianAxes
    }

    fn query_terminate_homing_move(&self, _axis: usize) -> bool {
        false
    }

    fn on_homing_switch_triggered(
        &self,
        axis: usize,
        high_end: bool,
        steps_per_mm: &[f32],
        target: &mut dyn DriveCoordinates,
    ) {
        let limits = self.base.limits().get(axis);
        let position = if high_end { limits.max.0 } else { limits.min.0 };
        let spm = steps_per_mm.get(axis).copied().unwrap_or(0.0);
        target.set_drive_coordinate(axis, libm::roundf(position * spm) as i32);
    }

    fn linear_axes(&self) -> AxesBitmap {
        AxesBitmap::lowest_n(crate::MAX_AXES)
    }
}
