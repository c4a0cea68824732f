//! Closed set of kinematics selectable at configuration time.

use core::fmt;

use super::{
    AxesBitmap, CartesianKinematics, DeltaTower, DriveCoordinates, HomingMode, Kinematics,
    KinematicsBase, KinematicsType, LimitPositionResult, LinearDeltaKinematics, MotionType,
    RepropeKinematics,
};
use super::linear_delta::DeltaGeometry;
use super::reprope::RepropeParams;
use crate::config::{CommandParams, KinematicsKind, MachineConfig};
use crate::error::{ConfigError, Result};

/// Any kinematics this crate can build.
#[derive(Debug, Clone, PartialEq)]
pub enum AnyKinematics {
    /// Cartesian.
    Cartesian(CartesianKinematics),
    /// Linear delta.
    LinearDelta(LinearDeltaKinematics),
    /// Eight-line reprope.
    Reprope(RepropeKinematics),
}

macro_rules! dispatch {
    ($self:expr, $k:ident => $body:expr) => {
        match $self {
            AnyKinematics::Cartesian($k) => $body,
            AnyKinematics::LinearDelta($k) => $body,
            AnyKinematics::Reprope($k) => $body,
        }
    };
}

impl AnyKinematics {
    /// Build a kinematics of `kinematics_type` with default geometry,
    /// carrying over limits and axis names from `base`.
    pub fn create(kinematics_type: KinematicsType, base: &KinematicsBase) -> Result<Self> {
        let mut kin = match kinematics_type {
            KinematicsType::Cartesian => AnyKinematics::Cartesian(CartesianKinematics::new()),
            KinematicsType::LinearDelta => AnyKinematics::LinearDelta(LinearDeltaKinematics::new()),
            KinematicsType::Reprope => AnyKinematics::Reprope(RepropeKinematics::new()),
            other => {
                error!("kinematics type {} is not built in", other.number());
                return Err(ConfigError::UnsupportedKinematics(other.number()).into());
            }
        };
        kin.base_mut().inherit(base);
        if let AnyKinematics::LinearDelta(delta) = &mut kin {
            // Homed height owns the Z maximum
            let geometry = *delta.geometry();
            delta.set_geometry(geometry)?;
        }
        Ok(kin)
    }

    /// Build the kinematics described by a machine configuration.
    pub fn from_config(config: &MachineConfig) -> Result<Self> {
        let section = &config.kinematics;
        let mut base = KinematicsBase::new(KinematicsType::Cartesian, Default::default());
        base.set_axis_letters(config.axis_letters());
        for (axis, (_, axis_config)) in config.axes.iter().enumerate() {
            let limits = axis_config.limits();
            base.set_axis_limits(axis, limits.min.value(), limits.max.value());
        }
        base.set_home_z_with_probe(section.home_z_with_probe);

        let kinematics_type = match section.kind {
            KinematicsKind::Cartesian => KinematicsType::Cartesian,
            KinematicsKind::LinearDelta => KinematicsType::LinearDelta,
            KinematicsKind::Reprope => KinematicsType::Reprope,
        };
        let mut kin = Self::create(kinematics_type, &base)?;

        match &mut kin {
            AnyKinematics::Cartesian(_) => {}
            AnyKinematics::LinearDelta(delta) => {
                if let Some(geometry) = &section.delta {
                    delta.set_geometry(DeltaGeometry::from(geometry))?;
                }
            }
            AnyKinematics::Reprope(reprope) => {
                if let Some(reprope_section) = &section.reprope {
                    let mut params = RepropeParams::default();
                    params.apply_section(reprope_section);
                    reprope.set_params(params)?;
                }
            }
        }

        if section.segments_per_second.is_some() || section.min_segment_length.is_some() {
            let kin_base = kin.base_mut();
            let sps = section
                .segments_per_second
                .or(kin_base.segments_per_second())
                .unwrap_or(super::base::DEFAULT_SEGMENTS_PER_SECOND);
            let min_length = section
                .min_segment_length
                .map(|l| l.value())
                .or(kin_base.min_segment_length())
                .unwrap_or(super::base::DEFAULT_MIN_SEGMENT_LENGTH);
            kin_base.set_segmentation(sps, min_length);
        }

        info!("kinematics {} ready", kin.kinematics_type().number());
        Ok(kin)
    }

    /// The underlying kinematics as a trait object.
    pub fn as_dyn(&self) -> &dyn Kinematics {
        dispatch!(self, k => k as &dyn Kinematics)
    }
}

impl Default for AnyKinematics {
    fn default() -> Self {
        AnyKinematics::Cartesian(CartesianKinematics::new())
    }
}

impl Kinematics for AnyKinematics {
    fn name(&self) -> &'static str {
        dispatch!(self, k => k.name())
    }

    fn base(&self) -> &KinematicsBase {
        dispatch!(self, k => k.base())
    }

    fn base_mut(&mut self) -> &mut KinematicsBase {
        dispatch!(self, k => k.base_mut())
    }

    fn configure(&mut self, code: u16, params: &CommandParams<'_>, reply: &mut dyn fmt::Write) -> Result<bool> {
        dispatch!(self, k => k.configure(code, params, reply))
    }

    fn cartesian_to_motor_steps(
        &self,
        machine_pos: &[f32],
        steps_per_mm: &[f32],
        num_visible_axes: usize,
        num_total_axes: usize,
        motor_pos: &mut [i32],
        is_coordinated: bool,
    ) -> bool {
        dispatch!(self, k => k.cartesian_to_motor_steps(
            machine_pos,
            steps_per_mm,
            num_visible_axes,
            num_total_axes,
            motor_pos,
            is_coordinated,
        ))
    }

    fn motor_steps_to_cartesian(
        &self,
        motor_pos: &[i32],
        steps_per_mm: &[f32],
        num_visible_axes: usize,
        num_total_axes: usize,
        machine_pos: &mut [f32],
    ) {
        dispatch!(self, k => k.motor_steps_to_cartesian(
            motor_pos,
            steps_per_mm,
            num_visible_axes,
            num_total_axes,
            machine_pos,
        ))
    }

    fn is_reachable(&self, coords: &[f32], axes: AxesBitmap) -> bool {
        dispatch!(self, k => k.is_reachable(coords, axes))
    }

    fn limit_position(
        &self,
        final_coords: &mut [f32],
        initial_coords: Option<&[f32]>,
        num_visible_axes: usize,
        axes_to_limit: AxesBitmap,
        is_coordinated: bool,
        apply_limits: bool,
    ) -> LimitPositionResult {
        dispatch!(self, k => k.limit_position(
            final_coords,
            initial_coords,
            num_visible_axes,
            axes_to_limit,
            is_coordinated,
            apply_limits,
        ))
    }

    fn motion_type(&self, axis: usize) -> MotionType {
        dispatch!(self, k => k.motion_type(axis))
    }

    fn homing_mode(&self) -> HomingMode {
        dispatch!(self, k => k.homing_mode())
    }

    fn axes_assumed_homed(&self, g92_axes: AxesBitmap) -> AxesBitmap {
        dispatch!(self, k => k.axes_assumed_homed(g92_axes))
    }

    fn must_be_homed_axes(&self, axes_moving: AxesBitmap, disallow_moves_before_homing: bool) -> AxesBitmap {
        dispatch!(self, k => k.must_be_homed_axes(axes_moving, disallow_moves_before_homing))
    }

    fn homing_file_name(
        &self,
        to_be_homed: AxesBitmap,
        already_homed: AxesBitmap,
        num_visible_axes: usize,
        filename: &mut heapless::String<32>,
    ) -> AxesBitmap {
        dispatch!(self, k => k.homing_file_name(to_be_homed, already_homed, num_visible_axes, filename))
    }

    fn query_terminate_homing_move(&self, axis: usize) -> bool {
        dispatch!(self, k => k.query_terminate_homing_move(axis))
    }

    fn on_homing_switch_triggered(
        &self,
        axis: usize,
        high_end: bool,
        steps_per_mm: &[f32],
        target: &mut dyn DriveCoordinates,
    ) {
        dispatch!(self, k => k.on_homing_switch_triggered(axis, high_end, steps_per_mm, target))
    }

    fn axes_to_home_before_probing(&self) -> AxesBitmap {
        dispatch!(self, k => k.axes_to_home_before_probing())
    }

    fn linear_axes(&self) -> AxesBitmap {
        dispatch!(self, k => k.linear_axes())
    }

    fn assumed_initial_position(&self, positions: &mut [f32]) {
        dispatch!(self, k => k.assumed_initial_position(positions))
    }

    fn write_calibration_parameters(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        dispatch!(self, k => k.write_calibration_parameters(out))
    }

    fn derived_steps_per_unit(&self, drive: usize) -> Option<f32> {
        dispatch!(self, k => k.derived_steps_per_unit(drive))
    }

    fn delta_tower(&self, axis: usize) -> Option<DeltaTower> {
        dispatch!(self, k => k.delta_tower(axis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    #[test]
    fn test_create_unsupported_type() {
        let base = KinematicsBase::new(KinematicsType::Cartesian, Default::default());
        assert!(matches!(
            AnyKinematics::create(KinematicsType::Scara, &base),
            Err(crate::Error::Config(ConfigError::UnsupportedKinematics(4)))
        ));
    }

    #[test]
    fn test_switch_keeps_limits() {
        let mut base = KinematicsBase::new(KinematicsType::Cartesian, Default::default());
        base.set_axis_limits(0, -50.0, 50.0);
        let kin = AnyKinematics::create(KinematicsType::Reprope, &base).unwrap();

        assert_eq!(kin.name(), "Reprope");
        assert_eq!(kin.base().limits().max(0), 50.0);
        assert_eq!(kin.segments_per_second(), Some(100.0));
    }

    #[test]
    fn test_from_config_reprope_overrides() {
        let config = parse_config(
            r#"
[kinematics]
kind = "reprope"
segments_per_second = 50.0

[kinematics.reprope]
print_radius_mm = 1000.0
spool_radii = [20.0, 20.0, 20.0, 20.0, 20.0, 20.0, 20.0, 20.0]

[axes.x]
steps_per_mm = 100.0
min_mm = -150.0
max_mm = 150.0
[axes.y]
steps_per_mm = 100.0
[axes.z]
steps_per_mm = 100.0
"#,
        )
        .unwrap();
        let kin = AnyKinematics::from_config(&config).unwrap();

        match &kin {
            AnyKinematics::Reprope(reprope) => {
                assert_eq!(reprope.params().print_radius, 1000.0);
                assert_eq!(reprope.params().spool_radii[3], 20.0);
            }
            other => panic!("unexpected kinematics {:?}", other),
        }
        assert_eq!(kin.segments_per_second(), Some(50.0));
        assert_eq!(kin.min_segment_length(), Some(0.2));
        assert_eq!(kin.base().limits().min(0), -150.0);
    }
}
