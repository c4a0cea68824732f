//! Linear delta kinematics.
//!
//! Three vertical towers each carry a carriage joined to the effector by a
//! pair of diagonal rods. The carriage height over the effector is
//! `sqrt(L² - dx² - dy²)` where `dx, dy` is the horizontal offset from the
//! effector to the tower.

use core::fmt::{self, Write};

use super::{
    AxesBitmap, DeltaTower, DriveCoordinates, HomingMode, Kinematics, KinematicsBase,
    KinematicsType, LimitPositionResult, MotionType, SegmentationType, X_AXIS, XYZ_AXES, Y_AXIS,
    Z_AXIS,
};
use crate::config::{CommandParams, DeltaSection};
use crate::error::{ConfigError, Result};

const NUM_TOWERS: usize = 3;
const HOME_DELTA_FILE: &str = "homedelta.g";
const DEG_TO_RAD: f32 = core::f32::consts::PI / 180.0;

/// Raw delta geometry as configured by M665 and M666.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeltaGeometry {
    /// Diagonal rod length.
    pub diagonal: f32,
    /// Horizontal distance from the centre to each tower.
    pub radius: f32,
    /// Nozzle height when every carriage is on its endstop.
    pub homed_height: f32,
    /// Radius of the printable area.
    pub print_radius: f32,
    /// Tower angle corrections in degrees.
    pub angle_corrections: [f32; NUM_TOWERS],
    /// Endstop adjustments in mm.
    pub endstop_adjustments: [f32; NUM_TOWERS],
    /// Bed tilt along X, as a fraction.
    pub x_tilt: f32,
    /// Bed tilt along Y, as a fraction.
    pub y_tilt: f32,
}

impl Default for DeltaGeometry {
    fn default() -> Self {
        Self {
            diagonal: 215.0,
            radius: 105.6,
            homed_height: 240.0,
            print_radius: 80.0,
            angle_corrections: [0.0; NUM_TOWERS],
            endstop_adjustments: [0.0; NUM_TOWERS],
            x_tilt: 0.0,
            y_tilt: 0.0,
        }
    }
}

impl From<&DeltaSection> for DeltaGeometry {
    fn from(section: &DeltaSection) -> Self {
        Self {
            diagonal: section.diagonal.value(),
            radius: section.radius.value(),
            homed_height: section.homed_height.value(),
            print_radius: section.print_radius.value(),
            angle_corrections: section.angle_corrections,
            endstop_adjustments: section.endstop_adjustments,
            ..Self::default()
        }
    }
}

impl DeltaGeometry {
    /// Check that the geometry has a solution near the centre.
    pub fn validate(&self) -> Result<()> {
        if !(self.radius > 0.0) {
            return Err(invalid('R', self.radius));
        }
        if !(self.diagonal > self.radius) {
            return Err(invalid('L', self.diagonal));
        }
        if !(self.print_radius > 0.0) {
            return Err(invalid('B', self.print_radius));
        }
        Ok(())
    }
}

fn invalid(letter: char, value: f32) -> crate::Error {
    ConfigError::InvalidParameter { letter, value }.into()
}

/// Values recomputed whenever the geometry changes.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct DerivedGeometry {
    tower_x: [f32; NUM_TOWERS],
    tower_y: [f32; NUM_TOWERS],
    diagonal_squared: f32,
    print_radius_squared: f32,
    homed_carriage_heights: [f32; NUM_TOWERS],
}

impl DerivedGeometry {
    fn from_geometry(geometry: &DeltaGeometry) -> Self {
        let r = geometry.radius;
        let [ca, cb, cc] = geometry.angle_corrections.map(|deg| deg * DEG_TO_RAD);
        let thirty = 30.0 * DEG_TO_RAD;

        let tower_x = [
            -r * libm::cosf(thirty + ca),
            r * libm::cosf(thirty - cb),
            -r * libm::sinf(cc),
        ];
        let tower_y = [
            -r * libm::sinf(thirty + ca),
            -r * libm::sinf(thirty - cb),
            r * libm::cosf(cc),
        ];
        let diagonal_squared = geometry.diagonal * geometry.diagonal;

        let mut homed_carriage_heights = [0.0; NUM_TOWERS];
        for (tower, height) in homed_carriage_heights.iter_mut().enumerate() {
            let horizontal = tower_x[tower] * tower_x[tower] + tower_y[tower] * tower_y[tower];
            *height = geometry.homed_height
                + libm::sqrtf(diagonal_squared - horizontal)
                + geometry.endstop_adjustments[tower];
        }

        Self {
            tower_x,
            tower_y,
            diagonal_squared,
            print_radius_squared: geometry.print_radius * geometry.print_radius,
            homed_carriage_heights,
        }
    }
}

/// Three-tower linear delta.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearDeltaKinematics {
    base: KinematicsBase,
    geometry: DeltaGeometry,
    derived: DerivedGeometry,
}

impl LinearDeltaKinematics {
    /// Create a delta with the default geometry.
    pub fn new() -> Self {
        Self::with_geometry(DeltaGeometry::default())
    }

    /// Create a delta with the given geometry.
    pub fn with_geometry(geometry: DeltaGeometry) -> Self {
        let mut kin = Self {
            base: KinematicsBase::new(KinematicsType::LinearDelta, SegmentationType::default()),
            geometry,
            derived: DerivedGeometry::default(),
        };
        kin.recalc();
        kin
    }

    /// Current geometry.
    pub fn geometry(&self) -> &DeltaGeometry {
        &self.geometry
    }

    /// Replace the geometry after validating it.
    pub fn set_geometry(&mut self, geometry: DeltaGeometry) -> Result<()> {
        geometry.validate()?;
        self.geometry = geometry;
        self.recalc();
        Ok(())
    }

    /// Tower position in the XY plane.
    pub fn tower_position(&self, tower: usize) -> Option<(f32, f32)> {
        (tower < NUM_TOWERS).then(|| (self.derived.tower_x[tower], self.derived.tower_y[tower]))
    }

    /// Carriage height when the tower's endstop triggers.
    pub fn homed_carriage_height(&self, tower: usize) -> Option<f32> {
        self.derived.homed_carriage_heights.get(tower).copied()
    }

    fn recalc(&mut self) {
        self.derived = DerivedGeometry::from_geometry(&self.geometry);
        let z_min = self.base.limits().min(Z_AXIS);
        self.base.set_axis_limits(Z_AXIS, z_min, self.geometry.homed_height);
        debug!("delta geometry recalculated, diagonal {}", self.geometry.diagonal);
    }

    fn tilt_height(&self, x: f32, y: f32) -> f32 {
        self.geometry.x_tilt * x + self.geometry.y_tilt * y
    }

    /// Carriage height of one tower for an effector position.
    fn carriage_height(&self, tower: usize, x: f32, y: f32, z: f32) -> Option<f32> {
        let dx = x - self.derived.tower_x[tower];
        let dy = y - self.derived.tower_y[tower];
        let radicand = self.derived.diagonal_squared - dx * dx - dy * dy;
        if radicand < 0.0 {
            return None;
        }
        Some(z + self.tilt_height(x, y) + libm::sqrtf(radicand))
    }

    /// Effector position from the three carriage heights.
    fn forward_transform(&self, heights: [f32; NUM_TOWERS]) -> [f32; 3] {
        let tx = self.derived.tower_x.map(f64::from);
        let ty = self.derived.tower_y.map(f64::from);
        let h = heights.map(f64::from);
        let d2 = f64::from(self.derived.diagonal_squared);

        let sq = |i: usize| tx[i] * tx[i] + ty[i] * ty[i] + h[i] * h[i];

        // Subtracting sphere 0 from spheres 1 and 2 leaves two planes in x, y, z'
        let a1 = 2.0 * (tx[1] - tx[0]);
        let b1 = 2.0 * (ty[1] - ty[0]);
        let c1 = sq(1) - sq(0);
        let d1 = -2.0 * (h[1] - h[0]);
        let a2 = 2.0 * (tx[2] - tx[0]);
        let b2 = 2.0 * (ty[2] - ty[0]);
        let c2 = sq(2) - sq(0);
        let d2_ = -2.0 * (h[2] - h[0]);

        let det = a1 * b2 - a2 * b1;
        let px = (c1 * b2 - c2 * b1) / det;
        let bx = (d1 * b2 - d2_ * b1) / det;
        let py = (a1 * c2 - a2 * c1) / det;
        let by = (a1 * d2_ - a2 * d1) / det;

        let qx = px - tx[0];
        let qy = py - ty[0];
        let a = bx * bx + by * by + 1.0;
        let b = 2.0 * (qx * bx + qy * by - h[0]);
        let c = qx * qx + qy * qy + h[0] * h[0] - d2;
        let disc = (b * b - 4.0 * a * c).max(0.0);

        // The effector hangs below the carriages, so take the lower root
        let zt = (-b - libm::sqrt(disc)) / (2.0 * a);
        let x = (px + bx * zt) as f32;
        let y = (py + by * zt) as f32;
        [x, y, zt as f32 - self.tilt_height(x, y)]
    }

    fn configure_m665(&mut self, params: &CommandParams<'_>, reply: &mut dyn fmt::Write) -> Result<bool> {
        let mut staged = self.geometry;
        let mut seen = false;
        params.try_get_f32('L', &mut staged.diagonal, &mut seen)?;
        params.try_get_f32('R', &mut staged.radius, &mut seen)?;
        params.try_get_f32('H', &mut staged.homed_height, &mut seen)?;
        params.try_get_f32('B', &mut staged.print_radius, &mut seen)?;
        for (tower, letter) in ['X', 'Y', 'Z'].into_iter().enumerate() {
            params.try_get_f32(letter, &mut staged.angle_corrections[tower], &mut seen)?;
        }

        if !seen {
            let g = &self.geometry;
            let _ = write!(
                reply,
                "Diagonal {:.3}, delta radius {:.3}, homed height {:.3}, bed radius {:.1}, \
                 X {:.3}°, Y {:.3}°, Z {:.3}°",
                g.diagonal,
                g.radius,
                g.homed_height,
                g.print_radius,
                g.angle_corrections[0],
                g.angle_corrections[1],
                g.angle_corrections[2]
            );
            return Ok(false);
        }
        self.set_geometry(staged)?;
        Ok(true)
    }

    fn configure_m666(&mut self, params: &CommandParams<'_>, reply: &mut dyn fmt::Write) -> Result<bool> {
        let mut staged = self.geometry;
        let mut seen = false;
        for (tower, letter) in ['X', 'Y', 'Z'].into_iter().enumerate() {
            params.try_get_f32(letter, &mut staged.endstop_adjustments[tower], &mut seen)?;
        }
        let mut tilt = [staged.x_tilt * 100.0, staged.y_tilt * 100.0];
        params.try_get_f32('A', &mut tilt[0], &mut seen)?;
        params.try_get_f32('B', &mut tilt[1], &mut seen)?;

        if !seen {
            let g = &self.geometry;
            let _ = write!(
                reply,
                "Endstop adjustments X{:.2} Y{:.2} Z{:.2}, tilt X{:.3}% Y{:.3}%",
                g.endstop_adjustments[0],
                g.endstop_adjustments[1],
                g.endstop_adjustments[2],
                g.x_tilt * 100.0,
                g.y_tilt * 100.0
            );
            return Ok(false);
        }
        staged.x_tilt = tilt[0] / 100.0;
        staged.y_tilt = tilt[1] / 100.0;
        self.set_geometry(staged)?;
        Ok(true)
    }
}

impl Default for LinearDeltaKinematics {
    fn default() -> Self {
        Self::new()
    }
}

impl Kinematics for LinearDeltaKinematics {
    fn name(&self) -> &'static str {
        "Linear delta"
    }

    fn base(&self) -> &KinematicsBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut KinematicsBase {
        &mut self.base
    }

    fn configure(&mut self, code: u16, params: &CommandParams<'_>, reply: &mut dyn fmt::Write) -> Result<bool> {
        match code {
            665 => self.configure_m665(params, reply),
            666 => self.configure_m666(params, reply),
            _ => {
                let name = self.name();
                self.base.configure(code, params, reply, name)
            }
        }
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
        let (x, y, z) = (machine_pos[X_AXIS], machine_pos[Y_AXIS], machine_pos[Z_AXIS]);
        for tower in 0..NUM_TOWERS {
            match self.carriage_height(tower, x, y, z) {
                Some(height) => motor_pos[tower] = libm::roundf(height * steps_per_mm[tower]) as i32,
                None => return false,
            }
        }
        for axis in NUM_TOWERS..num_total_axes.min(machine_pos.len()) {
            motor_pos[axis] = libm::roundf(machine_pos[axis] * steps_per_mm[axis]) as i32;
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
        let heights = [0, 1, 2].map(|tower| motor_pos[tower] as f32 / steps_per_mm[tower]);
        let [x, y, z] = self.forward_transform(heights);
        machine_pos[X_AXIS] = x;
        machine_pos[Y_AXIS] = y;
        machine_pos[Z_AXIS] = z;
        for axis in NUM_TOWERS..num_total_axes.min(machine_pos.len()) {
            machine_pos[axis] = motor_pos[axis] as f32 / steps_per_mm[axis];
        }
    }

    fn is_reachable(&self, coords: &[f32], axes: AxesBitmap) -> bool {
        if axes.is_set(X_AXIS) && axes.is_set(Y_AXIS) {
            let r2 = coords[X_AXIS] * coords[X_AXIS] + coords[Y_AXIS] * coords[Y_AXIS];
            if r2 >= self.derived.print_radius_squared {
                return false;
            }
        }
        self.base.within_limits(coords, axes & !AxesBitmap::from_bits(0b011))
    }

    fn limit_position(
        &self,
        final_coords: &mut [f32],
        _initial_coords: Option<&[f32]>,
        num_visible_axes: usize,
        axes_to_limit: AxesBitmap,
        _is_coordinated: bool,
        apply_limits: bool,
    ) -> LimitPositionResult {
        if !apply_limits {
            return LimitPositionResult::Ok;
        }
        let mut limited = false;
        if axes_to_limit.contains_all(XYZ_AXES) {
            let r2 = final_coords[X_AXIS] * final_coords[X_AXIS] + final_coords[Y_AXIS] * final_coords[Y_AXIS];
            if r2 > self.derived.print_radius_squared {
                let factor = libm::sqrtf(self.derived.print_radius_squared / r2);
                final_coords[X_AXIS] *= factor;
                final_coords[Y_AXIS] *= factor;
                limited = true;
            }
            if self.base.limits().get(Z_AXIS).clamp(&mut final_coords[Z_AXIS]) {
                limited = true;
            }
        }
        if self
            .base
            .limit_position_from_axis(final_coords, Z_AXIS + 1, num_visible_axes, axes_to_limit)
        {
            limited = true;
        }

        if limited {
            LimitPositionResult::Adjusted
        } else {
            LimitPositionResult::Ok
        }
    }

    fn motion_type(&self, axis: usize) -> MotionType {
        if axis < NUM_TOWERS && !self.base.segmentation().use_segmentation {
            MotionType::SegmentFreeDelta
        } else {
            MotionType::Linear
        }
    }

    fn homing_mode(&self) -> HomingMode {
        HomingMode::HomeIndividualMotors
    }

    fn axes_assumed_homed(&self, g92_axes: AxesBitmap) -> AxesBitmap {
        if g92_axes.contains_all(XYZ_AXES) {
            g92_axes
        } else {
            g92_axes & !XYZ_AXES
        }
    }

    fn must_be_homed_axes(&self, axes_moving: AxesBitmap, disallow_moves_before_homing: bool) -> AxesBitmap {
        let mut axes = if disallow_moves_before_homing {
            axes_moving
        } else {
            AxesBitmap::new()
        };
        if axes_moving.intersects(XYZ_AXES) {
            axes |= XYZ_AXES;
        }
        axes
    }

    fn homing_file_name(
        &self,
        to_be_homed: AxesBitmap,
        already_homed: AxesBitmap,
        num_visible_axes: usize,
        filename: &mut heapless::String<32>,
    ) -> AxesBitmap {
        if to_be_homed.intersects(XYZ_AXES) {
            filename.clear();
            let _ = filename.push_str(HOME_DELTA_FILE);
            return AxesBitmap::new();
        }
        self.base.homing_file_name(
            to_be_homed,
            already_homed,
            num_visible_axes,
            self.axes_to_home_before_probing(),
            filename,
        )
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
        let spm = steps_per_mm.get(axis).copied().unwrap_or(0.0);
        if axis < NUM_TOWERS {
            if high_end {
                let height = self.derived.homed_carriage_heights[axis];
                target.set_drive_coordinate(axis, libm::roundf(height * spm) as i32);
            }
        } else {
            let limits = self.base.limits().get(axis);
            let position = if high_end { limits.max.0 } else { limits.min.0 };
            target.set_drive_coordinate(axis, libm::roundf(position * spm) as i32);
        }
    }

    fn axes_to_home_before_probing(&self) -> AxesBitmap {
        XYZ_AXES
    }

    fn linear_axes(&self) -> AxesBitmap {
        AxesBitmap::lowest_n(crate::MAX_AXES) & !XYZ_AXES
    }

    fn assumed_initial_position(&self, positions: &mut [f32]) {
        positions.iter_mut().for_each(|p| *p = 0.0);
        if let Some(z) = positions.get_mut(Z_AXIS) {
            *z = self.geometry.homed_height;
        }
    }

    fn write_calibration_parameters(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let g = &self.geometry;
        out.write_str("; Delta parameters\n")?;
        writeln!(
            out,
            "M665 L{:.3} R{:.3} H{:.3} B{:.1} X{:.3} Y{:.3} Z{:.3}",
            g.diagonal,
            g.radius,
            g.homed_height,
            g.print_radius,
            g.angle_corrections[0],
            g.angle_corrections[1],
            g.angle_corrections[2]
        )?;
        writeln!(
            out,
            "M666 X{:.3} Y{:.3} Z{:.3} A{:.2} B{:.2}",
            g.endstop_adjustments[0],
            g.endstop_adjustments[1],
            g.endstop_adjustments[2],
            g.x_tilt * 100.0,
            g.y_tilt * 100.0
        )
    }

    fn delta_tower(&self, axis: usize) -> Option<DeltaTower> {
        (axis < NUM_TOWERS).then(|| DeltaTower {
            x: self.derived.tower_x[axis],
            y: self.derived.tower_y[axis],
            diagonal_squared: self.derived.diagonal_squared,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPM: [f32; 4] = [80.0, 80.0, 80.0, 420.0];

    fn delta() -> LinearDeltaKinematics {
        LinearDeltaKinematics::with_geometry(DeltaGeometry {
            diagonal: 215.0,
            radius: 105.6,
            homed_height: 250.0,
            print_radius: 85.0,
            ..DeltaGeometry::default()
        })
    }

    #[test]
    fn test_centre_carriage_heights_are_equal() {
        let kin = delta();
        let mut motors = [0i32; 3];
        assert!(kin.cartesian_to_motor_steps(&[0.0, 0.0, 0.0], &SPM, 3, 3, &mut motors, true));

        let expected = libm::sqrtf(215.0 * 215.0 - 105.6 * 105.6) * 80.0;
        for m in motors {
            assert!((m as f32 - expected).abs() <= 1.0);
        }
    }

    #[test]
    fn test_round_trip() {
        let kin = delta();
        for p in [[0.0, 0.0, 0.0], [30.0, -20.0, 5.0], [-60.0, 40.0, 120.0]] {
            let mut motors = [0i32; 3];
            assert!(kin.cartesian_to_motor_steps(&p, &SPM, 3, 3, &mut motors, true));
            let mut back = [0.0f32; 3];
            kin.motor_steps_to_cartesian(&motors, &SPM, 3, 3, &mut back);
            for axis in 0..3 {
                assert!((back[axis] - p[axis]).abs() < 0.05, "axis {} {:?} vs {:?}", axis, back, p);
            }
        }
    }

    #[test]
    fn test_unreachable_transform_fails() {
        let kin = delta();
        let mut motors = [0i32; 3];
        assert!(!kin.cartesian_to_motor_steps(&[400.0, 0.0, 0.0], &SPM, 3, 3, &mut motors, true));
    }

    #[test]
    fn test_limit_position_scales_to_print_radius() {
        let kin = delta();
        let mut coords = [100.0, 100.0, 10.0];
        let result = kin.limit_position(&mut coords, None, 3, XYZ_AXES, true, true);

        assert_eq!(result, LimitPositionResult::Adjusted);
        let r = libm::sqrtf(coords[0] * coords[0] + coords[1] * coords[1]);
        assert!((r - 85.0).abs() < 1e-3);
        assert!(!kin.is_reachable(&[100.0, 0.0, 10.0], XYZ_AXES));
        assert!(kin.is_reachable(&[10.0, 0.0, 10.0], XYZ_AXES));
    }

    #[test]
    fn test_m665_echo_and_update() {
        let mut kin = delta();
        let before = kin.clone();
        let mut reply = heapless::String::<256>::new();

        assert!(!kin.configure(665, &CommandParams::new(), &mut reply).unwrap());
        assert!(reply.starts_with("Diagonal 215.000"));
        assert_eq!(kin, before);

        let params = CommandParams::parse("L220 H260").unwrap();
        assert!(kin.configure(665, &params, &mut reply).unwrap());
        assert_eq!(kin.geometry().diagonal, 220.0);
        assert_eq!(kin.base().limits().max(Z_AXIS), 260.0);
    }

    #[test]
    fn test_invalid_m665_leaves_geometry() {
        let mut kin = delta();
        let before = kin.clone();
        let mut reply = heapless::String::<256>::new();
        let params = CommandParams::parse("L50 R105").unwrap();

        assert!(kin.configure(665, &params, &mut reply).is_err());
        assert_eq!(kin, before);
    }

    #[test]
    fn test_calibration_round_trip() {
        let mut kin = delta();
        let mut reply = heapless::String::<256>::new();
        let params = CommandParams::parse("X0.5 Y-0.25 A1.5").unwrap();
        kin.configure(666, &params, &mut reply).unwrap();

        let mut saved = heapless::String::<256>::new();
        kin.write_calibration_parameters(&mut saved).unwrap();

        let mut restored = LinearDeltaKinematics::new();
        for line in saved.lines() {
            if let Some(cmd) = crate::config::Command::parse(line).unwrap() {
                restored.configure(cmd.code, &cmd.params, &mut reply).unwrap();
            }
        }
        assert_eq!(restored.geometry(), kin.geometry());
    }

    #[test]
    fn test_segment_free_until_segmented() {
        let mut kin = delta();
        assert_eq!(kin.motion_type(0), MotionType::SegmentFreeDelta);
        assert_eq!(kin.motion_type(3), MotionType::Linear);

        let mut reply = heapless::String::<64>::new();
        kin.configure(669, &CommandParams::parse("S100 T0.5").unwrap(), &mut reply)
            .unwrap();
        assert_eq!(kin.motion_type(0), MotionType::Linear);
    }

    #[test]
    fn test_homing() {
        let kin = delta();
        let mut name = heapless::String::<32>::new();
        kin.homing_file_name(AxesBitmap::from_axis(2), AxesBitmap::new(), 4, &mut name);
        assert_eq!(name.as_str(), "homedelta.g");

        assert_eq!(kin.must_be_homed_axes(AxesBitmap::from_axis(0), false), XYZ_AXES);
        assert_eq!(kin.homing_mode(), HomingMode::HomeIndividualMotors);
    }
}
