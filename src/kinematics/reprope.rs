//! Reprope kinematics: an effector hung from eight winch lines.
//!
//! Each drive winds one line onto a spool. Line buildup on the spool changes
//! the effective radius, so motor steps are a square-root function of line
//! length rather than a linear one.

use core::fmt::{self, Write};

use super::{
    AxesBitmap, DriveCoordinates, HomingMode, Kinematics, KinematicsBase, KinematicsType,
    LimitPositionResult, SegmentationType, X_AXIS, XYZ_AXES, Y_AXIS, Z_AXIS,
};
use crate::config::{CommandParams, Microsteps, RepropeSection};
use crate::error::{ConfigError, Result};

/// Number of winch lines.
pub const REPROPE_AXES: usize = 8;

const A: usize = 0;
const B: usize = 1;
const C: usize = 2;
const D: usize = 3;

const ANCHOR_LETTERS: [char; REPROPE_AXES] = ['A', 'B', 'C', 'D', 'E', 'F', 'G', 'H'];
const HOME_ALL_FILE: &str = "homeall.g";

const DEFAULT_ANCHOR_Z: f32 = 260.0;
const DEFAULT_ANCHORS: [[f32; 3]; REPROPE_AXES] = [
    [-115.0, 74.0, DEFAULT_ANCHOR_Z],
    [-74.0, 115.0, DEFAULT_ANCHOR_Z],
    [74.0, 115.0, DEFAULT_ANCHOR_Z],
    [115.0, 74.0, DEFAULT_ANCHOR_Z],
    [115.0, -74.0, DEFAULT_ANCHOR_Z],
    [74.0, -115.0, DEFAULT_ANCHOR_Z],
    [-74.0, -115.0, DEFAULT_ANCHOR_Z],
    [-115.0, -74.0, DEFAULT_ANCHOR_Z],
];

type Vec3 = [f64; 3];
type Mat3 = [[f64; 3]; 3];

/// Raw reprope parameters as configured by M669 and M666.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RepropeParams {
    /// Anchor coordinates A to H.
    pub anchors: [[f32; 3]; REPROPE_AXES],
    /// Radius of the printable area.
    pub print_radius: f32,
    /// Spool radius growth per unit of wound line.
    pub spool_buildup_factor: f32,
    /// Empty spool radii.
    pub spool_radii: [f32; REPROPE_AXES],
    /// Pulley mechanical advantage per line.
    pub mechanical_advantage: [u32; REPROPE_AXES],
    /// Lines wound on each spool.
    pub lines_per_spool: [u32; REPROPE_AXES],
    /// Motor gear teeth.
    pub motor_gear_teeth: [u32; REPROPE_AXES],
    /// Spool gear teeth.
    pub spool_gear_teeth: [u32; REPROPE_AXES],
    /// Full steps per motor revolution.
    pub full_steps_per_motor_rev: [u32; REPROPE_AXES],
    /// Driver microstepping per winch.
    pub microstepping: [Microsteps; REPROPE_AXES],
}

impl Default for RepropeParams {
    fn default() -> Self {
        Self {
            anchors: DEFAULT_ANCHORS,
            print_radius: 1500.0,
            spool_buildup_factor: 0.007,
            spool_radii: [15.0; REPROPE_AXES],
            mechanical_advantage: [2; REPROPE_AXES],
            lines_per_spool: [1; REPROPE_AXES],
            motor_gear_teeth: [20; REPROPE_AXES],
            spool_gear_teeth: [255; REPROPE_AXES],
            full_steps_per_motor_rev: [25; REPROPE_AXES],
            microstepping: [Microsteps::SIXTEENTH; REPROPE_AXES],
        }
    }
}

impl RepropeParams {
    /// Overlay the fields present in a configuration section.
    pub fn apply_section(&mut self, section: &RepropeSection) {
        if let Some(anchors) = section.anchors {
            self.anchors = anchors;
        }
        if let Some(radius) = section.print_radius {
            self.print_radius = radius.value();
        }
        if let Some(factor) = section.spool_buildup_factor {
            self.spool_buildup_factor = factor;
        }
        if let Some(radii) = section.spool_radii {
            self.spool_radii = radii;
        }
        if let Some(values) = section.mechanical_advantage {
            self.mechanical_advantage = values;
        }
        if let Some(values) = section.lines_per_spool {
            self.lines_per_spool = values;
        }
        if let Some(values) = section.motor_gear_teeth {
            self.motor_gear_teeth = values;
        }
        if let Some(values) = section.spool_gear_teeth {
            self.spool_gear_teeth = values;
        }
        if let Some(values) = section.full_steps_per_motor_rev {
            self.full_steps_per_motor_rev = values;
        }
        if let Some(values) = section.microstepping {
            self.microstepping = values;
        }
    }

    /// Check that every derived coefficient will be finite.
    pub fn validate(&self) -> Result<()> {
        if !(self.print_radius > 0.0) {
            return Err(invalid('P', self.print_radius));
        }
        if !(self.spool_buildup_factor.is_finite() && self.spool_buildup_factor >= 0.0) {
            return Err(invalid('Q', self.spool_buildup_factor));
        }
        if let Some(bad) = self.spool_radii.iter().find(|r| !(**r > 0.0)) {
            return Err(invalid('R', *bad));
        }
        let counts = [
            ('U', &self.mechanical_advantage),
            ('O', &self.lines_per_spool),
            ('L', &self.motor_gear_teeth),
            ('H', &self.spool_gear_teeth),
            ('J', &self.full_steps_per_motor_rev),
        ];
        for (letter, values) in counts {
            if values.contains(&0) {
                return Err(invalid(letter, 0.0));
            }
        }
        for (advantage, lines) in self.mechanical_advantage.iter().zip(&self.lines_per_spool) {
            if advantage.checked_mul(*lines).is_none() {
                return Err(invalid('U', *advantage as f32));
            }
        }
        Ok(())
    }
}

fn invalid(letter: char, value: f32) -> crate::Error {
    ConfigError::InvalidParameter { letter, value }.into()
}

/// Frame that moves A, B, C and D into the canonical pose used by the
/// forward transform: D on the Z axis and A in the YZ plane.
#[derive(Debug, Clone, Copy, PartialEq)]
struct RotationFrame {
    rx: Mat3,
    ry: Mat3,
    rz: Mat3,
    anchors: [Vec3; 4],
    k1b: f64,
    k1c: f64,
}

/// Trilateration frame over three well spread anchors, used when A to D
/// lie in one plane and the rotation method has no solution.
#[derive(Debug, Clone, Copy, PartialEq)]
struct PlanarFrame {
    indices: [usize; 3],
    origin: Vec3,
    ex: Vec3,
    ey: Vec3,
    ez: Vec3,
    d: f64,
    i: f64,
    j: f64,
    /// Sign of `ez` pointing away from the anchors, downwards.
    lower: f64,
    centroid: Vec3,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Solver {
    Rotation(RotationFrame),
    Planar(PlanarFrame),
}

/// Coefficients recomputed whenever any parameter changes.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Derived {
    print_radius_squared: f32,
    line_lengths_origin: [f32; REPROPE_AXES],
    steps_per_unit_times_r: [f32; REPROPE_AXES],
    k0: [f32; REPROPE_AXES],
    k2: [f32; REPROPE_AXES],
    spool_radii_sq: [f32; REPROPE_AXES],
    solver: Solver,
}

impl Derived {
    fn from_params(params: &RepropeParams) -> Self {
        let mut derived = Self {
            print_radius_squared: params.print_radius * params.print_radius,
            line_lengths_origin: [0.0; REPROPE_AXES],
            steps_per_unit_times_r: [0.0; REPROPE_AXES],
            k0: [0.0; REPROPE_AXES],
            k2: [0.0; REPROPE_AXES],
            spool_radii_sq: [0.0; REPROPE_AXES],
            solver: solver_for(&params.anchors),
        };

        for i in 0..REPROPE_AXES {
            let [x, y, z] = params.anchors[i];
            derived.line_lengths_origin[i] = libm::sqrtf(x * x + y * y + z * z);

            let spu_r = (params.mechanical_advantage[i] as f32
                * params.full_steps_per_motor_rev[i] as f32
                * params.microstepping[i].value() as f32
                * params.spool_gear_teeth[i] as f32)
                / (2.0 * core::f32::consts::PI * params.motor_gear_teeth[i] as f32);
            let k2 = -(params.mechanical_advantage[i] as f32 * params.lines_per_spool[i] as f32)
                * params.spool_buildup_factor;

            derived.steps_per_unit_times_r[i] = spu_r;
            derived.k2[i] = k2;
            derived.k0[i] = if k2 != 0.0 { 2.0 * spu_r / k2 } else { 0.0 };
            derived.spool_radii_sq[i] = params.spool_radii[i] * params.spool_radii[i];
        }
        derived
    }
}

/// Eight-line cable robot.
#[derive(Debug, Clone, PartialEq)]
pub struct RepropeKinematics {
    base: KinematicsBase,
    params: RepropeParams,
    derived: Derived,
}

impl RepropeKinematics {
    /// Create a reprope with the default anchors and spools.
    pub fn new() -> Self {
        let params = RepropeParams::default();
        Self {
            base: KinematicsBase::new(KinematicsType::Reprope, SegmentationType::new(true, true, true)),
            derived: Derived::from_params(&params),
            params,
        }
    }

    /// Create a reprope from validated parameters.
    pub fn with_params(params: RepropeParams) -> Result<Self> {
        let mut kin = Self::new();
        kin.set_params(params)?;
        Ok(kin)
    }

    /// Current parameters.
    pub fn params(&self) -> &RepropeParams {
        &self.params
    }

    /// Replace all parameters after validating them.
    pub fn set_params(&mut self, params: RepropeParams) -> Result<()> {
        params.validate()?;
        self.params = params;
        self.recalc();
        Ok(())
    }

    /// Set the microstepping of one winch driver.
    pub fn set_microstepping(&mut self, drive: usize, microsteps: Microsteps) {
        if let Some(slot) = self.params.microstepping.get_mut(drive) {
            *slot = microsteps;
            self.recalc();
        }
    }

    /// Whether anchors A to D lie in one plane.
    pub fn anchors_coplanar(&self) -> bool {
        matches!(self.derived.solver, Solver::Planar(_))
    }

    fn recalc(&mut self) {
        self.derived = Derived::from_params(&self.params);
        debug!(
            "reprope recalculated, coplanar anchors {}",
            self.anchors_coplanar()
        );
    }

    fn motor_pos_to_line_pos(&self, motor: i32, axis: usize) -> f32 {
        let d = &self.derived;
        let r = self.params.spool_radii[axis];
        if d.k2[axis] == 0.0 {
            return motor as f32 * r / d.steps_per_unit_times_r[axis];
        }
        let t = motor as f32 / d.k0[axis] + r;
        (t * t - d.spool_radii_sq[axis]) / d.k2[axis]
    }

    fn line_lengths(&self, motor_pos: &[i32]) -> [f64; REPROPE_AXES] {
        let mut lengths = [0.0; REPROPE_AXES];
        for (axis, length) in lengths.iter_mut().enumerate() {
            *length = f64::from(self.motor_pos_to_line_pos(motor_pos[axis], axis))
                + f64::from(self.derived.line_lengths_origin[axis]);
        }
        lengths
    }

    fn anchor(&self, i: usize) -> Vec3 {
        self.params.anchors[i].map(f64::from)
    }

    fn forward_transform(&self, lengths: &[f64; REPROPE_AXES]) -> Vec3 {
        match self.derived.solver {
            Solver::Rotation(ref frame) => self.rotation_forward(frame, lengths),
            Solver::Planar(ref frame) => planar_forward(frame, lengths),
        }
    }

    fn rotation_forward(&self, frame: &RotationFrame, lengths: &[f64; REPROPE_AXES]) -> Vec3 {
        let rot = &frame.anchors;
        let sq = |i: usize| dot(self.anchor(i), self.anchor(i));
        let (a_sq, b_sq, c_sq, d_sq) = (sq(A), sq(B), sq(C), sq(D));
        let aa = lengths[A] * lengths[A];
        let bb = lengths[B] * lengths[B];
        let cc = lengths[C] * lengths[C];
        let dd = lengths[D] * lengths[D];

        let k0b = (-bb + b_sq - d_sq + dd) / (2.0 * rot[B][0])
            + (rot[B][1] / (2.0 * rot[A][1] * rot[B][0])) * (d_sq - a_sq + aa - dd);
        let k0c = (-cc + c_sq - d_sq + dd) / (2.0 * rot[C][0])
            + (rot[C][1] / (2.0 * rot[A][1] * rot[C][0])) * (d_sq - a_sq + aa - dd);

        let z = (k0b - k0c) / (frame.k1c - frame.k1b);
        let x = k0c + frame.k1c * z;
        let y = (a_sq - d_sq - aa + dd) / (2.0 * rot[A][1]) + ((rot[D][2] - rot[A][2]) / rot[A][1]) * z;

        let p = rotate(&frame.rz, [x, y, z]);
        let p = rotate(&frame.ry, p);
        rotate(&frame.rx, p)
    }

    fn configure_m669(&mut self, params: &CommandParams<'_>, reply: &mut dyn fmt::Write) -> Result<bool> {
        let mut staged_base = self.base.clone();
        let mut seen_segmentation = false;
        staged_base.try_configure_segmentation(params, &mut seen_segmentation)?;

        let mut staged = self.params;
        let mut seen = false;
        for (anchor, letter) in ANCHOR_LETTERS.into_iter().enumerate() {
            params.try_get_f32_array(letter, &mut staged.anchors[anchor], &mut seen)?;
        }
        params.try_get_f32('P', &mut staged.print_radius, &mut seen)?;

        if seen {
            staged.validate()?;
            self.params = staged;
            self.recalc();
        } else if !seen_segmentation && !params.seen('K') {
            let _ = self.write_m669_echo(reply);
        }
        self.base = staged_base;
        Ok(seen || seen_segmentation)
    }

    fn write_m669_echo(&self, reply: &mut dyn fmt::Write) -> fmt::Result {
        self.base.write_description(reply, self.name())?;
        for (anchor, letter) in self.params.anchors.iter().zip(ANCHOR_LETTERS) {
            writeln!(reply)?;
            write!(reply, "{}:{:.2}, {:.2}, {:.2}", letter, anchor[0], anchor[1], anchor[2])?;
        }
        write!(reply, "\nP:Print radius: {:.1}", self.params.print_radius)
    }

    fn configure_m666(&mut self, params: &CommandParams<'_>, reply: &mut dyn fmt::Write) -> Result<bool> {
        let mut staged = self.params;
        let mut seen = false;
        params.try_get_f32('Q', &mut staged.spool_buildup_factor, &mut seen)?;
        params.try_get_f32_array('R', &mut staged.spool_radii, &mut seen)?;
        params.try_get_u32_array('U', &mut staged.mechanical_advantage, &mut seen)?;
        params.try_get_u32_array('O', &mut staged.lines_per_spool, &mut seen)?;
        params.try_get_u32_array('L', &mut staged.motor_gear_teeth, &mut seen)?;
        params.try_get_u32_array('H', &mut staged.spool_gear_teeth, &mut seen)?;
        params.try_get_u32_array('J', &mut staged.full_steps_per_motor_rev, &mut seen)?;

        if seen {
            staged.validate()?;
            self.params = staged;
            self.recalc();
        } else {
            let _ = self.write_m666_echo(reply);
        }
        Ok(seen)
    }

    fn write_m666_echo(&self, reply: &mut dyn fmt::Write) -> fmt::Result {
        let p = &self.params;
        write!(reply, "Q:Buildup fac {:.4}\nR:Spool r ", p.spool_buildup_factor)?;
        write_list(reply, &p.spool_radii.map(Display2), ", ")?;
        let rows: [(&str, &[u32; REPROPE_AXES]); 5] = [
            ("U:Mech Adv", &p.mechanical_advantage),
            ("O:Lines/spool", &p.lines_per_spool),
            ("L:Motor gear teeth", &p.motor_gear_teeth),
            ("H:Spool gear teeth", &p.spool_gear_teeth),
            ("J:Full steps/rev", &p.full_steps_per_motor_rev),
        ];
        for (label, values) in rows {
            write!(reply, "\n{} ", label)?;
            write_list(reply, values, ", ")?;
        }
        Ok(())
    }
}

impl Default for RepropeKinematics {
    fn default() -> Self {
        Self::new()
    }
}

/// Formats an `f32` with two decimals.
struct Display2(f32);

impl fmt::Display for Display2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

/// Formats an `f32` with three decimals.
struct Display3(f32);

impl fmt::Display for Display3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}", self.0)
    }
}

fn write_list<T: fmt::Display>(out: &mut dyn fmt::Write, values: &[T], separator: &str) -> fmt::Result {
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.write_str(separator)?;
        }
        write!(out, "{}", value)?;
    }
    Ok(())
}

impl Kinematics for RepropeKinematics {
    fn name(&self) -> &'static str {
        "Reprope"
    }

    fn base(&self) -> &KinematicsBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut KinematicsBase {
        &mut self.base
    }

    fn configure(&mut self, code: u16, params: &CommandParams<'_>, reply: &mut dyn fmt::Write) -> Result<bool> {
        match code {
            669 => self.configure_m669(params, reply),
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
        let d = &self.derived;
        for i in 0..REPROPE_AXES {
            let anchor = &self.params.anchors[i];
            let dx = anchor[0] - machine_pos[X_AXIS];
            let dy = anchor[1] - machine_pos[Y_AXIS];
            let dz = anchor[2] - machine_pos[Z_AXIS];
            let line_pos = libm::sqrtf(dx * dx + dy * dy + dz * dz) - d.line_lengths_origin[i];
            let r = self.params.spool_radii[i];

            let steps = if d.k2[i] == 0.0 {
                line_pos * d.steps_per_unit_times_r[i] / r
            } else {
                let radicand = d.spool_radii_sq[i] + line_pos * d.k2[i];
                if radicand < 0.0 {
                    return false;
                }
                d.k0[i] * (libm::sqrtf(radicand) - r)
            };
            if !steps.is_finite() {
                return false;
            }
            motor_pos[i] = libm::roundf(steps) as i32;
        }
        for axis in REPROPE_AXES..num_total_axes.min(machine_pos.len()) {
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
        let lengths = self.line_lengths(motor_pos);
        let [x, y, z] = self.forward_transform(&lengths);
        machine_pos[X_AXIS] = x as f32;
        machine_pos[Y_AXIS] = y as f32;
        machine_pos[Z_AXIS] = z as f32;

        let end = num_total_axes.min(machine_pos.len());
        for axis in Z_AXIS + 1..end {
            machine_pos[axis] = if axis < REPROPE_AXES {
                0.0
            } else {
                motor_pos[axis] as f32 / steps_per_mm[axis]
            };
        }
    }

    fn is_reachable(&self, coords: &[f32], _axes: AxesBitmap) -> bool {
        let p = [
            f64::from(coords[X_AXIS]),
            f64::from(coords[Y_AXIS]),
            f64::from(coords[Z_AXIS]),
        ];
        match self.derived.solver {
            Solver::Rotation(_) => {
                let t = [self.anchor(A), self.anchor(B), self.anchor(C), self.anchor(D)];
                is_inside_tetrahedron(p, &t)
            }
            Solver::Planar(ref frame) => self.is_below_polygon(frame, p),
        }
    }

    fn limit_position(
        &self,
        final_coords: &mut [f32],
        _initial_coords: Option<&[f32]>,
        _num_visible_axes: usize,
        axes_to_limit: AxesBitmap,
        _is_coordinated: bool,
        apply_limits: bool,
    ) -> LimitPositionResult {
        let mut limited = false;
        if axes_to_limit.contains_all(XYZ_AXES) {
            let r2 = final_coords[X_AXIS] * final_coords[X_AXIS] + final_coords[Y_AXIS] * final_coords[Y_AXIS];
            if r2 > self.derived.print_radius_squared {
                let factor = libm::sqrtf(self.derived.print_radius_squared / r2);
                final_coords[X_AXIS] *= factor;
                final_coords[Y_AXIS] *= factor;
                limited = true;
            }
            if apply_limits && self.base.limits().get(Z_AXIS).clamp(&mut final_coords[Z_AXIS]) {
                limited = true;
            }
        }

        if limited {
            LimitPositionResult::Adjusted
        } else {
            LimitPositionResult::Ok
        }
    }

    fn homing_mode(&self) -> HomingMode {
        HomingMode::HomeIndividualMotors
    }

    fn axes_assumed_homed(&self, g92_axes: AxesBitmap) -> AxesBitmap {
        let mut axes = g92_axes;
        if axes.contains_all(XYZ_AXES) {
            for axis in D..REPROPE_AXES {
                axes.set(axis);
            }
        } else {
            axes &= !XYZ_AXES;
        }
        axes
    }

    fn must_be_homed_axes(&self, axes_moving: AxesBitmap, _disallow_moves_before_homing: bool) -> AxesBitmap {
        if axes_moving.intersects(XYZ_AXES) {
            axes_moving | XYZ_AXES
        } else {
            axes_moving
        }
    }

    fn homing_file_name(
        &self,
        _to_be_homed: AxesBitmap,
        _already_homed: AxesBitmap,
        _num_visible_axes: usize,
        filename: &mut heapless::String<32>,
    ) -> AxesBitmap {
        filename.clear();
        let _ = filename.push_str(HOME_ALL_FILE);
        AxesBitmap::new()
    }

    fn query_terminate_homing_move(&self, _axis: usize) -> bool {
        false
    }

    fn on_homing_switch_triggered(
        &self,
        _axis: usize,
        _high_end: bool,
        _steps_per_mm: &[f32],
        _target: &mut dyn DriveCoordinates,
    ) {
    }

    fn linear_axes(&self) -> AxesBitmap {
        AxesBitmap::lowest_n(crate::MAX_AXES) & !AxesBitmap::lowest_n(REPROPE_AXES)
    }

    fn write_calibration_parameters(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let p = &self.params;
        out.write_str("; Reprope parameters\n")?;
        write!(out, "M669 K{}", KinematicsType::Reprope.number())?;
        for (anchor, letter) in p.anchors.iter().zip(ANCHOR_LETTERS) {
            write!(out, " {}", letter)?;
            write_list(out, &anchor.map(Display3), ":")?;
        }
        write!(out, " P{:.1}", p.print_radius)?;
        writeln!(
            out,
            " S{:.1} T{:.3}",
            self.base.segments_per_second().unwrap_or(0.0),
            self.base.min_segment_length().unwrap_or(0.0)
        )?;

        write!(out, "M666 Q{:.6} R", p.spool_buildup_factor)?;
        write_list(out, &p.spool_radii.map(Display3), ":")?;
        let rows: [(char, &[u32; REPROPE_AXES]); 5] = [
            ('U', &p.mechanical_advantage),
            ('O', &p.lines_per_spool),
            ('L', &p.motor_gear_teeth),
            ('H', &p.spool_gear_teeth),
            ('J', &p.full_steps_per_motor_rev),
        ];
        for (letter, values) in rows {
            write!(out, " {}", letter)?;
            write_list(out, values, ":")?;
        }
        out.write_str("\n")
    }

    fn derived_steps_per_unit(&self, drive: usize) -> Option<f32> {
        (drive < REPROPE_AXES)
            .then(|| self.derived.steps_per_unit_times_r[drive] / self.params.spool_radii[drive])
    }
}

impl RepropeKinematics {
    fn is_below_polygon(&self, frame: &PlanarFrame, p: Vec3) -> bool {
        let below = add(frame.centroid, scale(frame.ez, frame.lower));
        let [i0, i1, i2] = frame.indices;
        if !is_same_side(self.anchor(i0), self.anchor(i1), self.anchor(i2), below, p) {
            return false;
        }
        // Vertical faces through each polygon edge
        (0..REPROPE_AXES).all(|i| {
            let v0 = self.anchor(i);
            let v1 = self.anchor((i + 1) % REPROPE_AXES);
            let v2 = [v0[0], v0[1], v0[2] - 1.0];
            is_same_side(v0, v1, v2, frame.centroid, p)
        })
    }
}

fn solver_for(anchors: &[[f32; 3]; REPROPE_AXES]) -> Solver {
    let p = anchors.map(|a| a.map(f64::from));
    let e1 = sub(p[B], p[A]);
    let e2 = sub(p[C], p[A]);
    let e3 = sub(p[D], p[A]);
    let triple = dot(e1, cross(e2, e3));
    let coplanar = libm::fabs(triple) <= 1e-6 * norm(e1) * norm(e2) * norm(e3);

    if coplanar {
        Solver::Planar(planar_frame(&p))
    } else {
        Solver::Rotation(rotation_frame(&p))
    }
}

fn rotation_frame(p: &[Vec3; REPROPE_AXES]) -> RotationFrame {
    let x_angle = libm::atan(p[D][1] / p[D][2]);
    let (s, c) = (libm::sin(x_angle), libm::cos(x_angle));
    let rx = [[1.0, 0.0, 0.0], [0.0, c, s], [0.0, -s, c]];
    let tmp0 = [A, B, C, D].map(|i| rotate_transposed(&rx, p[i]));

    let y_angle = libm::atan(-tmp0[D][0] / tmp0[D][2]);
    let (s, c) = (libm::sin(y_angle), libm::cos(y_angle));
    let ry = [[c, 0.0, -s], [0.0, 1.0, 0.0], [s, 0.0, c]];
    let tmp1 = tmp0.map(|v| rotate_transposed(&ry, v));

    let z_angle = libm::atan(tmp1[A][0] / tmp1[A][1]);
    let (s, c) = (libm::sin(z_angle), libm::cos(z_angle));
    let rz = [[c, s, 0.0], [-s, c, 0.0], [0.0, 0.0, 1.0]];
    let rot = tmp1.map(|v| rotate_transposed(&rz, v));

    let k1b = (rot[B][1] * (rot[A][2] - rot[D][2])) / (rot[A][1] * rot[B][0]) + (rot[D][2] - rot[B][2]) / rot[B][0];
    let k1c = (rot[C][1] * (rot[A][2] - rot[D][2])) / (rot[A][1] * rot[C][0]) + (rot[D][2] - rot[C][2]) / rot[C][0];

    RotationFrame {
        rx,
        ry,
        rz,
        anchors: rot,
        k1b,
        k1c,
    }
}

fn planar_frame(p: &[Vec3; REPROPE_AXES]) -> PlanarFrame {
    let i0 = A;
    let i1 = (0..REPROPE_AXES)
        .max_by(|&a, &b| norm(sub(p[a], p[i0])).total_cmp(&norm(sub(p[b], p[i0]))))
        .unwrap_or(C);
    let base_edge = sub(p[i1], p[i0]);
    let area = |k: usize| norm(cross(sub(p[k], p[i0]), base_edge));
    let i2 = (0..REPROPE_AXES)
        .max_by(|&a, &b| area(a).total_cmp(&area(b)))
        .unwrap_or(B);

    let d = norm(base_edge);
    let ex = scale(base_edge, 1.0 / d);
    let p3 = sub(p[i2], p[i0]);
    let i = dot(ex, p3);
    let ey_raw = sub(p3, scale(ex, i));
    let ey = scale(ey_raw, 1.0 / norm(ey_raw));
    let ez = cross(ex, ey);
    let j = dot(ey, p3);

    let mut centroid = [0.0; 3];
    for anchor in p {
        centroid = add(centroid, *anchor);
    }
    let centroid = scale(centroid, 1.0 / REPROPE_AXES as f64);

    PlanarFrame {
        indices: [i0, i1, i2],
        origin: p[i0],
        ex,
        ey,
        ez,
        d,
        i,
        j,
        lower: if ez[2] > 0.0 { -1.0 } else { 1.0 },
        centroid,
    }
}

fn planar_forward(frame: &PlanarFrame, lengths: &[f64; REPROPE_AXES]) -> Vec3 {
    let [i0, i1, i2] = frame.indices;
    let (r1, r2, r3) = (lengths[i0], lengths[i1], lengths[i2]);
    let (d, i, j) = (frame.d, frame.i, frame.j);

    let x = (r1 * r1 - r2 * r2 + d * d) / (2.0 * d);
    let y = (r1 * r1 - r3 * r3 + i * i + j * j) / (2.0 * j) - (i / j) * x;
    let z = libm::sqrt((r1 * r1 - x * x - y * y).max(0.0));

    let p = add(frame.origin, add(scale(frame.ex, x), scale(frame.ey, y)));
    add(p, scale(frame.ez, frame.lower * z))
}

fn is_same_side(v0: Vec3, v1: Vec3, v2: Vec3, v3: Vec3, p: Vec3) -> bool {
    let normal = cross(sub(v1, v0), sub(v2, v0));
    let dot0 = dot(sub(v3, v0), normal);
    let dot1 = dot(sub(p, v0), normal);
    dot0 * dot1 > 0.0
}

fn is_inside_tetrahedron(p: Vec3, t: &[Vec3; 4]) -> bool {
    is_same_side(t[0], t[1], t[2], t[3], p)
        && is_same_side(t[2], t[1], t[3], t[0], p)
        && is_same_side(t[2], t[3], t[0], t[1], p)
        && is_same_side(t[0], t[3], t[1], t[2], p)
}

/// `Mᵀ v`
fn rotate_transposed(m: &Mat3, v: Vec3) -> Vec3 {
    [0, 1, 2].map(|col| m[0][col] * v[0] + m[1][col] * v[1] + m[2][col] * v[2])
}

/// `M v`
fn rotate(m: &Mat3, v: Vec3) -> Vec3 {
    [0, 1, 2].map(|row| m[row][0] * v[0] + m[row][1] * v[1] + m[row][2] * v[2])
}

fn add(a: Vec3, b: Vec3) -> Vec3 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

fn sub(a: Vec3, b: Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn scale(a: Vec3, k: f64) -> Vec3 {
    [a[0] * k, a[1] * k, a[2] * k]
}

fn dot(a: Vec3, b: Vec3) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: Vec3, b: Vec3) -> Vec3 {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn norm(a: Vec3) -> f64 {
    libm::sqrt(dot(a, a))
}
