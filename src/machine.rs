//! Machine facade.
//!
//! [`Machine`] owns the kinematics, the drive table, the move queue and the
//! step engine. Moves are given in machine coordinates, cut into segments
//! when the kinematics asks for it, converted to motor steps and handed to
//! the engine one at a time as [`Machine::poll`] is called.
//!
//! # Example
//!
//! ```rust,ignore
//! use drive_motion::{config::load_config, machine::{Machine, MoveCommand}, sink::StepRecorder};
//!
//! let config = load_config("machine.toml")?;
//! let mut machine: Machine<8> = Machine::from_config(&config)?;
//! machine.queue_move(&MoveCommand::new(50.0, 1000.0).xyz(10.0, 0.0, 0.0))?;
//!
//! let mut sink = StepRecorder::<0>::counting();
//! machine.run_until_idle(0, &mut sink)?;
//! ```

use core::fmt;

use libm::{fabsf, sqrtf};

use crate::config::{validate_config, Command, CommandParams, DriveTable, MachineConfig};
use crate::error::{ConfigError, KinematicsError, MotionError, Result};
use crate::kinematics::{
    AnyKinematics, AxesBitmap, Kinematics, KinematicsType, LimitPositionResult, MotionType, REPROPE_AXES, XYZ_AXES,
    Z_AXIS,
};
use crate::motion::{DeltaAxisMove, DriveRequest, MotionProfile, MoveQueue, PlannedMove, QueuedMove, StepEngine, StepOutcome};
use crate::sink::StepSink;
use crate::{MAX_AXES, MAX_DRIVES, MAX_EXTRUDERS};

/// A straight move in machine coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveCommand {
    coords: [f32; MAX_AXES],
    axes: AxesBitmap,
    extrusion: [f32; MAX_EXTRUDERS],
    speed: f32,
    acceleration: f32,
    deceleration: f32,
    apply_limits: bool,
}

impl MoveCommand {
    /// Move at `speed` mm/s, accelerating and decelerating at
    /// `acceleration` mm/s².
    pub fn new(speed: f32, acceleration: f32) -> Self {
        Self {
            coords: [0.0; MAX_AXES],
            axes: AxesBitmap::new(),
            extrusion: [0.0; MAX_EXTRUDERS],
            speed,
            acceleration,
            deceleration: acceleration,
            apply_limits: true,
        }
    }

    /// Target for one axis. Axes not given keep their position.
    pub fn axis(mut self, axis: usize, position: f32) -> Self {
        if axis < MAX_AXES {
            self.coords[axis] = position;
            self.axes.set(axis);
        }
        self
    }

    /// Target for X, Y and Z.
    pub fn xyz(self, x: f32, y: f32, z: f32) -> Self {
        self.axis(0, x).axis(1, y).axis(Z_AXIS, z)
    }

    /// Extrude `mm` of filament with `extruder`, relative.
    pub fn extrude(mut self, extruder: usize, mm: f32) -> Self {
        if extruder < MAX_EXTRUDERS {
            self.extrusion[extruder] = mm;
        }
        self
    }

    /// Decelerate at a different rate.
    pub fn deceleration(mut self, deceleration: f32) -> Self {
        self.deceleration = deceleration;
        self
    }

    /// Skip the axis limits. Targets outside the workspace are still refused.
    pub fn without_limits(mut self) -> Self {
        self.apply_limits = false;
        self
    }

    fn validate(&self) -> Result<()> {
        if !(self.speed > 0.0) {
            return Err(ConfigError::InvalidParameter {
                letter: 'F',
                value: self.speed,
            }
            .into());
        }
        for rate in [self.acceleration, self.deceleration] {
            if !(rate > 0.0) {
                return Err(ConfigError::InvalidParameter {
                    letter: 'A',
                    value: rate,
                }
                .into());
            }
        }
        Ok(())
    }
}

/// Progress through a move that is being cut into segments.
#[derive(Debug, Clone)]
struct SegmentCursor {
    plan: PlannedMove,
    start: [f32; MAX_AXES],
    end: [f32; MAX_AXES],
    extrusion_start: [f32; MAX_EXTRUDERS],
    extrusion: [f32; MAX_EXTRUDERS],
    /// Motor positions at the start of the next segment.
    motor_pos: [i32; MAX_DRIVES],
    count: u32,
    next: u32,
    /// Unit vector of the XYZ move for delta carriages.
    delta_direction: Option<[f32; 3]>,
}

struct Discard;

impl fmt::Write for Discard {
    fn write_str(&mut self, _: &str) -> fmt::Result {
        Ok(())
    }
}

/// A complete machine: `N` drive movements, a queue of `Q - 1` moves.
#[derive(Debug)]
pub struct Machine<const N: usize = 16, const Q: usize = 16> {
    kinematics: AnyKinematics,
    table: DriveTable,
    engine: StepEngine<N>,
    queue: MoveQueue<Q>,
    pending: Option<SegmentCursor>,
    planned_coords: [f32; MAX_AXES],
    planned_extrusion: [f32; MAX_EXTRUDERS],
    planned_motors: [i32; MAX_DRIVES],
    needs_resync: bool,
}

impl<const N: usize, const Q: usize> Machine<N, Q> {
    /// Build a machine from a validated configuration, positioned where the
    /// kinematics assumes the head starts.
    pub fn from_config(config: &MachineConfig) -> Result<Self> {
        validate_config(config)?;
        let mut table = DriveTable::from_config(config)?;
        if table.num_drives() > N {
            return Err(ConfigError::TooManyDrives {
                requested: table.num_drives(),
                capacity: N,
            }
            .into());
        }
        let kinematics = AnyKinematics::from_config(config)?;
        check_layout(&kinematics, &table)?;
        apply_derived_steps(&kinematics, &mut table);

        let mut engine = StepEngine::new();
        for drive in 0..table.num_drives() {
            engine.set_inverted(drive, table.is_inverted(drive));
        }

        let coords = assumed_position(&kinematics, &table);
        let motors = to_motors(&kinematics, &table, &coords)?;
        let mut machine = Self {
            kinematics,
            table,
            engine,
            queue: MoveQueue::new(),
            pending: None,
            planned_coords: [0.0; MAX_AXES],
            planned_extrusion: [0.0; MAX_EXTRUDERS],
            planned_motors: [0; MAX_DRIVES],
            needs_resync: false,
        };
        machine.commit_position(coords, motors);

        info!(
            "{} machine with {} axes and {} extruders",
            machine.kinematics.name(),
            machine.table.num_axes() as u32,
            machine.table.num_extruders() as u32
        );
        Ok(machine)
    }

    /// The active kinematics.
    #[inline]
    pub fn kinematics(&self) -> &AnyKinematics {
        &self.kinematics
    }

    /// Drive layout and steps per mm.
    #[inline]
    pub fn drive_table(&self) -> &DriveTable {
        &self.table
    }

    /// The step engine.
    #[inline]
    pub fn engine(&self) -> &StepEngine<N> {
        &self.engine
    }

    /// Moves waiting in the queue.
    #[inline]
    pub fn queued_moves(&self) -> usize {
        self.queue.len()
    }

    /// True while a move is executing, queued or still being cut up.
    pub fn is_motion_active(&self) -> bool {
        self.engine.is_busy() || !self.queue.is_empty() || self.pending.is_some()
    }

    /// Apply an M665/M666/M669 command.
    ///
    /// `M669 K<n>` switches kinematics; the new geometry inherits the shared
    /// settings and the head is assumed to be at its initial position. All
    /// changes are staged and committed together, so on error the machine is
    /// left as it was. Refused while motion is active.
    pub fn configure(&mut self, code: u16, params: &CommandParams<'_>, reply: &mut dyn fmt::Write) -> Result<bool> {
        if self.is_motion_active() {
            warn!("M{} refused while moving", code);
            return Err(ConfigError::MotionActive.into());
        }

        let mut staged = self.kinematics.clone();
        let mut switched = false;
        if code == 669 {
            if let Some(number) = params.get_u32('K')? {
                let kinematics_type =
                    KinematicsType::from_number(number).ok_or(ConfigError::UnsupportedKinematics(number))?;
                if kinematics_type != staged.kinematics_type() {
                    staged = AnyKinematics::create(kinematics_type, staged.base())?;
                    switched = true;
                }
            }
        }
        let changed = staged.configure(code, params, reply)? || switched;
        if !changed {
            return Ok(false);
        }

        let mut table = self.table.clone();
        check_layout(&staged, &table)?;
        apply_derived_steps(&staged, &mut table);

        let current = if switched {
            assumed_position(&staged, &table)
        } else {
            self.planned_coords
        };
        let (coords, motors) = match to_motors(&staged, &table, &current) {
            Ok(motors) => (current, motors),
            Err(_) => {
                // Current position has no solution in the new geometry
                let fallback = assumed_position(&staged, &table);
                (fallback, to_motors(&staged, &table, &fallback)?)
            }
        };

        self.kinematics = staged;
        self.table = table;
        self.commit_position(coords, motors);
        info!("M{} applied, kinematics now {}", code, self.kinematics.name());
        Ok(true)
    }

    /// Parse and apply one command line. Blank and comment lines do nothing.
    pub fn execute_command(&mut self, line: &str, reply: &mut dyn fmt::Write) -> Result<bool> {
        match Command::parse(line)? {
            Some(command) => self.configure(command.code, &command.params, reply),
            None => Ok(false),
        }
    }

    /// Write the calibration as commands that [`restore_calibration`]
    /// accepts.
    ///
    /// [`restore_calibration`]: Self::restore_calibration
    pub fn write_calibration(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        self.kinematics.write_calibration_parameters(out)
    }

    /// Replay saved calibration commands. If any line fails the machine is
    /// restored to its state before the first line.
    pub fn restore_calibration(&mut self, text: &str) -> Result<()> {
        if self.is_motion_active() {
            return Err(ConfigError::MotionActive.into());
        }
        let kinematics = self.kinematics.clone();
        let table = self.table.clone();
        let coords = self.planned_coords;
        let motors = self.planned_motors;

        for line in text.lines() {
            if let Err(e) = self.execute_command(line, &mut Discard) {
                warn!("calibration line rejected, restoring previous geometry");
                self.kinematics = kinematics;
                self.table = table;
                self.commit_position(coords, motors);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Define the current head position without moving. Only the visible
    /// axes given in `coords` change.
    pub fn set_position(&mut self, coords: &[f32]) -> Result<()> {
        if self.is_motion_active() {
            return Err(ConfigError::MotionActive.into());
        }
        let mut target = self.planned_coords;
        for (slot, &value) in target.iter_mut().zip(coords).take(self.num_visible_axes()) {
            *slot = value;
        }
        let motors = to_motors(&self.kinematics, &self.table, &target)?;
        self.commit_position(target, motors);
        Ok(())
    }

    /// Head position worked out from the motor positions.
    pub fn machine_position(&self) -> [f32; MAX_AXES] {
        let motors = self.engine.motor_positions();
        let total = self.table.num_axes();
        let mut coords = [0.0; MAX_AXES];
        self.kinematics.motor_steps_to_cartesian(
            &motors[..total],
            self.table.steps_per_mm(),
            self.num_visible_axes(),
            total,
            &mut coords[..total],
        );
        coords
    }

    /// Filament pushed by `extruder` so far, in mm.
    pub fn extruder_position(&self, extruder: usize) -> f32 {
        let drive = self.table.extruder_drive(extruder);
        self.engine.motor_position(drive) as f32 / self.table.drive_steps_per_mm(drive)
    }

    /// Position the last queued move ends at.
    #[inline]
    pub fn planned_position(&self) -> [f32; MAX_AXES] {
        self.planned_coords
    }

    /// Queue a move from the end of the previous one.
    ///
    /// The target is clamped to the machine limits unless the command says
    /// otherwise; the result tells whether it was. Refused with
    /// [`MotionError::QueueFull`] while the previous move is still being cut
    /// into segments.
    pub fn queue_move(&mut self, command: &MoveCommand) -> Result<LimitPositionResult> {
        command.validate()?;
        self.fill_queue()?;
        if self.pending.is_some() || self.queue.is_full() {
            return Err(MotionError::QueueFull.into());
        }

        let total = self.table.num_axes();
        let visible = self.num_visible_axes();
        let start = self.planned_coords;
        let mut target = start;
        let mut moving = AxesBitmap::new();
        for axis in command.axes.iter().filter(|&axis| axis < visible) {
            target[axis] = command.coords[axis];
            moving.set(axis);
        }

        // Non-Cartesian motors each depend on X, Y and Z
        let limit_axes = if self.kinematics.kinematics_type() != KinematicsType::Cartesian && moving.intersects(XYZ_AXES) {
            moving | XYZ_AXES
        } else {
            moving
        };
        let limited = self.kinematics.limit_position(
            &mut target[..total],
            Some(&start[..total]),
            visible,
            limit_axes,
            true,
            command.apply_limits,
        );
        if !limited.was_adjusted() && !limit_axes.is_empty() && !self.kinematics.is_reachable(&target[..total], limit_axes) {
            debug!("move target unreachable");
            return Err(KinematicsError::Unreachable.into());
        }
        let mut end_motors = to_motors(&self.kinematics, &self.table, &target)?;

        let mut end_extrusion = self.planned_extrusion;
        let mut extrusion_length = 0.0f32;
        for extruder in 0..self.table.num_extruders() {
            let drive = self.table.extruder_drive(extruder);
            end_extrusion[extruder] += command.extrusion[extruder];
            end_motors[drive] = self.table.mm_to_steps(drive, end_extrusion[extruder]).value();
            extrusion_length = extrusion_length.max(fabsf(command.extrusion[extruder]));
        }

        let axes_length = sqrtf(
            (0..visible)
                .map(|axis| (target[axis] - start[axis]) * (target[axis] - start[axis]))
                .sum::<f32>(),
        );
        let distance = if axes_length > 0.0 { axes_length } else { extrusion_length };
        if !(distance > 0.0) {
            return Ok(limited);
        }

        let profile =
            MotionProfile::asymmetric_trapezoidal(distance, command.speed, command.acceleration, command.deceleration);
        let plan = profile.to_planned_move(self.table.clock_hz(), self.table.min_calc_interval())?;

        let segment_free_delta = axes_length > 0.0
            && (0..=Z_AXIS).any(|axis| self.kinematics.motion_type(axis) == MotionType::SegmentFreeDelta);
        let count = if segment_free_delta || !(axes_length > 0.0) {
            1
        } else {
            self.kinematics.segment_count(distance, profile.duration_secs()).max(1)
        };

        // Refuse the whole move rather than fail part way through it
        for index in 1..count {
            let coords = interpolate(&start, &target, index as f32 / count as f32, total);
            to_motors(&self.kinematics, &self.table, &coords)?;
        }

        let delta_direction = segment_free_delta.then(|| {
            [
                (target[0] - start[0]) / axes_length,
                (target[1] - start[1]) / axes_length,
                (target[Z_AXIS] - start[Z_AXIS]) / axes_length,
            ]
        });
        debug!("queueing move of {} mm in {} segments", distance, count);
        self.pending = Some(SegmentCursor {
            plan,
            start,
            end: target,
            extrusion_start: self.planned_extrusion,
            extrusion: command.extrusion,
            motor_pos: self.planned_motors,
            count,
            next: 0,
            delta_direction,
        });
        self.planned_coords = target;
        self.planned_extrusion = end_extrusion;
        self.planned_motors = end_motors;
        self.fill_queue()?;
        Ok(limited)
    }

    /// Emit every step due by absolute clock `now`, starting queued moves as
    /// the engine frees up.
    ///
    /// Each move starts when the previous one ends, or at `now` if that has
    /// already passed.
    pub fn poll<S: StepSink>(&mut self, now: u32, sink: &mut S) -> Result<StepOutcome> {
        self.fill_queue()?;
        while !self.engine.is_busy() {
            let Some(next) = self.queue.pop() else {
                break;
            };
            let start = later(now, self.engine.next_move_start());
            self.engine.start_move(next.plan, &next.requests, start)?;
            self.fill_queue()?;
        }

        let outcome = self.engine.step(now, sink)?;
        if let StepOutcome::Fault { drive } = outcome {
            warn!("drive {} stopped on step timing error", drive);
            self.needs_resync = true;
        }

        let active = self.is_motion_active();
        if !active && self.needs_resync {
            self.sync_planned_position();
        }
        match outcome {
            StepOutcome::Finished | StepOutcome::Idle if active => Ok(StepOutcome::Pending {
                next_due: later(now, self.engine.next_move_start()),
            }),
            other => Ok(other),
        }
    }

    /// Run everything queued on a simulated clock starting at `start`.
    /// Returns the clock at which motion ended.
    pub fn run_until_idle<S: StepSink>(&mut self, start: u32, sink: &mut S) -> Result<u32> {
        let mut now = start;
        loop {
            match self.poll(now, sink)? {
                StepOutcome::Pending { next_due } => now = later(now, next_due),
                StepOutcome::Fault { .. } => {
                    if let Some(due) = self.engine.next_step_due() {
                        now = later(now, due);
                    }
                }
                StepOutcome::Finished | StepOutcome::Idle => {
                    if !self.is_motion_active() {
                        return Ok(now);
                    }
                }
            }
        }
    }

    /// Stop immediately and drop everything queued. Motor positions keep the
    /// steps already emitted.
    pub fn abort(&mut self) -> Result<()> {
        let stopped = self.engine.abort()?;
        let mut dropped = 0u32;
        while self.queue.pop().is_some() {
            dropped += 1;
        }
        self.pending = None;
        self.sync_planned_position();
        info!("aborted {} drives, dropped {} queued moves", stopped as u32, dropped);
        Ok(())
    }

    /// Handle an endstop on `axis` during homing.
    ///
    /// Depending on the kinematics this ends the whole move or just stops the
    /// motor; either way the motor position is redefined from the switch.
    pub fn on_endstop_triggered(&mut self, axis: usize, high_end: bool) -> Result<()> {
        if axis >= self.table.num_axes() {
            return Err(ConfigError::TooManyDrives {
                requested: axis + 1,
                capacity: self.table.num_axes(),
            }
            .into());
        }
        if self.kinematics.query_terminate_homing_move(axis) {
            self.abort()?;
        } else {
            self.engine.stop_drive(axis as u8)?;
        }
        self.kinematics
            .on_homing_switch_triggered(axis, high_end, self.table.steps_per_mm(), &mut self.engine);
        self.needs_resync = true;
        if !self.is_motion_active() {
            self.sync_planned_position();
        }
        Ok(())
    }

    fn num_visible_axes(&self) -> usize {
        visible_axes(&self.kinematics, &self.table)
    }

    fn commit_position(&mut self, coords: [f32; MAX_AXES], motors: [i32; MAX_DRIVES]) {
        for drive in 0..self.table.num_axes() {
            self.engine.set_motor_position(drive, motors[drive]);
            self.planned_motors[drive] = motors[drive];
        }
        self.planned_coords = coords;
    }

    fn sync_planned_position(&mut self) {
        self.planned_motors = self.engine.motor_positions();
        let coords = self.machine_position();
        let total = self.table.num_axes();
        self.planned_coords[..total].copy_from_slice(&coords[..total]);
        for extruder in 0..self.table.num_extruders() {
            self.planned_extrusion[extruder] = self.extruder_position(extruder);
        }
        self.needs_resync = false;
    }

    /// Turn pending segments into queued moves while there is room.
    fn fill_queue(&mut self) -> Result<()> {
        while !self.queue.is_full() {
            let Some(cursor) = self.pending.as_mut() else {
                break;
            };
            let segment = next_segment(cursor, &self.kinematics, &self.table);
            let done = cursor.next >= cursor.count;
            match segment {
                Ok(queued) => {
                    if done {
                        self.pending = None;
                    }
                    self.queue.push(queued)?;
                }
                Err(e) => {
                    error!("segment could not be converted, move dropped");
                    self.pending = None;
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

fn visible_axes(kinematics: &AnyKinematics, table: &DriveTable) -> usize {
    match kinematics.kinematics_type() {
        KinematicsType::Reprope => (Z_AXIS + 1).min(table.num_axes()),
        _ => table.num_axes(),
    }
}

fn check_layout(kinematics: &AnyKinematics, table: &DriveTable) -> Result<()> {
    let required = match kinematics.kinematics_type() {
        KinematicsType::Reprope => REPROPE_AXES,
        KinematicsType::LinearDelta => Z_AXIS + 1,
        _ => 0,
    };
    if table.num_axes() < required {
        return Err(ConfigError::TooFewAxes {
            required,
            found: table.num_axes(),
        }
        .into());
    }
    Ok(())
}

fn apply_derived_steps(kinematics: &AnyKinematics, table: &mut DriveTable) {
    for drive in 0..table.num_axes() {
        if let Some(steps_per_mm) = kinematics.derived_steps_per_unit(drive) {
            table.set_steps_per_mm(drive, steps_per_mm);
        }
    }
}

fn assumed_position(kinematics: &AnyKinematics, table: &DriveTable) -> [f32; MAX_AXES] {
    let mut coords = [0.0; MAX_AXES];
    kinematics.assumed_initial_position(&mut coords[..table.num_axes()]);
    coords
}

fn to_motors(kinematics: &AnyKinematics, table: &DriveTable, coords: &[f32; MAX_AXES]) -> Result<[i32; MAX_DRIVES]> {
    let total = table.num_axes();
    let mut motors = [0; MAX_DRIVES];
    if !kinematics.cartesian_to_motor_steps(
        &coords[..total],
        table.steps_per_mm(),
        visible_axes(kinematics, table),
        total,
        &mut motors[..total],
        true,
    ) {
        return Err(KinematicsError::TransformFailed.into());
    }
    Ok(motors)
}

fn interpolate(start: &[f32; MAX_AXES], end: &[f32; MAX_AXES], fraction: f32, total: usize) -> [f32; MAX_AXES] {
    let mut coords = *end;
    for axis in 0..total {
        coords[axis] = start[axis] + (end[axis] - start[axis]) * fraction;
    }
    coords
}

/// `a` or `b`, whichever comes later on the wrapping clock.
fn later(a: u32, b: u32) -> u32 {
    if (b.wrapping_sub(a) as i32) > 0 {
        b
    } else {
        a
    }
}

fn next_segment(cursor: &mut SegmentCursor, kinematics: &AnyKinematics, table: &DriveTable) -> Result<QueuedMove> {
    let index = cursor.next;
    cursor.next += 1;
    let last = cursor.next >= cursor.count;

    let (plan, coords, fraction) = if cursor.count == 1 {
        (cursor.plan.clone(), cursor.end, 1.0)
    } else {
        let length = cursor.plan.total_distance();
        let fraction = if last {
            1.0
        } else {
            cursor.next as f32 / cursor.count as f32
        };
        let from = length * index as f32 / cursor.count as f32;
        let coords = if last {
            cursor.end
        } else {
            interpolate(&cursor.start, &cursor.end, fraction, table.num_axes())
        };
        (cursor.plan.slice(from, length * fraction)?, coords, fraction)
    };

    let mut motors = to_motors(kinematics, table, &coords)?;
    for extruder in 0..table.num_extruders() {
        let drive = table.extruder_drive(extruder);
        let mm = cursor.extrusion_start[extruder] + cursor.extrusion[extruder] * fraction;
        motors[drive] = table.mm_to_steps(drive, mm).value();
    }

    let mut queued = QueuedMove::new(plan);
    for drive in 0..table.num_drives() {
        let steps = motors[drive] - cursor.motor_pos[drive];
        let request = if drive >= table.num_axes() {
            let extruder = drive - table.num_axes();
            DriveRequest::extruder(drive as u8, steps, table.pressure_advance_clocks(extruder))
        } else {
            match (cursor.delta_direction, kinematics.delta_tower(drive)) {
                (Some(direction), Some(tower)) => DriveRequest::delta(
                    drive as u8,
                    steps,
                    DeltaAxisMove {
                        tower,
                        start_xy: [cursor.start[0], cursor.start[1]],
                        direction,
                        steps_per_mm: table.drive_steps_per_mm(drive),
                    },
                ),
                _ => DriveRequest::linear(drive as u8, steps),
            }
        };
        queued.push_request(request)?;
    }
    cursor.motor_pos = motors;
    Ok(queued)
}
